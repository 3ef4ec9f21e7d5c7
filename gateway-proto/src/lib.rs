//! Wire-level primitives shared by the Modbus TCP client adapter and the
//! built-in virtual Modbus server: MBAP framing and 32-bit register byte
//! ordering. Kept dependency-light and protocol-only so both sides of a
//! loopback test session run the exact same conversions.

mod byteorder;
mod mbap;

pub use byteorder::{bytes_to_words, words_to_bytes_i32, words_to_bytes_u32, words_to_f32, ByteOrder};
pub use mbap::{FunctionCode, MbapHeader, MbapFrame, FrameError, EXCEPTION_BIT, EXCEPTION_ILLEGAL_FUNCTION};
