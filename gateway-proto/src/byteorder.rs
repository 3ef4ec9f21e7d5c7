use serde::{Deserialize, Serialize};

/// Reordering of two consecutive 16-bit Modbus registers into one 32-bit
/// scalar. `ABCD` is the protocol default (plain big-endian); the other
/// three name swapped word/byte orders seen on real Modicon-descendant
/// devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ByteOrder {
    #[default]
    Abcd,
    Dcba,
    Badc,
    Cdab,
}

/// Combine `(reg0, reg1)` into the 32-bit word the given byte order implies,
/// without interpreting sign or fractional meaning.
fn combine(reg0: u16, reg1: u16, order: ByteOrder) -> u32 {
    match order {
        ByteOrder::Abcd => (reg0 as u32) << 16 | reg1 as u32,
        ByteOrder::Dcba => (reg1 as u32) << 16 | reg0 as u32,
        ByteOrder::Badc => (reg0.swap_bytes() as u32) << 16 | reg1.swap_bytes() as u32,
        ByteOrder::Cdab => (reg1.swap_bytes() as u32) << 16 | reg0.swap_bytes() as u32,
    }
}

/// Two registers as an unsigned 32-bit integer.
pub fn words_to_bytes_u32(reg0: u16, reg1: u16, order: ByteOrder) -> u32 {
    combine(reg0, reg1, order)
}

/// Two registers as a signed 32-bit integer (two's complement of the same bits).
pub fn words_to_bytes_i32(reg0: u16, reg1: u16, order: ByteOrder) -> i32 {
    combine(reg0, reg1, order) as i32
}

/// Two registers as an IEEE-754 single-precision float, same bit reordering.
pub fn words_to_f32(reg0: u16, reg1: u16, order: ByteOrder) -> f32 {
    f32::from_bits(combine(reg0, reg1, order))
}

/// Inverse of [`combine`]: split a 32-bit word back into two registers for a
/// given byte order, used by the write path and the virtual server.
pub fn bytes_to_words(value: u32, order: ByteOrder) -> (u16, u16) {
    let hi = (value >> 16) as u16;
    let lo = value as u16;
    match order {
        ByteOrder::Abcd => (hi, lo),
        ByteOrder::Dcba => (lo, hi),
        ByteOrder::Badc => (hi.swap_bytes(), lo.swap_bytes()),
        ByteOrder::Cdab => (lo.swap_bytes(), hi.swap_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // pi = 0x40490FD0 in IEEE754 single precision.
    const REG0: u16 = 0x4049;
    const REG1: u16 = 0x0FD0;

    #[test]
    fn abcd_is_plain_big_endian() {
        let v = words_to_f32(REG0, REG1, ByteOrder::Abcd);
        assert!((v - std::f32::consts::PI).abs() < 1e-5);
    }

    #[test]
    fn dcba_swaps_words() {
        let v = words_to_bytes_u32(REG0, REG1, ByteOrder::Dcba);
        assert_eq!(v, (REG1 as u32) << 16 | REG0 as u32);
    }

    #[test]
    fn badc_swaps_bytes_within_words() {
        let v = words_to_bytes_u32(REG0, REG1, ByteOrder::Badc);
        assert_eq!(v, (REG0.swap_bytes() as u32) << 16 | REG1.swap_bytes() as u32);
    }

    #[test]
    fn cdab_swaps_words_and_bytes() {
        let v = words_to_bytes_u32(REG0, REG1, ByteOrder::Cdab);
        assert_eq!(v, (REG1.swap_bytes() as u32) << 16 | REG0.swap_bytes() as u32);
    }

    #[test]
    fn round_trips_through_bytes_to_words() {
        for order in [ByteOrder::Abcd, ByteOrder::Dcba, ByteOrder::Badc, ByteOrder::Cdab] {
            let value = words_to_bytes_u32(REG0, REG1, order);
            let (r0, r1) = bytes_to_words(value, order);
            assert_eq!(words_to_bytes_u32(r0, r1, order), value);
        }
    }
}
