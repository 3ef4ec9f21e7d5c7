use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Modbus function codes the gateway speaks, on both the client
/// (tokio-modbus, elsewhere) and the virtual server (this crate) side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
    Other(u8),
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadCoils => 0x01,
            FunctionCode::ReadDiscreteInputs => 0x02,
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
            FunctionCode::WriteSingleCoil => 0x05,
            FunctionCode::WriteSingleRegister => 0x06,
            FunctionCode::WriteMultipleCoils => 0x0F,
            FunctionCode::WriteMultipleRegisters => 0x10,
            FunctionCode::Other(c) => c,
        }
    }
}

impl From<u8> for FunctionCode {
    fn from(c: u8) -> Self {
        match c {
            0x01 => FunctionCode::ReadCoils,
            0x02 => FunctionCode::ReadDiscreteInputs,
            0x03 => FunctionCode::ReadHoldingRegisters,
            0x04 => FunctionCode::ReadInputRegisters,
            0x05 => FunctionCode::WriteSingleCoil,
            0x06 => FunctionCode::WriteSingleRegister,
            0x0F => FunctionCode::WriteMultipleCoils,
            0x10 => FunctionCode::WriteMultipleRegisters,
            other => FunctionCode::Other(other),
        }
    }
}

/// Exception bit set on the function code of an error response.
pub const EXCEPTION_BIT: u8 = 0x80;
/// Illegal Function exception code, returned by the virtual server for any
/// function code it does not implement.
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short: need {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },
    #[error("MBAP protocol id must be 0, got {0}")]
    BadProtocolId(u16),
    #[error("MBAP length field {0} exceeds maximum PDU size")]
    LengthOverflow(u16),
}

/// The 7-byte MBAP header that precedes every Modbus TCP PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of unit_id + PDU that follows.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub const LEN: usize = 7;

    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < Self::LEN {
            return Err(FrameError::TooShort { need: Self::LEN, have: buf.len() });
        }
        let mut cursor = buf;
        let transaction_id = cursor.get_u16();
        let protocol_id = cursor.get_u16();
        if protocol_id != 0 {
            return Err(FrameError::BadProtocolId(protocol_id));
        }
        let length = cursor.get_u16();
        let unit_id = cursor.get_u8();
        Ok(Self { transaction_id, protocol_id: 0, length, unit_id })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u16(self.transaction_id);
        out.put_u16(0);
        out.put_u16(self.length);
        out.put_u8(self.unit_id);
    }
}

/// A fully decoded MBAP frame: header plus the function code and payload
/// bytes of its PDU.
#[derive(Debug, Clone)]
pub struct MbapFrame {
    pub header: MbapHeader,
    pub function: FunctionCode,
    pub payload: Vec<u8>,
}

impl MbapFrame {
    /// Parse one complete frame from the front of `buf`, returning the
    /// number of bytes consumed on success. Returns `TooShort` if the
    /// buffer doesn't yet hold a full frame (caller should wait for more
    /// bytes, not treat it as a hard error).
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        let header = MbapHeader::parse(buf)?;
        let pdu_len = header
            .length
            .checked_sub(1)
            .ok_or(FrameError::LengthOverflow(header.length))? as usize;
        let total = MbapHeader::LEN + pdu_len;
        if buf.len() < total {
            return Err(FrameError::TooShort { need: total, have: buf.len() });
        }
        let function = FunctionCode::from(buf[MbapHeader::LEN]);
        let payload = buf[MbapHeader::LEN + 1..total].to_vec();
        Ok((Self { header, function, payload }, total))
    }

    /// Encode a success response, computing `length` from the PDU size.
    pub fn encode_response(transaction_id: u16, unit_id: u8, function: FunctionCode, payload: &[u8]) -> BytesMut {
        let mut out = BytesMut::with_capacity(MbapHeader::LEN + 1 + payload.len());
        let header = MbapHeader {
            transaction_id,
            protocol_id: 0,
            length: (1 + 1 + payload.len()) as u16,
            unit_id,
        };
        header.encode(&mut out);
        out.put_u8(function.code());
        out.put_slice(payload);
        out
    }

    /// Encode an exception response: function code with the exception bit
    /// set, followed by a single exception code byte.
    pub fn encode_exception(transaction_id: u16, unit_id: u8, function: FunctionCode, exception_code: u8) -> BytesMut {
        let mut out = BytesMut::with_capacity(MbapHeader::LEN + 2);
        let header = MbapHeader { transaction_id, protocol_id: 0, length: 3, unit_id };
        header.encode(&mut out);
        out.put_u8(function.code() | EXCEPTION_BIT);
        out.put_u8(exception_code);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_read_holding_registers_response() {
        let payload = [0x04u8, 0x00, 0x01, 0x00, 0x02];
        let frame = MbapFrame::encode_response(7, 1, FunctionCode::ReadHoldingRegisters, &payload);
        let (parsed, consumed) = MbapFrame::parse(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(parsed.header.transaction_id, 7);
        assert_eq!(parsed.header.unit_id, 1);
        assert!(matches!(parsed.function, FunctionCode::ReadHoldingRegisters));
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn exception_response_sets_high_bit() {
        let frame = MbapFrame::encode_exception(1, 1, FunctionCode::Other(0x2B), EXCEPTION_ILLEGAL_FUNCTION);
        let (parsed, _) = MbapFrame::parse(&frame).unwrap();
        assert_eq!(parsed.function.code(), 0x2B | EXCEPTION_BIT);
        assert_eq!(parsed.payload, vec![EXCEPTION_ILLEGAL_FUNCTION]);
    }

    #[test]
    fn rejects_nonzero_protocol_id() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_u16(1); // protocol id must be 0
        buf.put_u16(2);
        buf.put_u8(1);
        buf.put_u8(0x03);
        assert!(matches!(MbapFrame::parse(&buf), Err(FrameError::BadProtocolId(1))));
    }

    #[test]
    fn reports_too_short_for_partial_frame() {
        let payload = [0x04u8, 0x00, 0x01];
        let frame = MbapFrame::encode_response(1, 1, FunctionCode::ReadHoldingRegisters, &payload);
        let partial = &frame[..frame.len() - 1];
        assert!(matches!(MbapFrame::parse(partial), Err(FrameError::TooShort { .. })));
    }
}
