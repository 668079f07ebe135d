use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::registers::Region;

/// Largest number of words the Altherma interface reliably returns in one response.
pub const MAX_SAFE_READ_COUNT: u16 = 123;
/// Largest number of coils or discrete inputs a single read may request.
pub const MAX_BIT_READ_COUNT: u16 = 2000;

const COIL_ON: u16 = 0xFF00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 1,
    ReadDiscreteInputs = 2,
    ReadHoldings = 3,
    ReadInputs = 4,
    WriteCoil = 5,
    WriteHolding = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read { region: Region, address: u16, count: u16 },
    SetCoil { address: u16, value: bool },
    SetHolding { address: u16, value: u16 },
}

impl Operation {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Operation::Read { region: Region::Coil, .. } => FunctionCode::ReadCoils,
            Operation::Read { region: Region::Discrete, .. } => FunctionCode::ReadDiscreteInputs,
            Operation::Read { region: Region::Holding, .. } => FunctionCode::ReadHoldings,
            Operation::Read { region: Region::Input, .. } => FunctionCode::ReadInputs,
            Operation::SetCoil { .. } => FunctionCode::WriteCoil,
            Operation::SetHolding { .. } => FunctionCode::WriteHolding,
        }
    }

    fn payload(&self) -> [u16; 2] {
        match *self {
            Operation::Read { address, count, .. } => [address, count],
            Operation::SetCoil { address, value } => [address, if value { COIL_ON } else { 0 }],
            Operation::SetHolding { address, value } => [address, value],
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub function_code: u8,
    pub kind: ResponseKind,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseKind {
    /// Exception response; carries the exception code.
    ErrorCode(u8),
    /// Packed bits of a coil or discrete input read, least significant bit first.
    Bits { bytes: Vec<u8> },
    Words { values: Vec<u16> },
    /// Echo of a single coil or register write.
    Written { address: u16, value: u16 },
}

/// Unpack `count` bits from a coil/discrete input response.
pub fn unpack_bits(bytes: &[u8], count: u16) -> Option<Vec<bool>> {
    let count = usize::from(count);
    if bytes.len() * 8 < count {
        return None;
    }
    Some((0..count).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect())
}

/// Modbus TCP (MBAP) framing.
pub struct ModbusTCPCodec {}

impl Encoder<&Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let function_code = req.operation.function_code() as u8;
        let [address, value] = req.operation.payload();
        dst.extend(req.transaction_id.to_be_bytes());
        // Protocol 0; 6 bytes follow: unit id, function code, two 16-bit fields.
        dst.extend(&[0, 0, 0, 6, req.device_id, function_code]);
        dst.extend(address.to_be_bytes());
        dst.extend(value.to_be_bytes());
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some((header, _)) = src.split_first_chunk::<6>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let proto = u16::from_be_bytes([header[2], header[3]]);
            let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            if proto != 0 || length < 3 {
                // Not a frame boundary, resynchronize one byte further.
                src.advance(1);
                continue;
            }
            if src.len() < 6 + length {
                src.reserve(6 + length - src.len());
                return Ok(None);
            }
            let frame = src.split_to(6 + length);
            let [device_id, function_code, body @ ..] = &frame[6..] else {
                continue;
            };
            let (device_id, function_code) = (*device_id, *function_code);
            let Some(kind) = decode_body(function_code, body) else {
                debug!(message = "discarding malformed frame", transaction_id, function_code, ?body);
                continue;
            };
            return Ok(Some(Response { device_id, transaction_id, function_code, kind }));
        }
    }
}

fn decode_body(function_code: u8, body: &[u8]) -> Option<ResponseKind> {
    if function_code > 0x80 {
        return Some(ResponseKind::ErrorCode(*body.first()?));
    }
    let function: FunctionCode = num_traits::FromPrimitive::from_u8(function_code)?;
    Some(match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let (count, bytes) = body.split_first()?;
            let bytes = bytes.get(..usize::from(*count))?;
            ResponseKind::Bits { bytes: bytes.to_vec() }
        }
        FunctionCode::ReadHoldings | FunctionCode::ReadInputs => {
            let (count, bytes) = body.split_first()?;
            let bytes = bytes.get(..usize::from(*count))?;
            if bytes.len() % 2 != 0 {
                return None;
            }
            let values = bytes.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect();
            ResponseKind::Words { values }
        }
        FunctionCode::WriteCoil | FunctionCode::WriteHolding => {
            let [a, b, c, d] = body else { return None };
            ResponseKind::Written {
                address: u16::from_be_bytes([*a, *b]),
                value: u16::from_be_bytes([*c, *d]),
            }
        }
    })
}
