//! RTU frame encoding and decoding for coil commands
//!
//! A [`FrameCodec`] is bound to one device address and translates between
//! typed [`Command`]s / [`Response`]s and raw frames:
//!
//! ```text
//! ┌──────────┬──────────┬───────────────┬─────────────┐
//! │ Address  │ Function │ Payload       │ CRC16 (LE)  │
//! │ 1 byte   │ 1 byte   │ 0..252 bytes  │ 2 bytes     │
//! └──────────┴──────────┴───────────────┴─────────────┘
//! ```
//!
//! Field values are big-endian; coil bits are packed LSB-first, coil `n`
//! of a request landing in bit `n % 8` of byte `n / 8`. Coil addresses on
//! the wire are 0-based.
//!
//! The client side uses [`FrameCodec::encode`] and [`FrameCodec::decode`];
//! the server side ([`FrameCodec::decode_request`],
//! [`FrameCodec::encode_response`]) backs the bundled simulator.

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_MODBUS};

use crate::constants::{
    COIL_OFF, COIL_ON, CRC_LEN, EXCEPTION_FLAG, EXCEPTION_FRAME_LEN, FC_READ_COILS,
    FC_WRITE_MULTIPLE_COILS, FC_WRITE_SINGLE_COIL, MAX_PDU_SIZE, MAX_READ_COILS,
    MAX_WRITE_COILS, READ_REQUEST_FRAME_LEN, RESPONSE_HEADER_LEN, WRITE_ECHO_FRAME_LEN,
};
use crate::error::{ProtocolError, RelayError, RelayResult};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS over `data`
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// A coil command addressed in wire (0-based) coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// FC01
    ReadCoils { start: u16, count: u16 },
    /// FC05
    WriteCoil { address: u16, value: bool },
    /// FC0F
    WriteCoils { start: u16, bits: Vec<bool> },
}

impl Command {
    pub fn function_code(&self) -> u8 {
        match self {
            Command::ReadCoils { .. } => FC_READ_COILS,
            Command::WriteCoil { .. } => FC_WRITE_SINGLE_COIL,
            Command::WriteCoils { .. } => FC_WRITE_MULTIPLE_COILS,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::ReadCoils { .. } => "read_coils",
            Command::WriteCoil { .. } => "write_coil",
            Command::WriteCoils { .. } => "write_coils",
        }
    }
}

/// A decoded response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// FC01 coil states, trimmed to the requested count
    Coils(Vec<bool>),
    /// FC05 echo
    CoilWritten { address: u16, value: bool },
    /// FC0F echo
    CoilsWritten { start: u16, count: u16 },
    /// Device exception; `function` is the original (unflagged) code
    Exception { function: u8, code: u8 },
}

/// Frame codec bound to one device address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    device_address: u8,
}

impl FrameCodec {
    pub const fn new(device_address: u8) -> Self {
        Self { device_address }
    }

    pub fn device_address(&self) -> u8 {
        self.device_address
    }

    // ========================================================================
    // Client side
    // ========================================================================

    /// Encode a request frame.
    ///
    /// Fails only when the command cannot be represented: zero or too many
    /// coils, or a range running past address 0xFFFF.
    pub fn encode(&self, command: &Command) -> RelayResult<Bytes> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(self.device_address);
        buf.put_u8(command.function_code());

        match command {
            Command::ReadCoils { start, count } => {
                check_range(*start, *count as usize, MAX_READ_COILS)?;
                buf.put_u16(*start);
                buf.put_u16(*count);
            },
            Command::WriteCoil { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(if *value { COIL_ON } else { COIL_OFF });
            },
            Command::WriteCoils { start, bits } => {
                check_range(*start, bits.len(), MAX_WRITE_COILS)?;
                let packed = pack_bits(bits);
                buf.put_u16(*start);
                buf.put_u16(bits.len() as u16);
                buf.put_u8(packed.len() as u8);
                buf.put_slice(&packed);
            },
        }

        Ok(seal(buf))
    }

    /// Decode the response to `expected`.
    ///
    /// Checks run in order: frame length, CRC, device address, exception
    /// flag, function code, payload.
    pub fn decode(&self, frame: &[u8], expected: &Command) -> Result<Response, ProtocolError> {
        let min_len = RESPONSE_HEADER_LEN + CRC_LEN;
        if frame.len() < min_len {
            return Err(ProtocolError::Truncated {
                expected: min_len,
                actual: frame.len(),
            });
        }

        let frame_len = Self::response_len(&frame[..RESPONSE_HEADER_LEN])?;
        check_length(frame, frame_len)?;
        verify_crc(frame)?;

        if frame[0] != self.device_address {
            return Err(ProtocolError::UnexpectedDevice {
                expected: self.device_address,
                actual: frame[0],
            });
        }

        let expected_fc = expected.function_code();
        let function = frame[1];
        if function & EXCEPTION_FLAG != 0 {
            if function & !EXCEPTION_FLAG != expected_fc {
                return Err(ProtocolError::UnexpectedFunctionCode {
                    expected: expected_fc,
                    actual: function,
                });
            }
            return Ok(Response::Exception {
                function: expected_fc,
                code: frame[2],
            });
        }
        if function != expected_fc {
            return Err(ProtocolError::UnexpectedFunctionCode {
                expected: expected_fc,
                actual: function,
            });
        }

        let payload = &frame[2..frame_len - CRC_LEN];
        match expected {
            Command::ReadCoils { count, .. } => {
                let byte_count = payload[0] as usize;
                let needed = (*count as usize).div_ceil(8);
                if byte_count != needed {
                    return Err(ProtocolError::InvalidPayload {
                        message: format!(
                            "byte count {} does not cover {} coils",
                            byte_count, count
                        ),
                    });
                }
                Ok(Response::Coils(unpack_bits(&payload[1..], *count as usize)))
            },
            Command::WriteCoil { address, value } => {
                let echoed_address = u16::from_be_bytes([payload[0], payload[1]]);
                let echoed_value = match u16::from_be_bytes([payload[2], payload[3]]) {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => {
                        return Err(ProtocolError::InvalidPayload {
                            message: format!("coil value 0x{:04X}", other),
                        })
                    },
                };
                if echoed_address != *address || echoed_value != *value {
                    return Err(ProtocolError::EchoMismatch {
                        message: format!(
                            "sent coil {}={}, echoed coil {}={}",
                            address, value, echoed_address, echoed_value
                        ),
                    });
                }
                Ok(Response::CoilWritten {
                    address: echoed_address,
                    value: echoed_value,
                })
            },
            Command::WriteCoils { start, bits } => {
                let echoed_start = u16::from_be_bytes([payload[0], payload[1]]);
                let echoed_count = u16::from_be_bytes([payload[2], payload[3]]);
                if echoed_start != *start || echoed_count as usize != bits.len() {
                    return Err(ProtocolError::EchoMismatch {
                        message: format!(
                            "sent {} coils at {}, echoed {} at {}",
                            bits.len(),
                            start,
                            echoed_count,
                            echoed_start
                        ),
                    });
                }
                Ok(Response::CoilsWritten {
                    start: echoed_start,
                    count: echoed_count,
                })
            },
        }
    }

    /// Total response frame length announced by its first three bytes
    pub fn response_len(header: &[u8]) -> Result<usize, ProtocolError> {
        if header.len() < RESPONSE_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                expected: RESPONSE_HEADER_LEN,
                actual: header.len(),
            });
        }
        match header[1] {
            f if f & EXCEPTION_FLAG != 0 => Ok(EXCEPTION_FRAME_LEN),
            FC_READ_COILS => Ok(RESPONSE_HEADER_LEN + header[2] as usize + CRC_LEN),
            FC_WRITE_SINGLE_COIL | FC_WRITE_MULTIPLE_COILS => Ok(WRITE_ECHO_FRAME_LEN),
            function => Err(ProtocolError::UnsupportedFunction { function }),
        }
    }

    // ========================================================================
    // Server side
    // ========================================================================

    /// Total request frame length, given at least the first 7 bytes.
    ///
    /// Unknown function codes are assumed to carry a fixed 4-byte payload.
    pub fn request_len(prefix: &[u8]) -> Result<usize, ProtocolError> {
        const PREFIX: usize = 7;
        if prefix.len() < PREFIX {
            return Err(ProtocolError::Truncated {
                expected: PREFIX,
                actual: prefix.len(),
            });
        }
        match prefix[1] {
            FC_WRITE_MULTIPLE_COILS => {
                let byte_count = prefix[6] as usize;
                // function + start + quantity + byte count + data
                if 1 + 2 + 2 + 1 + byte_count > MAX_PDU_SIZE {
                    return Err(ProtocolError::InvalidPayload {
                        message: format!("byte count {} exceeds PDU limit", byte_count),
                    });
                }
                Ok(PREFIX + byte_count + CRC_LEN)
            },
            _ => Ok(READ_REQUEST_FRAME_LEN),
        }
    }

    /// Decode a request frame addressed to this device
    pub fn decode_request(&self, frame: &[u8]) -> Result<Command, ProtocolError> {
        if frame.len() < READ_REQUEST_FRAME_LEN {
            return Err(ProtocolError::Truncated {
                expected: READ_REQUEST_FRAME_LEN,
                actual: frame.len(),
            });
        }
        let frame_len = Self::request_len(frame)?;
        check_length(frame, frame_len)?;
        verify_crc(frame)?;

        if frame[0] != self.device_address {
            return Err(ProtocolError::UnexpectedDevice {
                expected: self.device_address,
                actual: frame[0],
            });
        }

        let first = u16::from_be_bytes([frame[2], frame[3]]);
        let second = u16::from_be_bytes([frame[4], frame[5]]);
        match frame[1] {
            FC_READ_COILS => Ok(Command::ReadCoils {
                start: first,
                count: second,
            }),
            FC_WRITE_SINGLE_COIL => match second {
                COIL_ON | COIL_OFF => Ok(Command::WriteCoil {
                    address: first,
                    value: second == COIL_ON,
                }),
                other => Err(ProtocolError::InvalidPayload {
                    message: format!("coil value 0x{:04X}", other),
                }),
            },
            FC_WRITE_MULTIPLE_COILS => {
                let data = &frame[7..frame_len - CRC_LEN];
                if data.len() != (second as usize).div_ceil(8) {
                    return Err(ProtocolError::InvalidPayload {
                        message: format!("{} data bytes for {} coils", data.len(), second),
                    });
                }
                Ok(Command::WriteCoils {
                    start: first,
                    bits: unpack_bits(data, second as usize),
                })
            },
            function => Err(ProtocolError::UnsupportedFunction { function }),
        }
    }

    /// Encode a response frame from this device
    pub fn encode_response(&self, response: &Response) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(self.device_address);

        match response {
            Response::Coils(bits) => {
                let packed = pack_bits(bits);
                buf.put_u8(FC_READ_COILS);
                buf.put_u8(packed.len() as u8);
                buf.put_slice(&packed);
            },
            Response::CoilWritten { address, value } => {
                buf.put_u8(FC_WRITE_SINGLE_COIL);
                buf.put_u16(*address);
                buf.put_u16(if *value { COIL_ON } else { COIL_OFF });
            },
            Response::CoilsWritten { start, count } => {
                buf.put_u8(FC_WRITE_MULTIPLE_COILS);
                buf.put_u16(*start);
                buf.put_u16(*count);
            },
            Response::Exception { function, code } => {
                buf.put_u8(function | EXCEPTION_FLAG);
                buf.put_u8(*code);
            },
        }

        seal(buf)
    }
}

/// Pack coil states LSB-first
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (i, _) in bits.iter().enumerate().filter(|(_, on)| **on) {
        packed[i / 8] |= 1 << (i % 8);
    }
    packed
}

/// Unpack `count` coil states LSB-first; padding bits are dropped
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0))
        .collect()
}

fn seal(mut buf: BytesMut) -> Bytes {
    let crc = crc16(&buf);
    buf.put_u16_le(crc);
    buf.freeze()
}

fn check_range(start: u16, count: usize, max: usize) -> RelayResult<()> {
    if count == 0 || count > max {
        return Err(RelayError::encode(format!(
            "coil count {} outside 1..={}",
            count, max
        )));
    }
    if start as usize + count > u16::MAX as usize + 1 {
        return Err(RelayError::encode(format!(
            "coil range {}+{} exceeds address space",
            start, count
        )));
    }
    Ok(())
}

fn check_length(frame: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if frame.len() < expected {
        return Err(ProtocolError::Truncated {
            expected,
            actual: frame.len(),
        });
    }
    if frame.len() > expected {
        return Err(ProtocolError::LengthMismatch {
            expected,
            actual: frame.len(),
        });
    }
    Ok(())
}

fn verify_crc(frame: &[u8]) -> Result<(), ProtocolError> {
    let (body, trailer) = frame.split_at(frame.len() - CRC_LEN);
    let expected = crc16(body);
    let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}
