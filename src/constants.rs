//! Protocol constants for RTU-framed coil traffic
//!
//! Frames are Modbus RTU ADUs carried over a TCP stream (no MBAP header):
//! `[device address][function code][payload][CRC16 lo][CRC16 hi]`.
//! Limits follow from the 253-byte PDU ceiling of the RTU ADU.

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Maximum PDU (Protocol Data Unit) size
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum RTU ADU size: address + PDU + CRC
pub const MAX_FRAME_SIZE: usize = 1 + MAX_PDU_SIZE + CRC_LEN;

/// CRC trailer length
pub const CRC_LEN: usize = 2;

/// Bytes every response starts with: address, function code, and either
/// a byte count (FC01), an exception code, or the first echo byte (FC05/FC0F)
pub const RESPONSE_HEADER_LEN: usize = 3;

/// Exception response: address + function|0x80 + code + CRC
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// Write echo response (FC05/FC0F): address + function + 4 bytes + CRC
pub const WRITE_ECHO_FRAME_LEN: usize = 8;

/// Read coils request: address + function + start(2) + quantity(2) + CRC
pub const READ_REQUEST_FRAME_LEN: usize = 8;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum number of coils for FC01 (Read Coils)
///
/// Calculation for response PDU:
/// - Function Code: 1 byte
/// - Byte Count: 1 byte
/// - Coil Data: ceil(N / 8) bytes
/// - Total: 1 + 1 + ceil(N / 8) ≤ 253
/// - Therefore: N ≤ 251 × 8 = 2008, protocol caps at 2000
pub const MAX_READ_COILS: usize = 2000;

/// Maximum number of coils for FC15 (Write Multiple Coils)
///
/// Calculation for request PDU:
/// - Function Code: 1 byte
/// - Starting Address: 2 bytes
/// - Quantity of Outputs: 2 bytes
/// - Byte Count: 1 byte
/// - Coil Values: ceil(N / 8) bytes
/// - Total: 1 + 2 + 2 + 1 + ceil(N / 8) ≤ 253
/// - Protocol caps at 1968 (0x7B0)
pub const MAX_WRITE_COILS: usize = 1968;

/// Single-coil write value for ON
pub const COIL_ON: u16 = 0xFF00;

/// Single-coil write value for OFF
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Relay Bank Limits
// ============================================================================

/// Largest relay bank a hub drives
pub const MAX_RELAYS: u16 = 32;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Gateway Path Unavailable
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;

/// Gateway Target Device Failed to Respond
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;
