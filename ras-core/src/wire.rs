//! Byte encoding of RAS-CP commands/responses and of the counter and feature values.
//! All multi-byte fields are little endian.

use crate::protocol::{opcode, rsp_opcode, RascpCommand, RascpResponse, ResponseCode};

const OPCODE_LEN: usize = 1;
const COUNTER_LEN: usize = 2;
const FEATURES_LEN: usize = 4;

/// Encode a command for writing to the control point.
pub fn encode_command(cmd: &RascpCommand) -> Vec<u8> {
    let mut out = Vec::with_capacity(OPCODE_LEN + 4);
    match *cmd {
        RascpCommand::GetRecord { ranging_counter } => {
            out.push(opcode::GET_RECORD);
            out.extend_from_slice(&ranging_counter.to_le_bytes());
        }
        RascpCommand::AckRecord { ranging_counter } => {
            out.push(opcode::ACK_RECORD);
            out.extend_from_slice(&ranging_counter.to_le_bytes());
        }
        RascpCommand::RetrieveLostSegments {
            ranging_counter,
            first_segment,
            last_segment,
        } => {
            out.push(opcode::RETRIEVE_LOST_SEGMENTS);
            out.extend_from_slice(&ranging_counter.to_le_bytes());
            out.push(first_segment);
            out.push(last_segment);
        }
        RascpCommand::AbortOperation => out.push(opcode::ABORT_OPERATION),
        RascpCommand::SetFilter { filter } => {
            out.push(opcode::SET_FILTER);
            out.extend_from_slice(&filter.to_le_bytes());
        }
    }
    out
}

/// Decode a control point write. Lengths must match the opcode exactly.
pub fn decode_command(bytes: &[u8]) -> Result<RascpCommand, DecodeError> {
    let (&op, params) = bytes.split_first().ok_or(DecodeError::Empty)?;
    match op {
        opcode::GET_RECORD => Ok(RascpCommand::GetRecord {
            ranging_counter: le16_exact(params)?,
        }),
        opcode::ACK_RECORD => Ok(RascpCommand::AckRecord {
            ranging_counter: le16_exact(params)?,
        }),
        opcode::RETRIEVE_LOST_SEGMENTS => {
            if params.len() != COUNTER_LEN + 2 {
                return Err(DecodeError::BadLength {
                    expected: COUNTER_LEN + 2,
                    got: params.len(),
                });
            }
            Ok(RascpCommand::RetrieveLostSegments {
                ranging_counter: u16::from_le_bytes([params[0], params[1]]),
                first_segment: params[2],
                last_segment: params[3],
            })
        }
        opcode::ABORT_OPERATION => {
            if !params.is_empty() {
                return Err(DecodeError::BadLength {
                    expected: 0,
                    got: params.len(),
                });
            }
            Ok(RascpCommand::AbortOperation)
        }
        opcode::SET_FILTER => Ok(RascpCommand::SetFilter {
            filter: le16_exact(params)?,
        }),
        other => Err(DecodeError::UnknownOpcode(other)),
    }
}

/// Encode a response for indication on the control point.
pub fn encode_response(rsp: &RascpResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(OPCODE_LEN + 4);
    match *rsp {
        RascpResponse::CompleteRecord { ranging_counter } => {
            out.push(rsp_opcode::COMPLETE_RECORD);
            out.extend_from_slice(&ranging_counter.to_le_bytes());
        }
        RascpResponse::CompleteLostSegments {
            ranging_counter,
            first_segment,
            last_segment,
        } => {
            out.push(rsp_opcode::COMPLETE_LOST_SEGMENTS);
            out.extend_from_slice(&ranging_counter.to_le_bytes());
            out.push(first_segment);
            out.push(last_segment);
        }
        RascpResponse::ResponseCode(code) => {
            out.push(rsp_opcode::RESPONSE_CODE);
            out.push(code.to_u8());
        }
    }
    out
}

/// Decode a control point indication.
pub fn decode_response(bytes: &[u8]) -> Result<RascpResponse, DecodeError> {
    let (&op, params) = bytes.split_first().ok_or(DecodeError::Empty)?;
    match op {
        rsp_opcode::COMPLETE_RECORD => Ok(RascpResponse::CompleteRecord {
            ranging_counter: le16_exact(params)?,
        }),
        rsp_opcode::COMPLETE_LOST_SEGMENTS => {
            if params.len() != COUNTER_LEN + 2 {
                return Err(DecodeError::BadLength {
                    expected: COUNTER_LEN + 2,
                    got: params.len(),
                });
            }
            Ok(RascpResponse::CompleteLostSegments {
                ranging_counter: u16::from_le_bytes([params[0], params[1]]),
                first_segment: params[2],
                last_segment: params[3],
            })
        }
        rsp_opcode::RESPONSE_CODE => {
            if params.len() != 1 {
                return Err(DecodeError::BadLength {
                    expected: 1,
                    got: params.len(),
                });
            }
            ResponseCode::from_u8(params[0])
                .map(RascpResponse::ResponseCode)
                .ok_or(DecodeError::ReservedResponseCode(params[0]))
        }
        other => Err(DecodeError::UnknownOpcode(other)),
    }
}

/// Value of the Record Ready / Record Overwritten channels.
pub fn encode_counter(ranging_counter: u16) -> Vec<u8> {
    ranging_counter.to_le_bytes().to_vec()
}

pub fn decode_counter(bytes: &[u8]) -> Result<u16, DecodeError> {
    le16_exact(bytes)
}

pub fn encode_features(bits: u32) -> Vec<u8> {
    bits.to_le_bytes().to_vec()
}

pub fn decode_features(bytes: &[u8]) -> Result<u32, DecodeError> {
    match bytes {
        [a, b, c, d] => Ok(u32::from_le_bytes([*a, *b, *c, *d])),
        _ => Err(DecodeError::BadLength {
            expected: FEATURES_LEN,
            got: bytes.len(),
        }),
    }
}

fn le16_exact(bytes: &[u8]) -> Result<u16, DecodeError> {
    match bytes {
        [lo, hi] => Ok(u16::from_le_bytes([*lo, *hi])),
        _ => Err(DecodeError::BadLength {
            expected: COUNTER_LEN,
            got: bytes.len(),
        }),
    }
}

/// Error decoding a control point or channel value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("bad parameter length: expected {expected}, got {got}")]
    BadLength { expected: usize, got: usize },
    #[error("reserved response code {0:#04x}")]
    ReservedResponseCode(u8),
}
