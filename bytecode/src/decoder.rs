use core::fmt;

use crate::instr::{Instr, INSTR_SIZE};
use crate::op::Op;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The instruction index lies beyond the stream.
    OutOfRange { index: usize, count: usize },
    /// The opcode slot holds no known opcode.
    BadOpcode { code: i16 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::OutOfRange { index, count } => {
                write!(f, "instruction index {index} out of range (0..{count})")
            }
            DecodeError::BadOpcode { code } => {
                write!(f, "unknown opcode {code}")
            }
        }
    }
}

/// Number of whole instructions in a packed stream.
pub fn instr_count(bytes: &[u8]) -> usize {
    bytes.len() / INSTR_SIZE
}

/// Decode the instruction at `index`.
pub fn decode_at(bytes: &[u8], index: usize) -> Result<Instr, DecodeError> {
    let offset = index * INSTR_SIZE;
    if offset + INSTR_SIZE > bytes.len() {
        return Err(DecodeError::OutOfRange {
            index,
            count: instr_count(bytes),
        });
    }
    let slot = |i: usize| {
        i16::from_le_bytes([bytes[offset + 2 * i], bytes[offset + 2 * i + 1]])
    };
    let code = slot(0);
    let op = u8::try_from(code)
        .ok()
        .and_then(|b| Op::try_from(b).ok())
        .ok_or(DecodeError::BadOpcode { code })?;
    Ok(Instr::new(op, slot(1), slot(2)))
}

/// Iterate over a packed stream, stopping at the end or at the first
/// malformed triple. Disassembly aid; the VM decodes by index.
pub struct Decoder<'a> {
    bytes: &'a [u8],
    index: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Decoder { bytes, index: 0 }
    }
}

impl Iterator for Decoder<'_> {
    type Item = Instr;

    fn next(&mut self) -> Option<Instr> {
        let instr = decode_at(self.bytes, self.index).ok()?;
        self.index += 1;
        Some(instr)
    }
}
