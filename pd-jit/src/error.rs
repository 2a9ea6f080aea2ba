use std::fmt;
use std::ops::Range;

/// Errors raised by the native code buffer, the segment table and the translation driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JitError {
    /// The executable region could not be reserved. Disables the JIT for the process.
    #[error("failed to reserve {requested} bytes of executable memory: {reason}")]
    AllocationFailure { requested: usize, reason: String },

    /// A translation needed more native bytes than the buffer has left.
    #[error("code buffer exhausted: requested {requested} bytes, {available} available")]
    BufferExhausted { requested: usize, available: usize },

    /// The instruction encoder declined an instruction.
    #[error("cannot encode opcode 0x{opcode:02X} at pc {pc}: {reason}")]
    EncodingFailure {
        pc: usize,
        opcode: u8,
        reason: String,
    },

    /// A segment range intersects a committed one.
    #[error("segment {new:?} overlaps committed segment {existing:?}")]
    Overlap {
        new: Range<usize>,
        existing: Range<usize>,
    },

    /// Translation was not attempted.
    #[error("translation at pc {pc} declined: {reason}")]
    Declined { pc: usize, reason: DeclineReason },

    #[error("page protection change failed: {0}")]
    Protection(String),

    #[error("jit runtime is already initialized")]
    AlreadyInitialized,

    /// Native code returned a status that is not a gate exit.
    #[error("native code returned invalid exit status {0}")]
    InvalidStatus(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    /// The first instruction is a barrier or cannot be decoded.
    EmptyRange,
    /// The pc lies inside a committed segment but is not its start.
    InsideSegment,
    /// An earlier translation from this pc failed.
    Blocked,
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclineReason::EmptyRange => write!(f, "no translatable instruction"),
            DeclineReason::InsideSegment => write!(f, "inside a committed segment"),
            DeclineReason::Blocked => write!(f, "earlier translation failed"),
        }
    }
}

impl JitError {
    /// Recoverable errors abort a single translation and leave the JIT usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            JitError::BufferExhausted { .. }
                | JitError::EncodingFailure { .. }
                | JitError::Declined { .. }
        )
    }
}

pub type JitResult<T> = Result<T, JitError>;
