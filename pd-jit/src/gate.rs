//! Callback-return gate: the one place where native code hands control back to the
//! interpreter's dispatch loop.
//!
//! Native code never jumps into interpreter code directly. It returns one of the
//! [`ExitReason`] status codes and records the bytecode address execution resumes at
//! in the [`GateFrame`]. The dispatch loop then sees [`CALLBACK_RETURN`] as its next
//! opcode and applies the exit.
//!
//! Before returning through the gate, native code must leave the interpreter stack,
//! locals and pc-dependent state exactly as the interpreter expects them at the
//! resume address. This is not checked at runtime.

use std::ffi::c_void;

use crate::error::{JitError, JitResult};

/// Reserved opcode recognized by the dispatch loop as "returned from native code".
pub const CALLBACK_RETURN: u8 = 0xFF;

/// Status returned by per-instruction helpers to keep running the current segment.
pub const STATUS_CONTINUE: i32 = 0;

#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// Continue interpreting at the resume pc.
    Resume = 1,
    /// The program returned; the VM halts with the resume pc as its final ip.
    Return = 2,
    /// A safepoint was requested. Poll it, then continue at the resume pc.
    Safepoint = 3,
    /// A helper failed. The error is held by the host until the gate raises it.
    Exception = 4,
}

impl ExitReason {
    pub const ALL: [ExitReason; 4] = [
        ExitReason::Resume,
        ExitReason::Return,
        ExitReason::Safepoint,
        ExitReason::Exception,
    ];

    pub fn status(self) -> i32 {
        self as i32
    }

    pub fn from_status(status: i32) -> JitResult<Self> {
        match status {
            1 => Ok(ExitReason::Resume),
            2 => Ok(ExitReason::Return),
            3 => Ok(ExitReason::Safepoint),
            4 => Ok(ExitReason::Exception),
            other => Err(JitError::InvalidStatus(other)),
        }
    }

    pub fn index(self) -> usize {
        self as usize - 1
    }

    pub fn name(self) -> &'static str {
        match self {
            ExitReason::Resume => "resume",
            ExitReason::Return => "return",
            ExitReason::Safepoint => "safepoint",
            ExitReason::Exception => "exception",
        }
    }
}

/// Frame passed to native code in the first argument register.
#[repr(C)]
#[derive(Debug)]
pub struct GateFrame {
    /// Host interpreter state, opaque to the core.
    pub context: *mut c_void,
    pub resume_pc: u64,
}

impl GateFrame {
    pub fn new(context: *mut c_void) -> Self {
        Self {
            context,
            resume_pc: 0,
        }
    }

    /// Records where execution resumes and returns the status for `reason`.
    pub fn exit(&mut self, reason: ExitReason, resume_pc: usize) -> i32 {
        self.resume_pc = resume_pc as u64;
        reason.status()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateExit {
    pub reason: ExitReason,
    pub resume_pc: usize,
}

/// Signature of every segment entry point.
pub type NativeFn = unsafe extern "C" fn(*mut GateFrame) -> i32;

/// Address of the first native instruction of a committed segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeEntry(*const u8);

// SAFETY: the pointer targets immutable, executable code owned by the code buffer,
// which outlives every segment that hands the entry out.
unsafe impl Send for NativeEntry {}
// SAFETY: see above; the code is never written after the segment is committed.
unsafe impl Sync for NativeEntry {}

impl NativeEntry {
    pub(crate) fn new(ptr: *const u8) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0
    }
}

/// Runs native code until it reaches the gate.
///
/// # Safety
///
/// `entry` must come from a committed segment whose code was produced by an encoder
/// for the host that expects `frame.context` to point at its live interpreter state.
pub unsafe fn enter(entry: NativeEntry, frame: &mut GateFrame) -> JitResult<GateExit> {
    // SAFETY: committed segments start with a prologue following the `NativeFn` ABI.
    let native: NativeFn = unsafe { std::mem::transmute::<*const u8, NativeFn>(entry.as_ptr()) };
    let status = unsafe { native(frame as *mut GateFrame) };
    let reason = ExitReason::from_status(status)?;
    let resume_pc = usize::try_from(frame.resume_pc).map_err(|_| JitError::InvalidStatus(status))?;
    tracing::trace!(reason = reason.name(), resume_pc, "native code reached the gate");
    Ok(GateExit { reason, resume_pc })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_statuses_round_trip_and_continue_is_not_an_exit() {
        for reason in ExitReason::ALL {
            assert_eq!(ExitReason::from_status(reason.status()), Ok(reason));
        }
        assert_eq!(
            ExitReason::from_status(STATUS_CONTINUE),
            Err(JitError::InvalidStatus(0))
        );
        assert_eq!(
            ExitReason::from_status(-1),
            Err(JitError::InvalidStatus(-1))
        );
    }

    #[test]
    fn frame_exit_records_resume_pc() {
        let mut frame = GateFrame::new(std::ptr::null_mut());
        let status = frame.exit(ExitReason::Safepoint, 42);
        assert_eq!(status, 3);
        assert_eq!(frame.resume_pc, 42);
    }

    #[test]
    fn reason_indices_are_dense() {
        let indices: Vec<usize> = ExitReason::ALL.iter().map(|r| r.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }
}
