//! Call-threaded native code for the VM.
//!
//! Every bytecode instruction becomes a call into [`jit_native_step`], which runs the
//! interpreter's own implementation of that instruction, followed by a status check
//! that leaves the segment as soon as a helper returns a gate exit. The epilogue calls
//! [`jit_native_exit`] with the pc after the segment. Interpreter state is therefore
//! exactly what the interpreter expects at every gate exit.

use std::cell::RefCell;

use super::{Vm, VmError};
use crate::bytecode::Instruction;
use crate::encoder::{Emitter, InstructionEncoder};
use crate::error::{JitError, JitResult};
use crate::gate::{ExitReason, GateFrame, STATUS_CONTINUE};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
use aarch64 as backend;
#[cfg(target_arch = "x86_64")]
use x86_64 as backend;

#[derive(Clone, Copy, Debug, Default)]
pub struct NativeEncoder;

impl NativeEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl InstructionEncoder for NativeEncoder {
    fn prologue(&mut self, emit: &mut Emitter<'_>) -> JitResult<()> {
        backend::emit_prologue(emit)
    }

    fn encode(&mut self, instruction: &Instruction, emit: &mut Emitter<'_>) -> JitResult<()> {
        let pc = u32::try_from(instruction.pc).map_err(|_| JitError::EncodingFailure {
            pc: instruction.pc,
            opcode: instruction.opcode,
            reason: "pc does not fit in 32 bits".to_string(),
        })?;
        backend::emit_step(emit, helper_address(jit_native_step), pc)
    }

    fn epilogue(&mut self, resume_pc: usize, emit: &mut Emitter<'_>) -> JitResult<()> {
        let pc = u32::try_from(resume_pc).map_err(|_| JitError::EncodingFailure {
            pc: resume_pc,
            opcode: 0,
            reason: "resume pc does not fit in 32 bits".to_string(),
        })?;
        backend::emit_exit(emit, helper_address(jit_native_exit), pc)
    }
}

type NativeHelper = extern "C" fn(*mut GateFrame, u32) -> i32;

fn helper_address(helper: NativeHelper) -> u64 {
    helper as *const () as usize as u64
}

thread_local! {
    static JIT_BRIDGE_ERROR: RefCell<Option<VmError>> = const { RefCell::new(None) };
}

pub(super) fn clear_bridge_error() {
    JIT_BRIDGE_ERROR.with(|slot| {
        *slot.borrow_mut() = None;
    });
}

pub(super) fn take_bridge_error() -> Option<VmError> {
    JIT_BRIDGE_ERROR.with(|slot| slot.borrow_mut().take())
}

fn set_bridge_error(error: VmError) {
    JIT_BRIDGE_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(error);
    });
}

extern "C" fn jit_native_step(frame_ptr: *mut GateFrame, pc: u32) -> i32 {
    let pc = pc as usize;
    // SAFETY: native code passes through the frame it was entered with.
    let Some(frame) = (unsafe { frame_ptr.as_mut() }) else {
        set_bridge_error(VmError::NativeFault(pc));
        return ExitReason::Exception.status();
    };
    // SAFETY: `Vm::enter_native` stores a pointer to the live VM in the frame context.
    let Some(vm) = (unsafe { frame.context.cast::<Vm>().as_mut() }) else {
        set_bridge_error(VmError::NativeFault(pc));
        return frame.exit(ExitReason::Exception, pc);
    };

    if vm.safepoint.is_requested() {
        return frame.exit(ExitReason::Safepoint, pc);
    }
    match vm.step_native(pc) {
        Ok(None) => STATUS_CONTINUE,
        Ok(Some(reason)) => frame.exit(reason, vm.ip),
        Err(err) => {
            set_bridge_error(err);
            frame.exit(ExitReason::Exception, vm.ip)
        }
    }
}

extern "C" fn jit_native_exit(frame_ptr: *mut GateFrame, resume_pc: u32) -> i32 {
    // SAFETY: see `jit_native_step`.
    match unsafe { frame_ptr.as_mut() } {
        Some(frame) => frame.exit(ExitReason::Resume, resume_pc as usize),
        None => {
            set_bridge_error(VmError::NativeFault(resume_pc as usize));
            ExitReason::Exception.status()
        }
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod backend {
    use crate::encoder::Emitter;
    use crate::error::{JitError, JitResult};

    fn unsupported(pc: u32) -> JitError {
        JitError::EncodingFailure {
            pc: pc as usize,
            opcode: 0,
            reason: format!("no native encoder for {}", std::env::consts::ARCH),
        }
    }

    pub(super) fn emit_prologue(_emit: &mut Emitter<'_>) -> JitResult<()> {
        Err(unsupported(0))
    }

    pub(super) fn emit_step(_emit: &mut Emitter<'_>, _helper: u64, pc: u32) -> JitResult<()> {
        Err(unsupported(pc))
    }

    pub(super) fn emit_exit(_emit: &mut Emitter<'_>, _helper: u64, pc: u32) -> JitResult<()> {
        Err(unsupported(pc))
    }
}
