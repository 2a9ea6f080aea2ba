use crate::encoder::Emitter;
use crate::error::JitResult;

// rbx holds the frame pointer for the whole segment.

#[cfg(not(windows))]
const PROLOGUE: &[u8] = &[
    0x53, // push rbx
    0x48, 0x89, 0xFB, // mov rbx, rdi
];

#[cfg(windows)]
const PROLOGUE: &[u8] = &[
    0x53, // push rbx
    0x48, 0x89, 0xCB, // mov rbx, rcx
    0x48, 0x83, 0xEC, 0x20, // sub rsp, 32 (shadow space)
];

#[cfg(not(windows))]
const LEAVE: &[u8] = &[
    0x5B, // pop rbx
    0xC3, // ret
];

#[cfg(windows)]
const LEAVE: &[u8] = &[
    0x48, 0x83, 0xC4, 0x20, // add rsp, 32
    0x5B, // pop rbx
    0xC3, // ret
];

#[cfg(not(windows))]
const LOAD_ARGS: [u8; 4] = [
    0x48, 0x89, 0xDF, // mov rdi, rbx
    0xBE, // mov esi, imm32
];

#[cfg(windows)]
const LOAD_ARGS: [u8; 4] = [
    0x48, 0x89, 0xD9, // mov rcx, rbx
    0xBA, // mov edx, imm32
];

pub(super) fn emit_prologue(emit: &mut Emitter<'_>) -> JitResult<()> {
    emit.emit(PROLOGUE)
}

/// Calls `helper(frame, pc)` and leaves the segment unless it returned zero.
pub(super) fn emit_step(emit: &mut Emitter<'_>, helper: u64, pc: u32) -> JitResult<()> {
    emit_helper_call(emit, helper, pc)?;
    emit.emit(&[0x85, 0xC0])?; // test eax, eax
    emit.emit(&[0x74, LEAVE.len() as u8])?; // jz over the exit
    emit.emit(LEAVE)
}

/// Calls `helper(frame, pc)` and returns its status.
pub(super) fn emit_exit(emit: &mut Emitter<'_>, helper: u64, pc: u32) -> JitResult<()> {
    emit_helper_call(emit, helper, pc)?;
    emit.emit(LEAVE)
}

fn emit_helper_call(emit: &mut Emitter<'_>, helper: u64, arg: u32) -> JitResult<()> {
    emit.emit(&LOAD_ARGS)?;
    emit.emit_u32(arg)?;
    emit.emit(&[0x48, 0xB8])?; // mov rax, imm64
    emit.emit_u64(helper)?;
    emit.emit(&[0xFF, 0xD0]) // call rax
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::code_buffer::CodeBuffer;

    #[test]
    fn step_sequence_layout() {
        let mut buffer = CodeBuffer::reserve(4096).expect("reserve");
        let mut emit = Emitter::new(&mut buffer);
        emit_prologue(&mut emit).expect("prologue");
        emit_step(&mut emit, 0x1122_3344_5566_7788, 7).expect("step");
        let len = emit.written();
        drop(emit);
        let code = buffer.bytes(0..len).expect("bytes").to_vec();

        assert_eq!(&code[..4], &[0x53, 0x48, 0x89, 0xFB]);
        let step = &code[4..];
        assert_eq!(&step[..4], &[0x48, 0x89, 0xDF, 0xBE]);
        assert_eq!(&step[4..8], &7u32.to_le_bytes());
        assert_eq!(&step[8..10], &[0x48, 0xB8]);
        assert_eq!(&step[10..18], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&step[18..], &[0xFF, 0xD0, 0x85, 0xC0, 0x74, 0x02, 0x5B, 0xC3]);
    }

    #[test]
    fn exit_sequence_returns_helper_status() {
        let mut buffer = CodeBuffer::reserve(4096).expect("reserve");
        let mut emit = Emitter::new(&mut buffer);
        emit_exit(&mut emit, 0xABCD, 40).expect("exit");
        assert_eq!(emit.written(), 22);
        drop(emit);
        let code = buffer.bytes(0..22).expect("bytes");
        assert_eq!(&code[20..], &[0x5B, 0xC3]);
    }
}
