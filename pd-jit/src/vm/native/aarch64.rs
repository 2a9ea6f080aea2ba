use crate::encoder::Emitter;
use crate::error::JitResult;

// x19 holds the frame pointer for the whole segment; x16 is the call scratch register.
const VM_REG: u32 = 19;
const SCRATCH_REG: u32 = 16;

const PROLOGUE: [u32; 4] = [
    0xA9BE7BFD, // stp x29, x30, [sp, #-32]!
    0x910003FD, // mov x29, sp
    0xF9000BF3, // str x19, [sp, #16]
    0xAA0003F3, // mov x19, x0
];

const LEAVE: [u32; 3] = [
    0xF9400BF3, // ldr x19, [sp, #16]
    0xA8C27BFD, // ldp x29, x30, [sp], #32
    0xD65F03C0, // ret
];

pub(super) fn emit_prologue(emit: &mut Emitter<'_>) -> JitResult<()> {
    for insn in PROLOGUE {
        emit_insn(emit, insn)?;
    }
    Ok(())
}

/// Calls `helper(frame, pc)` and leaves the segment unless it returned zero.
pub(super) fn emit_step(emit: &mut Emitter<'_>, helper: u64, pc: u32) -> JitResult<()> {
    emit_helper_call(emit, helper, pc)?;
    // cbz w0, past the exit sequence
    let skip = (LEAVE.len() as u32 + 1) << 5;
    emit_insn(emit, 0x3400_0000 | skip)?;
    emit_leave(emit)
}

/// Calls `helper(frame, pc)` and returns its status.
pub(super) fn emit_exit(emit: &mut Emitter<'_>, helper: u64, pc: u32) -> JitResult<()> {
    emit_helper_call(emit, helper, pc)?;
    emit_leave(emit)
}

fn emit_leave(emit: &mut Emitter<'_>) -> JitResult<()> {
    for insn in LEAVE {
        emit_insn(emit, insn)?;
    }
    Ok(())
}

fn emit_helper_call(emit: &mut Emitter<'_>, helper: u64, arg: u32) -> JitResult<()> {
    emit_mov_reg(emit, 0, VM_REG)?;
    emit_mov_imm32(emit, 1, arg)?;
    emit_mov_imm64(emit, SCRATCH_REG, helper)?;
    emit_insn(emit, 0xD63F_0000 | (SCRATCH_REG << 5)) // blr x16
}

fn emit_mov_reg(emit: &mut Emitter<'_>, dst: u32, src: u32) -> JitResult<()> {
    // orr xd, xzr, xs
    emit_insn(emit, 0xAA00_03E0 | (src << 16) | dst)
}

fn emit_mov_imm32(emit: &mut Emitter<'_>, dst: u32, value: u32) -> JitResult<()> {
    let lo = value & 0xFFFF;
    let hi = value >> 16;
    emit_insn(emit, 0x5280_0000 | (lo << 5) | dst)?; // movz wd, #lo
    emit_insn(emit, 0x72A0_0000 | (hi << 5) | dst) // movk wd, #hi, lsl #16
}

fn emit_mov_imm64(emit: &mut Emitter<'_>, dst: u32, value: u64) -> JitResult<()> {
    // Fixed four-instruction form so every step has the same size.
    for shift in 0..4u32 {
        let chunk = ((value >> (shift * 16)) & 0xFFFF) as u32;
        let base = if shift == 0 { 0xD280_0000 } else { 0xF280_0000 };
        emit_insn(emit, base | (shift << 21) | (chunk << 5) | dst)?;
    }
    Ok(())
}

fn emit_insn(emit: &mut Emitter<'_>, insn: u32) -> JitResult<()> {
    emit.emit_u32(insn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_buffer::CodeBuffer;

    fn words(buffer: &CodeBuffer, len: usize) -> Vec<u32> {
        buffer
            .bytes(0..len)
            .expect("bytes")
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect()
    }

    #[test]
    fn step_sequence_layout() {
        let mut buffer = CodeBuffer::reserve(4096).expect("reserve");
        let mut emit = Emitter::new(&mut buffer);
        emit_step(&mut emit, 0x0000_7F00_1234_5678, 0x0001_0002).expect("step");
        let len = emit.written();
        drop(emit);
        let code = words(&buffer, len);
        assert_eq!(
            code,
            vec![
                0xAA1303E0, // mov x0, x19
                0x52800041, // movz w1, #2
                0x72A00021, // movk w1, #1, lsl #16
                0xD28ACF10, // movz x16, #0x5678
                0xF2A24690, // movk x16, #0x1234, lsl #16
                0xF2CFE010, // movk x16, #0x7F00, lsl #32
                0xF2E00010, // movk x16, #0, lsl #48
                0xD63F0200, // blr x16
                0x34000080, // cbz w0, +16
                0xF9400BF3,
                0xA8C27BFD,
                0xD65F03C0,
            ]
        );
    }
}
