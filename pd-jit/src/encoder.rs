use crate::bytecode::Instruction;
use crate::code_buffer::CodeBuffer;
use crate::error::JitResult;

/// Target-specific instruction encoder driven by the translation driver.
///
/// Everything an encoder writes goes through the [`Emitter`], which appends at the
/// code buffer cursor and fails with `BufferExhausted` when the buffer is full. An
/// encoder declines an instruction by returning `EncodingFailure`; the driver then
/// discards everything written for the segment.
pub trait InstructionEncoder {
    /// Emitted once at the segment entry.
    fn prologue(&mut self, emit: &mut Emitter<'_>) -> JitResult<()> {
        let _ = emit;
        Ok(())
    }

    fn encode(&mut self, instruction: &Instruction, emit: &mut Emitter<'_>) -> JitResult<()>;

    /// Emitted after the last instruction; leaves through the gate at `resume_pc`.
    fn epilogue(&mut self, resume_pc: usize, emit: &mut Emitter<'_>) -> JitResult<()>;
}

pub struct Emitter<'a> {
    buffer: &'a mut CodeBuffer,
    start: usize,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(buffer: &'a mut CodeBuffer) -> Self {
        let start = buffer.cursor();
        Self { buffer, start }
    }

    pub fn emit(&mut self, bytes: &[u8]) -> JitResult<()> {
        let at = self.buffer.allocate(bytes.len())?;
        self.buffer.write(at, bytes)
    }

    pub fn emit_u8(&mut self, byte: u8) -> JitResult<()> {
        self.emit(&[byte])
    }

    pub fn emit_u32(&mut self, value: u32) -> JitResult<()> {
        self.emit(&value.to_le_bytes())
    }

    pub fn emit_u64(&mut self, value: u64) -> JitResult<()> {
        self.emit(&value.to_le_bytes())
    }

    /// Buffer offset of the next byte.
    pub fn position(&self) -> usize {
        self.buffer.cursor()
    }

    /// Bytes written for the current segment so far.
    pub fn written(&self) -> usize {
        self.buffer.cursor() - self.start
    }

    /// Native address of the next byte, for pc-relative encodings.
    pub fn address(&self) -> usize {
        self.buffer.address_of(self.buffer.cursor()) as usize
    }
}
