/// How an instruction affects the extent of a translated segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Execution continues with the next instruction.
    Fallthrough,
    /// Control transfer. Translated as the last instruction of a segment.
    Terminal,
    /// Never translated. A segment ends before it.
    Barrier,
}

/// A decoded bytecode instruction as seen by the translation driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub pc: usize,
    pub opcode: u8,
    pub operand: Option<u32>,
    /// Encoded length in bytes, opcode included.
    pub len: usize,
    pub flow: Flow,
}

impl Instruction {
    pub fn next_pc(&self) -> usize {
        self.pc + self.len
    }
}

/// Random-access view of an interpreter's instruction stream.
///
/// Segments are keyed by bytecode address, the source's base address plus a pc.
/// Sources translated into one segment table must occupy disjoint address ranges.
pub trait BytecodeSource {
    fn code_len(&self) -> usize;

    /// Address of pc 0.
    fn base_address(&self) -> usize;

    fn address_of(&self, pc: usize) -> usize {
        self.base_address() + pc
    }

    /// Decodes the instruction at `pc`, or `None` when `pc` does not start a valid instruction.
    fn decode(&self, pc: usize) -> Option<Instruction>;
}
