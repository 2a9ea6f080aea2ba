#![allow(dead_code, unused_imports)]

pub use jit::{
    BoundaryPolicy, BytecodeSource, CodeBuffer, DeclineReason, Emitter, Flow, Instruction,
    InstructionEncoder, JitConfig, JitError, JitResult, Program, SegmentTable, SharedJit,
    TranslationDriver, Value, Vm, VmStatus, assemble, switch,
};

/// Opcode that ends a segment in [`Bytes`] sources.
pub const BRANCH: u8 = 9;
/// Opcode the test encoders refuse to encode.
pub const UNENCODABLE: u8 = 7;

/// Bytecode made of one-byte instructions.
pub struct Bytes(pub Vec<u8>);

impl BytecodeSource for Bytes {
    fn code_len(&self) -> usize {
        self.0.len()
    }

    fn base_address(&self) -> usize {
        0
    }

    fn decode(&self, pc: usize) -> Option<Instruction> {
        let opcode = *self.0.get(pc)?;
        let flow = match opcode {
            BRANCH => Flow::Terminal,
            jit::CALLBACK_RETURN => Flow::Barrier,
            _ => Flow::Fallthrough,
        };
        Some(Instruction {
            pc,
            opcode,
            operand: None,
            len: 1,
            flow,
        })
    }
}

/// [`Bytes`] placed at another base address.
pub struct Placed {
    pub base: usize,
    pub bytes: Bytes,
}

impl BytecodeSource for Placed {
    fn code_len(&self) -> usize {
        self.bytes.code_len()
    }

    fn base_address(&self) -> usize {
        self.base
    }

    fn decode(&self, pc: usize) -> Option<Instruction> {
        self.bytes.decode(pc)
    }
}

/// Emits `per_instruction` filler bytes per instruction and a one-byte epilogue.
pub struct FixedWidth {
    pub per_instruction: usize,
}

impl FixedWidth {
    pub fn new(per_instruction: usize) -> Self {
        Self { per_instruction }
    }
}

impl InstructionEncoder for FixedWidth {
    fn encode(&mut self, insn: &Instruction, emit: &mut Emitter<'_>) -> JitResult<()> {
        if insn.opcode == UNENCODABLE {
            return Err(JitError::EncodingFailure {
                pc: insn.pc,
                opcode: insn.opcode,
                reason: "test encoder refuses this opcode".to_string(),
            });
        }
        emit.emit(&vec![0x90; self.per_instruction])
    }

    fn epilogue(&mut self, _resume_pc: usize, emit: &mut Emitter<'_>) -> JitResult<()> {
        emit.emit_u8(0xC3)
    }
}

pub fn shared_jit(config: JitConfig) -> SharedJit {
    SharedJit::new(config).expect("code buffer should be reservable")
}

pub fn jit_config(code_size: usize, hot_threshold: u32) -> JitConfig {
    JitConfig {
        enabled: true,
        code_size,
        hot_threshold,
        ..JitConfig::default()
    }
}

/// Runs `program` with the JIT detached.
pub fn interpret(program: Program) -> (Result<VmStatus, jit::VmError>, Vec<Value>) {
    let mut vm = Vm::new(program);
    vm.set_jit(None);
    let status = vm.run();
    (status, vm.stack().to_vec())
}

/// Counts 1..=n into a sum, with the loop body in its own block.
pub fn loop_sum_source(n: i64) -> String {
    format!(
        "
        .local total
        .local i
        ldc 0
        stloc total
        ldc 1
        stloc i
        .label loop
        ldloc i
        ldc {n}
        cgt
        brfalse body
        br done
        .label body
        ldloc total
        ldloc i
        add
        stloc total
        ldloc i
        ldc 1
        add
        stloc i
        br loop
        .label done
        ldloc total
        ret
        "
    )
}
