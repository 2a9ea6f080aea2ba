use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{debug, trace};

use crate::bytecode::{BytecodeSource, Flow, Instruction};
use crate::error::JitError;
use crate::gate::{self, ExitReason, GateExit, GateFrame, NativeEntry};
use crate::shared::SharedJit;
use crate::{global, switch};

mod native;

pub use native::NativeEncoder;

/// Pc held while native code runs. Fetching from it yields `CALLBACK_RETURN`.
const GATE_PC: usize = usize::MAX;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
}

#[derive(Clone, Copy, Debug)]
enum NumericValue {
    Int(i64),
    Float(f64),
}

impl NumericValue {
    fn to_f64(self) -> f64 {
        match self {
            NumericValue::Int(value) => value as f64,
            NumericValue::Float(value) => value,
        }
    }
}

impl Value {
    fn as_int(&self) -> Result<i64, VmError> {
        match self {
            Value::Int(value) => Ok(*value),
            _ => Err(VmError::TypeMismatch("int")),
        }
    }

    fn as_numeric(&self) -> Result<NumericValue, VmError> {
        match self {
            Value::Int(value) => Ok(NumericValue::Int(*value)),
            Value::Float(value) => Ok(NumericValue::Float(*value)),
            _ => Err(VmError::TypeMismatch("number")),
        }
    }

    fn as_bool(&self) -> Result<bool, VmError> {
        match self {
            Value::Bool(value) => Ok(*value),
            _ => Err(VmError::TypeMismatch("bool")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("stack underflow")]
    StackUnderflow,
    #[error("type mismatch: expected {0}")]
    TypeMismatch(&'static str),
    #[error("division by zero")]
    DivisionByZero,
    #[error("invalid shift amount {0}, expected 0..63")]
    InvalidShift(i64),
    #[error("invalid constant {0}")]
    InvalidConstant(u32),
    #[error("invalid local {0}")]
    InvalidLocal(u8),
    #[error("invalid opcode 0x{0:02X}")]
    InvalidOpcode(u8),
    #[error("bytecode access out of bounds")]
    BytecodeBounds,
    #[error("callback-return opcode at pc {0} with no pending native exit")]
    StrayCallbackReturn(usize),
    #[error("native code failed at pc {0}")]
    NativeFault(usize),
    #[error(transparent)]
    Jit(#[from] JitError),
}

pub type VmResult<T> = Result<T, VmError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmStatus {
    Halted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StepOutcome {
    Continue,
    Halted,
}

/// Next unclaimed bytecode address. Every program gets a range of its own.
static NEXT_PROGRAM_BASE: AtomicUsize = AtomicUsize::new(0);

/// Immutable bytecode plus its constant pool.
///
/// Each program owns the address range `[base, base + code.len())`, so programs
/// sharing one JIT never see each other's segments. Clones share the range, and
/// with it the segments, since their code is identical.
#[derive(Clone, Debug)]
pub struct Program {
    constants: Vec<Value>,
    code: Vec<u8>,
    base: usize,
}

impl Program {
    pub fn new(constants: Vec<Value>, code: Vec<u8>) -> Self {
        // One spare address keeps empty programs apart too.
        let base = NEXT_PROGRAM_BASE.fetch_add(code.len() + 1, Ordering::Relaxed);
        Self {
            constants,
            code,
            base,
        }
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn decode_at(&self, pc: usize) -> Option<Instruction> {
        let byte = *self.code.get(pc)?;
        let opcode = OpCode::from_u8(byte)?;
        let operand_len = opcode.operand_len();
        let operand = match operand_len {
            0 => None,
            1 => Some(u32::from(*self.code.get(pc + 1)?)),
            _ => {
                let bytes = self.code.get(pc + 1..pc + 1 + operand_len)?;
                Some(u32::from_le_bytes(bytes.try_into().ok()?))
            }
        };
        Some(Instruction {
            pc,
            opcode: byte,
            operand,
            len: 1 + operand_len,
            flow: opcode.flow(),
        })
    }

    /// Number of local slots the code addresses.
    pub fn local_count(&self) -> usize {
        self.instructions()
            .filter(|insn| insn.opcode == OpCode::Ldloc as u8 || insn.opcode == OpCode::Stloc as u8)
            .filter_map(|insn| insn.operand)
            .map(|index| index as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// Program start, branch targets and every instruction following a terminal one.
    pub fn block_leaders(&self) -> HashSet<usize> {
        let mut leaders = HashSet::new();
        if !self.code.is_empty() {
            leaders.insert(0);
        }
        for insn in self.instructions() {
            if insn.flow != Flow::Terminal {
                continue;
            }
            if insn.opcode != OpCode::Ret as u8
                && let Some(target) = insn.operand
            {
                leaders.insert(target as usize);
            }
            if insn.next_pc() < self.code.len() {
                leaders.insert(insn.next_pc());
            }
        }
        leaders
    }

    /// Linear walk over the decodable prefix of the code.
    pub fn instructions(&self) -> impl Iterator<Item = Instruction> + '_ {
        let mut pc = 0usize;
        std::iter::from_fn(move || {
            let insn = self.decode_at(pc)?;
            pc = insn.next_pc();
            Some(insn)
        })
    }

    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for insn in self.instructions() {
            let mnemonic = OpCode::from_u8(insn.opcode).map_or("?", OpCode::mnemonic);
            match insn.operand {
                Some(operand) => out.push_str(&format!("{:>6}: {mnemonic} {operand}\n", insn.pc)),
                None => out.push_str(&format!("{:>6}: {mnemonic}\n", insn.pc)),
            }
        }
        out
    }
}

impl BytecodeSource for Program {
    fn code_len(&self) -> usize {
        self.code.len()
    }

    fn base_address(&self) -> usize {
        self.base
    }

    fn decode(&self, pc: usize) -> Option<Instruction> {
        self.decode_at(pc)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Nop = 0x00,
    Ret = 0x01,
    Ldc = 0x02,
    Add = 0x03,
    Sub = 0x04,
    Mul = 0x05,
    Div = 0x06,
    Neg = 0x07,
    Ceq = 0x08,
    Clt = 0x09,
    Cgt = 0x0A,
    Br = 0x0B,
    Brfalse = 0x0C,
    Pop = 0x0D,
    Dup = 0x0E,
    Ldloc = 0x0F,
    Stloc = 0x10,
    Shl = 0x12,
    Shr = 0x13,
    CallbackReturn = gate::CALLBACK_RETURN,
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        let op = match byte {
            0x00 => OpCode::Nop,
            0x01 => OpCode::Ret,
            0x02 => OpCode::Ldc,
            0x03 => OpCode::Add,
            0x04 => OpCode::Sub,
            0x05 => OpCode::Mul,
            0x06 => OpCode::Div,
            0x07 => OpCode::Neg,
            0x08 => OpCode::Ceq,
            0x09 => OpCode::Clt,
            0x0A => OpCode::Cgt,
            0x0B => OpCode::Br,
            0x0C => OpCode::Brfalse,
            0x0D => OpCode::Pop,
            0x0E => OpCode::Dup,
            0x0F => OpCode::Ldloc,
            0x10 => OpCode::Stloc,
            0x12 => OpCode::Shl,
            0x13 => OpCode::Shr,
            gate::CALLBACK_RETURN => OpCode::CallbackReturn,
            _ => return None,
        };
        Some(op)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Nop => "nop",
            OpCode::Ret => "ret",
            OpCode::Ldc => "ldc",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Div => "div",
            OpCode::Neg => "neg",
            OpCode::Ceq => "ceq",
            OpCode::Clt => "clt",
            OpCode::Cgt => "cgt",
            OpCode::Br => "br",
            OpCode::Brfalse => "brfalse",
            OpCode::Pop => "pop",
            OpCode::Dup => "dup",
            OpCode::Ldloc => "ldloc",
            OpCode::Stloc => "stloc",
            OpCode::Shl => "shl",
            OpCode::Shr => "shr",
            OpCode::CallbackReturn => "callback_return",
        }
    }

    pub fn parse_mnemonic(op: &str) -> Option<Self> {
        match op {
            "nop" => Some(OpCode::Nop),
            "ret" => Some(OpCode::Ret),
            "ldc" => Some(OpCode::Ldc),
            "add" => Some(OpCode::Add),
            "sub" => Some(OpCode::Sub),
            "mul" => Some(OpCode::Mul),
            "div" => Some(OpCode::Div),
            "neg" => Some(OpCode::Neg),
            "ceq" => Some(OpCode::Ceq),
            "clt" => Some(OpCode::Clt),
            "cgt" => Some(OpCode::Cgt),
            "br" => Some(OpCode::Br),
            "brfalse" => Some(OpCode::Brfalse),
            "pop" => Some(OpCode::Pop),
            "dup" => Some(OpCode::Dup),
            "ldloc" => Some(OpCode::Ldloc),
            "stloc" => Some(OpCode::Stloc),
            "shl" => Some(OpCode::Shl),
            "shr" => Some(OpCode::Shr),
            "callback_return" => Some(OpCode::CallbackReturn),
            _ => None,
        }
    }

    pub fn operand_len(self) -> usize {
        match self {
            OpCode::Ldc | OpCode::Br | OpCode::Brfalse => 4,
            OpCode::Ldloc | OpCode::Stloc => 1,
            _ => 0,
        }
    }

    pub fn flow(self) -> Flow {
        match self {
            OpCode::Br | OpCode::Brfalse | OpCode::Ret => Flow::Terminal,
            OpCode::CallbackReturn => Flow::Barrier,
            _ => Flow::Fallthrough,
        }
    }
}

/// Cross-thread request for the VM to stop at its next safepoint.
#[derive(Clone, Debug, Default)]
pub struct SafepointFlag(Arc<AtomicBool>);

impl SafepointFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

pub struct Vm {
    program: Program,
    ip: usize,
    stack: Vec<Value>,
    locals: Vec<Value>,
    jit: Option<SharedJit>,
    jit_enabled: bool,
    encoder: NativeEncoder,
    hot_threshold: u32,
    hot_counts: HashMap<usize, u32>,
    leaders: HashSet<usize>,
    pending_exit: Option<GateExit>,
    safepoint: SafepointFlag,
    safepoint_polls: u64,
    native_entries: u64,
    gate_exits: [u64; ExitReason::ALL.len()],
}

impl Vm {
    /// Creates a VM with locals sized from the program, attached to the global JIT if any.
    pub fn new(program: Program) -> Self {
        let local_count = program.local_count();
        Self::with_locals(program, local_count)
    }

    pub fn with_locals(program: Program, local_count: usize) -> Self {
        let leaders = program.block_leaders();
        let mut vm = Self {
            program,
            ip: 0,
            stack: Vec::new(),
            locals: vec![Value::Int(0); local_count],
            jit: None,
            jit_enabled: false,
            encoder: NativeEncoder::new(),
            hot_threshold: 1,
            hot_counts: HashMap::new(),
            leaders,
            pending_exit: None,
            safepoint: SafepointFlag::new(),
            safepoint_polls: 0,
            native_entries: 0,
            gate_exits: [0; ExitReason::ALL.len()],
        };
        vm.set_jit(global::get().cloned());
        vm
    }

    /// Attaches a JIT, or detaches it with `None` for pure interpretation.
    pub fn set_jit(&mut self, jit: Option<SharedJit>) {
        match &jit {
            Some(shared) => {
                let engine = shared.read();
                self.jit_enabled = engine.config().enabled;
                self.hot_threshold = engine.config().hot_threshold.max(1);
            }
            None => self.jit_enabled = false,
        }
        self.jit = jit;
        self.hot_counts.clear();
    }

    pub fn jit(&self) -> Option<&SharedJit> {
        self.jit.as_ref()
    }

    pub fn safepoint_flag(&self) -> SafepointFlag {
        self.safepoint.clone()
    }

    pub fn run(&mut self) -> VmResult<VmStatus> {
        loop {
            if self.ip != GATE_PC {
                match self.native_entry() {
                    Some(entry) => self.enter_native(entry)?,
                    None => self.poll_safepoint(),
                }
            }

            let opcode = self.fetch_opcode()?;
            if opcode == gate::CALLBACK_RETURN {
                match self.accept_gate_exit()? {
                    Some(status) => return Ok(status),
                    None => continue,
                }
            }
            if self.execute_instruction(opcode)? == StepOutcome::Halted {
                return Ok(VmStatus::Halted);
            }
        }
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn locals(&self) -> &[Value] {
        &self.locals
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn native_entries(&self) -> u64 {
        self.native_entries
    }

    pub fn gate_exits(&self, reason: ExitReason) -> u64 {
        self.gate_exits[reason.index()]
    }

    pub fn safepoint_polls(&self) -> u64 {
        self.safepoint_polls
    }

    pub fn dump_jit_info(&self) -> String {
        let mut out = match &self.jit {
            Some(jit) => jit.dump_text(),
            None => "native-jit: detached\n".to_string(),
        };
        out.push_str(&format!("  switch: {}\n", switch::is_enabled()));
        out.push_str(&format!("  native entries: {}\n", self.native_entries));
        for reason in ExitReason::ALL {
            out.push_str(&format!(
                "  gate exits ({}): {}\n",
                reason.name(),
                self.gate_exits(reason)
            ));
        }
        out.push_str(&format!("  safepoint polls: {}\n", self.safepoint_polls));
        out
    }

    fn native_entry(&mut self) -> Option<NativeEntry> {
        if !self.jit_enabled || !switch::is_enabled() {
            return None;
        }
        let jit = self.jit.as_ref()?;
        let pc = self.ip;
        let address = self.program.address_of(pc);
        if let Some(entry) = jit.lookup_native(address) {
            return Some(entry);
        }
        if !self.leaders.contains(&pc) || jit.is_settled(address) {
            return None;
        }
        let count = {
            let count = self.hot_counts.entry(pc).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        if count < self.hot_threshold {
            return None;
        }
        match jit.translate(&self.program, &mut self.encoder, pc) {
            Ok(_) => jit.lookup_native(address),
            Err(err) => {
                debug!(pc, error = %err, "pc stays interpreted");
                None
            }
        }
    }

    fn enter_native(&mut self, entry: NativeEntry) -> VmResult<()> {
        native::clear_bridge_error();
        self.native_entries += 1;
        let start_pc = self.ip;
        let mut frame = GateFrame::new((self as *mut Vm).cast());
        // SAFETY: the entry comes from a segment produced by `NativeEncoder`, whose
        // helpers expect the frame context to be this VM.
        let exit = unsafe { gate::enter(entry, &mut frame) }?;
        trace!(
            start_pc,
            reason = exit.reason.name(),
            resume_pc = exit.resume_pc,
            "native segment exited"
        );
        self.gate_exits[exit.reason.index()] += 1;
        self.pending_exit = Some(exit);
        self.ip = GATE_PC;
        Ok(())
    }

    fn accept_gate_exit(&mut self) -> VmResult<Option<VmStatus>> {
        let Some(exit) = self.pending_exit.take() else {
            return Err(VmError::StrayCallbackReturn(self.ip.saturating_sub(1)));
        };
        self.ip = exit.resume_pc;
        match exit.reason {
            ExitReason::Resume => Ok(None),
            ExitReason::Safepoint => {
                self.poll_safepoint();
                Ok(None)
            }
            ExitReason::Return => Ok(Some(VmStatus::Halted)),
            ExitReason::Exception => {
                Err(native::take_bridge_error().unwrap_or(VmError::NativeFault(exit.resume_pc)))
            }
        }
    }

    fn poll_safepoint(&mut self) {
        if self.safepoint.take() {
            self.safepoint_polls += 1;
            trace!(ip = self.ip, "safepoint reached");
        }
    }

    /// Executes the instruction at `pc` on behalf of native code.
    ///
    /// Returns the gate exit to take, or `None` to continue with the next instruction.
    fn step_native(&mut self, pc: usize) -> VmResult<Option<ExitReason>> {
        self.ip = pc;
        let opcode = self.read_u8()?;
        let outcome = self.execute_instruction(opcode)?;
        let terminal = OpCode::from_u8(opcode).map(OpCode::flow) == Some(Flow::Terminal);
        Ok(match outcome {
            StepOutcome::Halted => Some(ExitReason::Return),
            StepOutcome::Continue if terminal => Some(ExitReason::Resume),
            StepOutcome::Continue => None,
        })
    }

    fn fetch_opcode(&mut self) -> VmResult<u8> {
        if self.ip == GATE_PC {
            return Ok(gate::CALLBACK_RETURN);
        }
        self.read_u8()
    }

    fn execute_instruction(&mut self, opcode: u8) -> VmResult<StepOutcome> {
        match opcode {
            x if x == OpCode::Nop as u8 => {}
            x if x == OpCode::Ret as u8 => return Ok(StepOutcome::Halted),
            x if x == OpCode::Ldc as u8 => {
                let index = self.read_u32()?;
                let value = self
                    .program
                    .constants
                    .get(index as usize)
                    .cloned()
                    .ok_or(VmError::InvalidConstant(index))?;
                self.stack.push(value);
            }
            x if x == OpCode::Add as u8 => {
                self.binary_numeric_op(|lhs, rhs| Ok(lhs.wrapping_add(rhs)), |lhs, rhs| Ok(lhs + rhs))?;
            }
            x if x == OpCode::Sub as u8 => {
                self.binary_numeric_op(|lhs, rhs| Ok(lhs.wrapping_sub(rhs)), |lhs, rhs| Ok(lhs - rhs))?;
            }
            x if x == OpCode::Mul as u8 => {
                self.binary_numeric_op(|lhs, rhs| Ok(lhs.wrapping_mul(rhs)), |lhs, rhs| Ok(lhs * rhs))?;
            }
            x if x == OpCode::Div as u8 => {
                self.binary_numeric_op(
                    |lhs, rhs| {
                        if rhs == 0 {
                            return Err(VmError::DivisionByZero);
                        }
                        Ok(lhs.wrapping_div(rhs))
                    },
                    |lhs, rhs| {
                        if rhs == 0.0 {
                            return Err(VmError::DivisionByZero);
                        }
                        Ok(lhs / rhs)
                    },
                )?;
            }
            x if x == OpCode::Shl as u8 => {
                let rhs = self.pop_shift_amount()?;
                let lhs = self.pop_int()?;
                self.stack.push(Value::Int(lhs << rhs));
            }
            x if x == OpCode::Shr as u8 => {
                let rhs = self.pop_shift_amount()?;
                let lhs = self.pop_int()?;
                self.stack.push(Value::Int(lhs >> rhs));
            }
            x if x == OpCode::Neg as u8 => match self.pop_numeric()? {
                NumericValue::Int(value) => self.stack.push(Value::Int(value.wrapping_neg())),
                NumericValue::Float(value) => self.stack.push(Value::Float(-value)),
            },
            x if x == OpCode::Ceq as u8 => {
                let rhs = self.pop_value()?;
                let lhs = self.pop_value()?;
                self.stack.push(Value::Bool(lhs == rhs));
            }
            x if x == OpCode::Clt as u8 => {
                self.compare_numeric_op(|lhs, rhs| lhs < rhs, |lhs, rhs| lhs < rhs)?;
            }
            x if x == OpCode::Cgt as u8 => {
                self.compare_numeric_op(|lhs, rhs| lhs > rhs, |lhs, rhs| lhs > rhs)?;
            }
            x if x == OpCode::Br as u8 => {
                let target = self.read_u32()? as usize;
                self.jump_to(target)?;
            }
            x if x == OpCode::Brfalse as u8 => {
                let target = self.read_u32()? as usize;
                if !self.pop_bool()? {
                    self.jump_to(target)?;
                }
            }
            x if x == OpCode::Pop as u8 => {
                self.pop_value()?;
            }
            x if x == OpCode::Dup as u8 => {
                let value = self.peek_value()?.clone();
                self.stack.push(value);
            }
            x if x == OpCode::Ldloc as u8 => {
                let index = self.read_u8()?;
                let value = self
                    .locals
                    .get(index as usize)
                    .cloned()
                    .ok_or(VmError::InvalidLocal(index))?;
                self.stack.push(value);
            }
            x if x == OpCode::Stloc as u8 => {
                let index = self.read_u8()?;
                let value = self.pop_value()?;
                let slot = self
                    .locals
                    .get_mut(index as usize)
                    .ok_or(VmError::InvalidLocal(index))?;
                *slot = value;
            }
            other => return Err(VmError::InvalidOpcode(other)),
        }
        Ok(StepOutcome::Continue)
    }

    fn pop_value(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn peek_value(&self) -> VmResult<&Value> {
        self.stack.last().ok_or(VmError::StackUnderflow)
    }

    fn pop_int(&mut self) -> VmResult<i64> {
        self.pop_value()?.as_int()
    }

    fn pop_numeric(&mut self) -> VmResult<NumericValue> {
        self.pop_value()?.as_numeric()
    }

    fn pop_bool(&mut self) -> VmResult<bool> {
        self.pop_value()?.as_bool()
    }

    fn binary_numeric_op(
        &mut self,
        int_op: impl FnOnce(i64, i64) -> VmResult<i64>,
        float_op: impl FnOnce(f64, f64) -> VmResult<f64>,
    ) -> VmResult<()> {
        let rhs = self.pop_numeric()?;
        let lhs = self.pop_numeric()?;
        let value = match (lhs, rhs) {
            (NumericValue::Int(lhs), NumericValue::Int(rhs)) => Value::Int(int_op(lhs, rhs)?),
            (lhs, rhs) => Value::Float(float_op(lhs.to_f64(), rhs.to_f64())?),
        };
        self.stack.push(value);
        Ok(())
    }

    fn compare_numeric_op(
        &mut self,
        int_op: impl FnOnce(i64, i64) -> bool,
        float_op: impl FnOnce(f64, f64) -> bool,
    ) -> VmResult<()> {
        let rhs = self.pop_numeric()?;
        let lhs = self.pop_numeric()?;
        let result = match (lhs, rhs) {
            (NumericValue::Int(lhs), NumericValue::Int(rhs)) => int_op(lhs, rhs),
            (lhs, rhs) => float_op(lhs.to_f64(), rhs.to_f64()),
        };
        self.stack.push(Value::Bool(result));
        Ok(())
    }

    fn pop_shift_amount(&mut self) -> VmResult<u32> {
        let value = self.pop_int()?;
        if !(0..=63).contains(&value) {
            return Err(VmError::InvalidShift(value));
        }
        Ok(value as u32)
    }

    fn read_u8(&mut self) -> VmResult<u8> {
        let value = *self.program.code.get(self.ip).ok_or(VmError::BytecodeBounds)?;
        self.ip += 1;
        Ok(value)
    }

    fn read_u32(&mut self) -> VmResult<u32> {
        let bytes = self
            .program
            .code
            .get(self.ip..self.ip.saturating_add(4))
            .ok_or(VmError::BytecodeBounds)?;
        let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.ip += 4;
        Ok(value)
    }

    fn jump_to(&mut self, target: usize) -> VmResult<()> {
        if target >= self.program.code.len() {
            return Err(VmError::BytecodeBounds);
        }
        self.ip = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(code: Vec<u8>, constants: Vec<Value>) -> Program {
        Program::new(constants, code)
    }

    #[test]
    fn decode_reads_operands_and_flow() {
        let prog = program(
            vec![
                OpCode::Ldc as u8, 1, 0, 0, 0,
                OpCode::Stloc as u8, 3,
                OpCode::Br as u8, 0, 0, 0, 0,
                gate::CALLBACK_RETURN,
            ],
            vec![Value::Int(0), Value::Int(1)],
        );
        let ldc = prog.decode_at(0).expect("ldc");
        assert_eq!((ldc.operand, ldc.len, ldc.flow), (Some(1), 5, Flow::Fallthrough));
        let stloc = prog.decode_at(5).expect("stloc");
        assert_eq!((stloc.operand, stloc.len), (Some(3), 2));
        let br = prog.decode_at(7).expect("br");
        assert_eq!((br.operand, br.flow), (Some(0), Flow::Terminal));
        assert_eq!(prog.decode_at(12).map(|i| i.flow), Some(Flow::Barrier));
        assert_eq!(prog.decode_at(13), None);
        assert_eq!(prog.local_count(), 4);
    }

    #[test]
    fn truncated_operand_does_not_decode() {
        let prog = program(vec![OpCode::Ldc as u8, 0, 0], vec![]);
        assert_eq!(prog.decode_at(0), None);
    }

    #[test]
    fn leaders_include_targets_and_fallthrough() {
        // 0: ldloc 0; 2: brfalse 13; 7: br 0; 12: nop; 13: ret
        let prog = program(
            vec![
                OpCode::Ldloc as u8, 0,
                OpCode::Brfalse as u8, 13, 0, 0, 0,
                OpCode::Br as u8, 0, 0, 0, 0,
                OpCode::Nop as u8,
                OpCode::Ret as u8,
            ],
            vec![],
        );
        let mut leaders: Vec<usize> = prog.block_leaders().into_iter().collect();
        leaders.sort_unstable();
        assert_eq!(leaders, vec![0, 7, 12, 13]);
    }

    #[test]
    fn stray_callback_return_is_an_error() {
        let mut vm = Vm::with_locals(program(vec![OpCode::Nop as u8, gate::CALLBACK_RETURN], vec![]), 0);
        vm.set_jit(None);
        assert_eq!(vm.run(), Err(VmError::StrayCallbackReturn(1)));
    }

    #[test]
    fn integer_overflow_wraps() {
        let mut vm = Vm::with_locals(
            program(
                vec![
                    OpCode::Ldc as u8, 0, 0, 0, 0,
                    OpCode::Ldc as u8, 1, 0, 0, 0,
                    OpCode::Add as u8,
                    OpCode::Ret as u8,
                ],
                vec![Value::Int(i64::MAX), Value::Int(1)],
            ),
            0,
        );
        vm.set_jit(None);
        assert_eq!(vm.run(), Ok(VmStatus::Halted));
        assert_eq!(vm.stack(), &[Value::Int(i64::MIN)]);
    }

    #[test]
    fn mnemonics_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(op) = OpCode::from_u8(byte) {
                assert_eq!(OpCode::parse_mnemonic(op.mnemonic()), Some(op));
                assert_eq!(op as u8, byte);
            }
        }
    }
}
