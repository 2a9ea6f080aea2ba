use std::collections::HashMap;

use crate::gate::CALLBACK_RETURN;
use crate::vm::{OpCode, Program, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblerError {
    #[error("duplicate label '{0}'")]
    DuplicateLabel(String),
    #[error("unknown label '{0}'")]
    UnknownLabel(String),
}

struct Fixup {
    at: usize,
    label: String,
}

/// Builds a [`Program`] instruction by instruction, resolving labels on finish.
#[derive(Default)]
pub struct Assembler {
    code: Vec<u8>,
    constants: Vec<Value>,
    interned: HashMap<ConstKey, u32>,
    labels: HashMap<String, u32>,
    fixups: Vec<Fixup>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(i64),
    Float(u64),
    Bool(bool),
}

impl ConstKey {
    fn of(value: &Value) -> Self {
        match value {
            Value::Int(number) => ConstKey::Int(*number),
            Value::Float(number) => ConstKey::Float(number.to_bits()),
            Value::Bool(flag) => ConstKey::Bool(*flag),
        }
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn label(&mut self, name: &str) -> Result<(), AssemblerError> {
        if self.labels.contains_key(name) {
            return Err(AssemblerError::DuplicateLabel(name.to_string()));
        }
        let pos = self.position();
        self.labels.insert(name.to_string(), pos);
        Ok(())
    }

    /// Interns `value` in the constant pool and returns its index.
    pub fn add_constant(&mut self, value: Value) -> u32 {
        let key = ConstKey::of(&value);
        if let Some(index) = self.interned.get(&key) {
            return *index;
        }
        let index = self.constants.len() as u32;
        self.constants.push(value);
        self.interned.insert(key, index);
        index
    }

    pub fn push_const(&mut self, value: Value) -> u32 {
        let index = self.add_constant(value);
        self.ldc(index);
        index
    }

    pub fn finish_program(mut self) -> Result<Program, AssemblerError> {
        for fixup in self.fixups.drain(..) {
            let target = self
                .labels
                .get(&fixup.label)
                .copied()
                .ok_or_else(|| AssemblerError::UnknownLabel(fixup.label.clone()))?;
            self.code[fixup.at..fixup.at + 4].copy_from_slice(&target.to_le_bytes());
        }
        Ok(Program::new(self.constants, self.code))
    }

    pub fn nop(&mut self) {
        self.op(OpCode::Nop);
    }

    pub fn ret(&mut self) {
        self.op(OpCode::Ret);
    }

    pub fn ldc(&mut self, index: u32) {
        self.op(OpCode::Ldc);
        self.code.extend_from_slice(&index.to_le_bytes());
    }

    pub fn add(&mut self) {
        self.op(OpCode::Add);
    }

    pub fn sub(&mut self) {
        self.op(OpCode::Sub);
    }

    pub fn mul(&mut self) {
        self.op(OpCode::Mul);
    }

    pub fn div(&mut self) {
        self.op(OpCode::Div);
    }

    pub fn neg(&mut self) {
        self.op(OpCode::Neg);
    }

    pub fn ceq(&mut self) {
        self.op(OpCode::Ceq);
    }

    pub fn clt(&mut self) {
        self.op(OpCode::Clt);
    }

    pub fn cgt(&mut self) {
        self.op(OpCode::Cgt);
    }

    pub fn br(&mut self, label: &str) {
        self.branch(OpCode::Br, label);
    }

    pub fn brfalse(&mut self, label: &str) {
        self.branch(OpCode::Brfalse, label);
    }

    pub fn pop(&mut self) {
        self.op(OpCode::Pop);
    }

    pub fn dup(&mut self) {
        self.op(OpCode::Dup);
    }

    pub fn ldloc(&mut self, index: u8) {
        self.op(OpCode::Ldloc);
        self.code.push(index);
    }

    pub fn stloc(&mut self, index: u8) {
        self.op(OpCode::Stloc);
        self.code.push(index);
    }

    pub fn shl(&mut self) {
        self.op(OpCode::Shl);
    }

    pub fn shr(&mut self) {
        self.op(OpCode::Shr);
    }

    /// Emits the gate opcode. Only meaningful for exercising translation barriers.
    pub fn callback_return(&mut self) {
        self.code.push(CALLBACK_RETURN);
    }

    fn op(&mut self, opcode: OpCode) {
        self.code.push(opcode as u8);
    }

    fn branch(&mut self, opcode: OpCode, label: &str) {
        self.op(opcode);
        let at = self.code.len();
        self.code.extend_from_slice(&[0; 4]);
        self.fixups.push(Fixup {
            at,
            label: label.to_string(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct AsmParseError {
    pub line: usize,
    pub message: String,
}

impl AsmParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Default)]
struct Scope {
    consts: HashMap<String, u32>,
    locals: HashMap<String, u8>,
    next_local: u8,
}

impl Scope {
    fn local(&self, token: &str, line_no: usize) -> Result<u8, AsmParseError> {
        if let Ok(index) = token.parse::<u8>() {
            return Ok(index);
        }
        self.locals
            .get(token)
            .copied()
            .ok_or_else(|| AsmParseError::new(line_no, format!("unknown local '{token}'")))
    }
}

/// Assembles the textual form into a program.
///
/// Lines hold one mnemonic each, optionally followed by an operand. Directives:
/// `.label NAME`, `.const NAME LITERAL` and `.local NAME [INDEX]`. Comments start
/// with `#` or `//`.
pub fn assemble(source: &str) -> Result<Program, AsmParseError> {
    let mut assembler = Assembler::new();
    let mut scope = Scope::default();

    for (line_idx, raw_line) in source.lines().enumerate() {
        let line_no = line_idx + 1;
        let line = strip_comments(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        if line.ends_with(':') {
            return Err(AsmParseError::new(
                line_no,
                "label definitions must use '.label NAME'",
            ));
        }

        let mut parts = line.split_whitespace();
        let head = next_token(&mut parts, line_no, "opcode")?;
        if let Some(directive) = head.strip_prefix('.') {
            directive_line(&mut assembler, &mut scope, directive, &mut parts, line_no)?;
        } else {
            instruction_line(&mut assembler, &scope, head, &mut parts, line_no)?;
        }
        if parts.next().is_some() {
            return Err(AsmParseError::new(line_no, "unexpected extra tokens"));
        }
    }

    assembler
        .finish_program()
        .map_err(|err| AsmParseError::new(0, err.to_string()))
}

fn directive_line<'a>(
    assembler: &mut Assembler,
    scope: &mut Scope,
    directive: &str,
    parts: &mut impl Iterator<Item = &'a str>,
    line_no: usize,
) -> Result<(), AsmParseError> {
    match directive.to_ascii_lowercase().as_str() {
        "label" => {
            let name = next_token(parts, line_no, "label name")?;
            assembler
                .label(name)
                .map_err(|err| AsmParseError::new(line_no, err.to_string()))
        }
        "const" => {
            let name = next_token(parts, line_no, "const name")?;
            if scope.consts.contains_key(name) {
                return Err(AsmParseError::new(line_no, format!("duplicate const '{name}'")));
            }
            let value = parse_literal(next_token(parts, line_no, "const value")?, line_no)?;
            let index = assembler.add_constant(value);
            scope.consts.insert(name.to_string(), index);
            Ok(())
        }
        "local" => {
            let name = next_token(parts, line_no, "local name")?;
            if scope.locals.contains_key(name) {
                return Err(AsmParseError::new(line_no, format!("duplicate local '{name}'")));
            }
            let index = match parts.next() {
                Some(token) => token
                    .parse::<u8>()
                    .map_err(|_| AsmParseError::new(line_no, format!("invalid local index '{token}'")))?,
                None => {
                    let index = scope.next_local;
                    scope.next_local = index
                        .checked_add(1)
                        .ok_or_else(|| AsmParseError::new(line_no, "local index overflow"))?;
                    index
                }
            };
            scope.locals.insert(name.to_string(), index);
            Ok(())
        }
        other => Err(AsmParseError::new(line_no, format!("unknown directive '.{other}'"))),
    }
}

fn instruction_line<'a>(
    assembler: &mut Assembler,
    scope: &Scope,
    mnemonic: &str,
    parts: &mut impl Iterator<Item = &'a str>,
    line_no: usize,
) -> Result<(), AsmParseError> {
    let mnemonic = mnemonic.to_ascii_lowercase();
    let opcode = OpCode::parse_mnemonic(&mnemonic)
        .ok_or_else(|| AsmParseError::new(line_no, format!("unknown opcode '{mnemonic}'")))?;
    match opcode {
        OpCode::Nop => assembler.nop(),
        OpCode::Ret => assembler.ret(),
        OpCode::Ldc => {
            let token = next_token(parts, line_no, "ldc literal")?;
            match scope.consts.get(token) {
                Some(&index) => assembler.ldc(index),
                None => {
                    assembler.push_const(parse_literal(token, line_no)?);
                }
            }
        }
        OpCode::Add => assembler.add(),
        OpCode::Sub => assembler.sub(),
        OpCode::Mul => assembler.mul(),
        OpCode::Div => assembler.div(),
        OpCode::Neg => assembler.neg(),
        OpCode::Ceq => assembler.ceq(),
        OpCode::Clt => assembler.clt(),
        OpCode::Cgt => assembler.cgt(),
        OpCode::Br | OpCode::Brfalse => {
            let target = next_token(parts, line_no, "jump target")?;
            if target.parse::<u32>().is_ok() {
                return Err(AsmParseError::new(
                    line_no,
                    "numeric jump targets are not supported",
                ));
            }
            if opcode == OpCode::Br {
                assembler.br(target);
            } else {
                assembler.brfalse(target);
            }
        }
        OpCode::Pop => assembler.pop(),
        OpCode::Dup => assembler.dup(),
        OpCode::Ldloc => {
            let index = scope.local(next_token(parts, line_no, "local index")?, line_no)?;
            assembler.ldloc(index);
        }
        OpCode::Stloc => {
            let index = scope.local(next_token(parts, line_no, "local index")?, line_no)?;
            assembler.stloc(index);
        }
        OpCode::Shl => assembler.shl(),
        OpCode::Shr => assembler.shr(),
        OpCode::CallbackReturn => assembler.callback_return(),
    }
    Ok(())
}

fn strip_comments(line: &str) -> &str {
    let cut = [line.find('#'), line.find("//")]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(line.len());
    &line[..cut]
}

fn next_token<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    line_no: usize,
    what: &str,
) -> Result<&'a str, AsmParseError> {
    parts
        .next()
        .ok_or_else(|| AsmParseError::new(line_no, format!("missing {what}")))
}

fn parse_literal(token: &str, line_no: usize) -> Result<Value, AsmParseError> {
    if token.eq_ignore_ascii_case("true") {
        return Ok(Value::Bool(true));
    }
    if token.eq_ignore_ascii_case("false") {
        return Ok(Value::Bool(false));
    }
    if let Ok(value) = token.parse::<i64>() {
        return Ok(Value::Int(value));
    }
    token
        .parse::<f64>()
        .map(Value::Float)
        .map_err(|_| AsmParseError::new(line_no, format!("invalid const literal '{token}'")))
}
