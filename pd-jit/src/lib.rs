//! Native code buffer and segment dispatch for a stack bytecode VM.
//!
//! The pieces, bottom up:
//!
//! - [`CodeBuffer`]: one fixed reservation of executable memory, handed out append-only
//!   under W^X.
//! - [`SegmentTable`]: committed bytecode ranges and their native entry points, looked up
//!   by bytecode address.
//! - [`TranslationDriver`]: turns a bytecode range into a segment through an
//!   [`InstructionEncoder`], or rolls back and commits nothing.
//! - [`gate`]: the `CALLBACK_RETURN` hand-off where native code returns to the dispatch
//!   loop with an [`ExitReason`].
//! - [`switch`]: the process-wide on/off flag the dispatch loop checks first.
//!
//! [`JitEngine`] and [`SharedJit`] tie these together, and [`vm`] is the reference
//! interpreter that drives them.

pub mod assembler;
pub mod bytecode;
pub mod code_buffer;
pub mod config;
pub mod driver;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod gate;
pub mod global;
#[cfg(feature = "cli")]
pub mod logging;
pub mod memory;
pub mod segment;
pub mod shared;
pub mod switch;
pub mod vm;

pub use assembler::{AsmParseError, Assembler, AssemblerError, assemble};
pub use bytecode::{BytecodeSource, Flow, Instruction};
pub use code_buffer::CodeBuffer;
pub use config::{ConfigError, DEFAULT_CODE_SIZE, JitConfig};
pub use driver::{BoundaryPolicy, TranslationDriver};
pub use encoder::{Emitter, InstructionEncoder};
pub use engine::{JitEngine, JitStats, TranslationAttempt};
pub use error::{DeclineReason, JitError, JitResult};
pub use gate::{CALLBACK_RETURN, ExitReason, GateExit, GateFrame, NativeEntry};
pub use memory::{ExecutableRegion, Protection};
pub use segment::{Segment, SegmentId, SegmentTable};
pub use shared::SharedJit;
pub use vm::{NativeEncoder, OpCode, Program, SafepointFlag, Value, Vm, VmError, VmResult, VmStatus};
