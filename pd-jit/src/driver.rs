use std::ops::Range;

use tracing::{debug, error, trace, warn};

use crate::bytecode::{BytecodeSource, Flow};
use crate::code_buffer::{Checkpoint, CodeBuffer};
use crate::encoder::{Emitter, InstructionEncoder};
use crate::error::{DeclineReason, JitError, JitResult};
use crate::gate::{self, NativeEntry};
use crate::segment::{SegmentId, SegmentTable};

/// Where a segment may end besides control transfers, barriers and existing segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundaryPolicy {
    pub max_instructions: usize,
    /// Once a segment has this many native bytes, no further instruction is added.
    pub max_code_bytes: usize,
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        Self {
            max_instructions: 256,
            max_code_bytes: 64 * 1024,
        }
    }
}

/// Turns one bytecode range into a committed segment, or leaves no trace at all.
pub struct TranslationDriver<'a> {
    buffer: &'a mut CodeBuffer,
    table: &'a mut SegmentTable,
    policy: BoundaryPolicy,
    segment_align: usize,
}

struct Emitted {
    bytecode: Range<usize>,
    code: Range<usize>,
    instructions: usize,
}

impl<'a> TranslationDriver<'a> {
    pub fn new(
        buffer: &'a mut CodeBuffer,
        table: &'a mut SegmentTable,
        policy: BoundaryPolicy,
    ) -> Self {
        Self {
            buffer,
            table,
            policy,
            segment_align: 1,
        }
    }

    pub fn with_segment_align(mut self, align: usize) -> Self {
        self.segment_align = align.max(1);
        self
    }

    /// Translates the range starting at pc `start` of `source`.
    ///
    /// A pc that already starts a segment yields that segment without emitting code.
    /// On any failure the buffer cursor is back where it was and nothing is committed.
    ///
    /// # Panics
    ///
    /// Panics if the produced range overlaps a committed segment. The range is cut at
    /// the next segment start, so this only happens if the table is corrupt.
    pub fn translate<S, E>(
        &mut self,
        source: &S,
        encoder: &mut E,
        start: usize,
    ) -> JitResult<SegmentId>
    where
        S: BytecodeSource + ?Sized,
        E: InstructionEncoder + ?Sized,
    {
        let start_address = source.address_of(start);
        if let Some(existing) = self.table.lookup(start_address) {
            if existing.bytecode.start == start_address {
                return Ok(existing.id);
            }
            return Err(JitError::Declined {
                pc: start,
                reason: DeclineReason::InsideSegment,
            });
        }

        let checkpoint = self.buffer.checkpoint();
        let emitted = match self.emit_segment(source, encoder, start) {
            Ok(emitted) => emitted,
            Err(err) => {
                let err = self.abandon(checkpoint, err);
                debug!(start, error = %err, cursor = self.buffer.cursor(), "translation rolled back");
                return Err(err);
            }
        };

        // Code must be executable before a lookup can hand out its entry.
        if let Err(err) = self.buffer.mark_executable(emitted.code.clone()) {
            return Err(self.abandon(checkpoint, err));
        }
        let entry = NativeEntry::new(self.buffer.address_of(emitted.code.start));
        match self
            .table
            .insert(emitted.bytecode.clone(), emitted.code.clone(), entry)
        {
            Ok(id) => {
                debug!(
                    segment = id.index(),
                    bytecode = ?emitted.bytecode,
                    code = ?emitted.code,
                    instructions = emitted.instructions,
                    "committed segment"
                );
                Ok(id)
            }
            Err(JitError::Overlap { new, existing }) => {
                error!(?new, ?existing, "translation produced an overlapping segment");
                panic!("segment {new:?} overlaps committed segment {existing:?}");
            }
            Err(err) => Err(self.abandon(checkpoint, err)),
        }
    }

    /// Rolls the buffer back after `err` and hands `err` back unchanged.
    ///
    /// The cursor is always restored. A failure to restore the boundary page's
    /// protection is only logged, so callers still see why translation failed.
    fn abandon(&mut self, checkpoint: Checkpoint, err: JitError) -> JitError {
        if let Err(rollback) = self.buffer.rollback(checkpoint) {
            warn!(
                error = %rollback,
                cause = %err,
                "rollback could not restore page protection"
            );
        }
        err
    }

    fn emit_segment<S, E>(&mut self, source: &S, encoder: &mut E, start: usize) -> JitResult<Emitted>
    where
        S: BytecodeSource + ?Sized,
        E: InstructionEncoder + ?Sized,
    {
        let base = source.base_address();
        let limit = self
            .table
            .next_start_after(base + start)
            .map_or(source.code_len(), |next| (next - base).min(source.code_len()));
        let first = source
            .decode(start)
            .filter(|insn| is_translatable(insn.opcode, insn.flow) && insn.next_pc() <= limit)
            .ok_or(JitError::Declined {
                pc: start,
                reason: DeclineReason::EmptyRange,
            })?;
        trace!(start, opcode = first.opcode, limit, "translating segment");

        self.buffer.align_cursor(self.segment_align)?;
        let code_start = self.buffer.cursor();
        let mut emit = Emitter::new(self.buffer);
        encoder.prologue(&mut emit)?;

        let mut pc = start;
        let mut instructions = 0usize;
        while pc < limit
            && instructions < self.policy.max_instructions
            && (instructions == 0 || emit.written() < self.policy.max_code_bytes)
        {
            let Some(insn) = source.decode(pc) else {
                break;
            };
            if !is_translatable(insn.opcode, insn.flow) || insn.next_pc() > limit {
                break;
            }
            let before = emit.position();
            encoder.encode(&insn, &mut emit)?;
            trace!(
                pc,
                opcode = insn.opcode,
                bytes = emit.position() - before,
                "encoded instruction"
            );
            instructions += 1;
            pc = insn.next_pc();
            if insn.flow == Flow::Terminal {
                break;
            }
        }

        encoder.epilogue(pc, &mut emit)?;
        let code_end = emit.position();
        Ok(Emitted {
            bytecode: base + start..base + pc,
            code: code_start..code_end,
            instructions,
        })
    }
}

fn is_translatable(opcode: u8, flow: Flow) -> bool {
    opcode != gate::CALLBACK_RETURN && flow != Flow::Barrier
}
