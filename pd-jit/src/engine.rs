use std::collections::HashSet;

use tracing::debug;

use crate::bytecode::BytecodeSource;
use crate::code_buffer::CodeBuffer;
use crate::config::JitConfig;
use crate::driver::TranslationDriver;
use crate::encoder::InstructionEncoder;
use crate::error::{DeclineReason, JitError, JitResult};
use crate::gate::NativeEntry;
use crate::segment::{Segment, SegmentId, SegmentTable};
use crate::switch;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslationAttempt {
    pub start_address: usize,
    pub result: Result<SegmentId, JitError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JitStats {
    pub translations: u64,
    pub exhausted: u64,
    pub encoding_failures: u64,
    pub declined: u64,
    pub code_bytes: usize,
    pub bytecode_bytes: usize,
}

/// Code buffer, segment table and translation bookkeeping for one JIT instance.
#[derive(Debug)]
pub struct JitEngine {
    config: JitConfig,
    buffer: CodeBuffer,
    table: SegmentTable,
    segment_align: usize,
    blocked: HashSet<usize>,
    attempts: Vec<TranslationAttempt>,
    stats: JitStats,
}

impl JitEngine {
    /// Reserves the code buffer. A failed reservation turns the process-wide switch off.
    pub fn new(config: JitConfig) -> JitResult<Self> {
        let buffer = match CodeBuffer::reserve(config.code_size) {
            Ok(buffer) => buffer,
            Err(err) => {
                switch::force_disable(&err);
                return Err(err);
            }
        };
        let segment_align = config.segment_align.max(1);
        Ok(Self {
            config,
            buffer,
            table: SegmentTable::new(),
            segment_align,
            blocked: HashSet::new(),
            attempts: Vec::new(),
            stats: JitStats::default(),
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// True when this engine may be consulted by a dispatch loop.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && switch::is_enabled()
    }

    /// Segment covering the bytecode address `address`.
    pub fn lookup(&self, address: usize) -> Option<&Segment> {
        self.table.lookup(address)
    }

    /// Entry point of the segment starting at `address`. Segments are entered at their
    /// start only.
    pub fn lookup_native(&self, address: usize) -> Option<NativeEntry> {
        self.table.starting_at(address).map(|segment| segment.entry)
    }

    /// Translates from pc `start` of `source` unless a segment already starts there or
    /// an earlier attempt from there failed.
    pub fn translate<S, E>(&mut self, source: &S, encoder: &mut E, start: usize) -> JitResult<SegmentId>
    where
        S: BytecodeSource + ?Sized,
        E: InstructionEncoder + ?Sized,
    {
        let address = source.address_of(start);
        if let Some(segment) = self.table.starting_at(address) {
            return Ok(segment.id);
        }
        if self.blocked.contains(&address) {
            return Err(JitError::Declined {
                pc: start,
                reason: DeclineReason::Blocked,
            });
        }

        let result = TranslationDriver::new(
            &mut self.buffer,
            &mut self.table,
            self.config.boundary_policy(),
        )
        .with_segment_align(self.segment_align)
        .translate(source, encoder, start);

        match &result {
            Ok(id) => {
                self.stats.translations += 1;
                if let Some(segment) = self.table.get(*id) {
                    self.stats.code_bytes += segment.code_len();
                    self.stats.bytecode_bytes += segment.bytecode.len();
                }
            }
            Err(err) => {
                match err {
                    JitError::BufferExhausted { .. } => self.stats.exhausted += 1,
                    JitError::EncodingFailure { .. } => self.stats.encoding_failures += 1,
                    _ => self.stats.declined += 1,
                }
                if !matches!(
                    err,
                    JitError::Declined {
                        reason: DeclineReason::InsideSegment,
                        ..
                    }
                ) {
                    self.blocked.insert(address);
                }
                debug!(start, address, error = %err, "translation failed");
            }
        }
        self.attempts.push(TranslationAttempt {
            start_address: address,
            result: result.clone(),
        });
        result
    }

    pub fn is_blocked(&self, address: usize) -> bool {
        self.blocked.contains(&address)
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.table.get(id)
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.table.iter()
    }

    pub fn segment_count(&self) -> usize {
        self.table.len()
    }

    pub fn buffer(&self) -> &CodeBuffer {
        &self.buffer
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    pub fn attempts(&self) -> &[TranslationAttempt] {
        &self.attempts
    }

    /// Starts every later segment on its own page so that reopening the boundary page
    /// for writing never touches code another thread may be running.
    pub(crate) fn align_segments_to_pages(&mut self) {
        self.segment_align = self.segment_align.max(self.buffer.page_size());
    }

    pub fn dump_text(&self) -> String {
        let mut out = String::new();
        out.push_str("native-jit:\n");
        out.push_str(&format!("  arch: {}\n", std::env::consts::ARCH));
        out.push_str(&format!("  enabled: {}\n", self.is_enabled()));
        out.push_str(&format!("  hot_threshold: {}\n", self.config.hot_threshold));
        out.push_str(&format!(
            "  code buffer: {} / {} bytes used, base=0x{:X}\n",
            self.buffer.cursor(),
            self.buffer.capacity(),
            self.buffer.base() as usize
        ));
        out.push_str(&format!("  segments: {}\n", self.table.len()));
        out.push_str(&format!("  translation attempts: {}\n", self.attempts.len()));
        for segment in self.table.iter() {
            out.push_str(&format!(
                "  segment#{} bytecode=[{}, {}) entry=0x{:X} code_bytes={}\n",
                segment.id.index(),
                segment.bytecode.start,
                segment.bytecode.end,
                segment.entry.as_ptr() as usize,
                segment.code_len()
            ));
        }
        let failures: Vec<&TranslationAttempt> =
            self.attempts.iter().filter(|a| a.result.is_err()).collect();
        if !failures.is_empty() {
            out.push_str("  failed translations:\n");
            for attempt in failures {
                if let Err(err) = &attempt.result {
                    out.push_str(&format!("    address={} {}\n", attempt.start_address, err));
                }
            }
        }
        out
    }
}
