use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::bytecode::BytecodeSource;
use crate::config::JitConfig;
use crate::encoder::InstructionEncoder;
use crate::engine::JitEngine;
use crate::error::JitResult;
use crate::gate::NativeEntry;
use crate::segment::SegmentId;

/// A JIT engine shared by any number of interpreters.
///
/// Lookups take the read lock. Translation holds the write lock for the whole
/// allocate, encode, mark and insert sequence, so a reader never sees a segment
/// whose code is not executable yet.
#[derive(Clone, Debug)]
pub struct SharedJit {
    inner: Arc<RwLock<JitEngine>>,
}

impl SharedJit {
    /// Creates an engine whose segments each start on a fresh page.
    pub fn new(config: JitConfig) -> JitResult<Self> {
        let mut engine = JitEngine::new(config)?;
        engine.align_segments_to_pages();
        Ok(Self::from_engine(engine))
    }

    /// Wraps an engine as is. Only safe to share across threads when no thread runs
    /// native code while another translates, since segments may then share pages.
    pub fn from_engine(engine: JitEngine) -> Self {
        Self {
            inner: Arc::new(RwLock::new(engine)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.read().is_enabled()
    }

    pub fn hot_threshold(&self) -> u32 {
        self.inner.read().config().hot_threshold
    }

    pub fn lookup_native(&self, address: usize) -> Option<NativeEntry> {
        self.inner.read().lookup_native(address)
    }

    /// True when some segment covers the bytecode address `address` or translation
    /// from it already failed.
    pub fn is_settled(&self, address: usize) -> bool {
        let engine = self.inner.read();
        engine.lookup(address).is_some() || engine.is_blocked(address)
    }

    pub fn translate<S, E>(&self, source: &S, encoder: &mut E, start: usize) -> JitResult<SegmentId>
    where
        S: BytecodeSource + ?Sized,
        E: InstructionEncoder + ?Sized,
    {
        self.inner.write().translate(source, encoder, start)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, JitEngine> {
        self.inner.read()
    }

    pub fn dump_text(&self) -> String {
        self.inner.read().dump_text()
    }
}
