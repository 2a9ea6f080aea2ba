use std::ops::Range;

use tracing::debug;

use crate::error::{JitError, JitResult};
use crate::memory::{ExecutableRegion, Protection};

/// Append-only store for native code.
///
/// `base <= cursor <= end` holds at all times. The region is reserved once with a
/// fixed capacity and never relocated, so native addresses handed out stay valid for
/// the life of the buffer. Offsets below are relative to `base`.
#[derive(Debug)]
pub struct CodeBuffer {
    region: ExecutableRegion,
    capacity: usize,
    cursor: usize,
}

/// Cursor and boundary-page state captured before a translation starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Checkpoint {
    cursor: usize,
    boundary_page: Option<(usize, Protection)>,
}

impl CodeBuffer {
    pub fn reserve(capacity: usize) -> JitResult<Self> {
        let region = ExecutableRegion::reserve(capacity)?;
        debug!(
            capacity,
            mapped = region.len(),
            base = ?region.as_ptr(),
            "reserved native code buffer"
        );
        Ok(Self {
            region,
            capacity,
            cursor: 0,
        })
    }

    pub fn base(&self) -> *const u8 {
        self.region.as_ptr()
    }

    pub fn end(&self) -> *const u8 {
        self.base().wrapping_add(self.capacity)
    }

    /// Offset of the next free byte.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    pub fn page_size(&self) -> usize {
        self.region.page_size()
    }

    /// Native address of `offset`.
    pub fn address_of(&self, offset: usize) -> *const u8 {
        self.base().wrapping_add(offset)
    }

    /// Advances the cursor by `len` and returns the previous cursor.
    ///
    /// Pages touched by the new bytes are made writable. Content is left as is.
    pub fn allocate(&mut self, len: usize) -> JitResult<usize> {
        let available = self.remaining();
        if len > available {
            return Err(JitError::BufferExhausted {
                requested: len,
                available,
            });
        }
        let start = self.cursor;
        if len > 0 {
            self.set_protection(start..start + len, Protection::ReadWrite)?;
        }
        self.cursor = start + len;
        debug_assert!(self.cursor <= self.capacity);
        Ok(start)
    }

    /// Pads the cursor up to a multiple of `align`.
    pub fn align_cursor(&mut self, align: usize) -> JitResult<()> {
        if align <= 1 {
            return Ok(());
        }
        let target = self
            .cursor
            .checked_next_multiple_of(align)
            .unwrap_or(usize::MAX);
        if target > self.capacity {
            return Err(JitError::BufferExhausted {
                requested: target - self.cursor,
                available: self.remaining(),
            });
        }
        self.cursor = target;
        Ok(())
    }

    /// Writes into an allocated span. The span must not have been marked executable since.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> JitResult<()> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= self.cursor)
            .ok_or_else(|| {
                JitError::Protection(format!(
                    "write of {} bytes at {offset} is past the cursor {}",
                    bytes.len(),
                    self.cursor
                ))
            })?;
        debug_assert!(end <= self.capacity);
        self.region.write(offset, bytes)
    }

    pub fn bytes(&self, range: Range<usize>) -> JitResult<&[u8]> {
        if range.start > range.end || range.end > self.cursor {
            return Err(JitError::Protection(format!(
                "range {range:?} is outside the written code"
            )));
        }
        self.region.read(range.start, range.end - range.start)
    }

    /// Makes an allocated span executable and flushes the instruction cache. Idempotent.
    pub fn mark_executable(&mut self, range: Range<usize>) -> JitResult<()> {
        self.check_allocated(&range)?;
        if range.is_empty() {
            return Ok(());
        }
        self.set_protection(range.clone(), Protection::ReadExecute)?;
        self.region.flush_icache(range.start, range.end - range.start);
        Ok(())
    }

    /// Makes an allocated span writable again. Idempotent.
    pub fn mark_writable(&mut self, range: Range<usize>) -> JitResult<()> {
        self.check_allocated(&range)?;
        if range.is_empty() {
            return Ok(());
        }
        self.set_protection(range, Protection::ReadWrite)
    }

    pub fn protection_at(&self, offset: usize) -> Option<Protection> {
        if offset >= self.capacity {
            return None;
        }
        self.region.protection_at(offset)
    }

    pub fn is_executable(&self, range: Range<usize>) -> bool {
        !range.is_empty()
            && range.end <= self.cursor
            && self
                .region
                .protections(range)
                .iter()
                .all(|p| *p == Protection::ReadExecute)
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        let page = self.cursor / self.page_size();
        Checkpoint {
            cursor: self.cursor,
            boundary_page: self
                .region
                .protection_at(self.cursor)
                .map(|protection| (page, protection)),
        }
    }

    /// Drops everything allocated after `checkpoint`. Only the translation driver
    /// calls this, and only for code that was never committed.
    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) -> JitResult<()> {
        debug_assert!(checkpoint.cursor <= self.cursor);
        self.cursor = checkpoint.cursor.min(self.cursor);
        if let Some((page, protection)) = checkpoint.boundary_page {
            let page_size = self.page_size();
            self.region.protect(page * page_size, page_size, protection)?;
        }
        Ok(())
    }

    fn check_allocated(&self, range: &Range<usize>) -> JitResult<()> {
        if range.start > range.end || range.end > self.cursor {
            return Err(JitError::Protection(format!(
                "range {range:?} is outside the allocated code (cursor {})",
                self.cursor
            )));
        }
        Ok(())
    }

    /// Applies `protection` to every page touched by `range`.
    fn set_protection(&mut self, range: Range<usize>, protection: Protection) -> JitResult<()> {
        let page_size = self.page_size();
        let first = range.start / page_size * page_size;
        let last = range
            .end
            .div_ceil(page_size)
            .saturating_mul(page_size)
            .min(self.region.len());
        self.region.protect(first, last.saturating_sub(first), protection)
    }

    #[cfg(test)]
    pub(crate) fn limit_protection_changes(&mut self, changes: usize) {
        self.region.limit_protection_changes(changes);
    }
}
