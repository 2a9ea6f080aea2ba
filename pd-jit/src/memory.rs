use std::ops::Range;

use crate::error::{JitError, JitResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadExecute,
}

/// A page-aligned mapping that can be flipped between writable and executable.
///
/// The mapping is never moved or resized; it is released when the value is dropped.
/// Protection is tracked per page, and writes to executable pages are refused.
pub struct ExecutableRegion {
    ptr: *mut u8,
    len: usize,
    page_size: usize,
    pages: Vec<Protection>,
    #[cfg(test)]
    protect_budget: Option<usize>,
}

// SAFETY: the region is a plain memory mapping owned by this value. All mutation goes
// through `&mut self`, and page protection changes are serialized by the owner.
unsafe impl Send for ExecutableRegion {}
// SAFETY: shared access only reads the base pointer and length.
unsafe impl Sync for ExecutableRegion {}

impl ExecutableRegion {
    /// Maps at least `min_len` bytes, rounded up to whole pages, initially read-write.
    pub fn reserve(min_len: usize) -> JitResult<Self> {
        if min_len == 0 {
            return Err(JitError::AllocationFailure {
                requested: 0,
                reason: "zero-sized region".to_string(),
            });
        }
        let page_size = sys::page_size();
        let len = min_len
            .checked_next_multiple_of(page_size)
            .ok_or_else(|| JitError::AllocationFailure {
                requested: min_len,
                reason: "size overflows the address space".to_string(),
            })?;
        let ptr = sys::map(len).map_err(|reason| JitError::AllocationFailure {
            requested: min_len,
            reason,
        })?;
        Ok(Self {
            ptr,
            len,
            page_size,
            pages: vec![Protection::ReadWrite; len / page_size],
            #[cfg(test)]
            protect_budget: None,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Changes the protection of a page-aligned span. Pages already in `protection`
    /// are left alone.
    pub fn protect(&mut self, offset: usize, len: usize, protection: Protection) -> JitResult<()> {
        if offset % self.page_size != 0 || len % self.page_size != 0 {
            return Err(JitError::Protection(format!(
                "span {offset}+{len} is not page aligned"
            )));
        }
        self.check_span(offset, len)?;
        let pages = offset / self.page_size..(offset + len) / self.page_size;
        if self.pages[pages.clone()].iter().all(|p| *p == protection) {
            return Ok(());
        }
        #[cfg(test)]
        self.spend_protect_budget()?;
        // SAFETY: the span lies inside the mapping (checked above).
        let ptr = unsafe { self.ptr.add(offset) };
        sys::protect(ptr, len, protection).map_err(JitError::Protection)?;
        self.pages[pages].fill(protection);
        Ok(())
    }

    /// Copies `bytes` into the region. Fails when any target page is executable.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> JitResult<()> {
        self.check_span(offset, bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }
        if self
            .protections(offset..offset + bytes.len())
            .iter()
            .any(|p| *p != Protection::ReadWrite)
        {
            return Err(JitError::Protection(format!(
                "write at {offset} targets executable pages"
            )));
        }
        // SAFETY: the span lies inside the mapping and every page in it is writable.
        unsafe { sys::write(self.ptr.add(offset), bytes) };
        Ok(())
    }

    /// Protection of the page holding `offset`.
    pub fn protection_at(&self, offset: usize) -> Option<Protection> {
        if offset >= self.len {
            return None;
        }
        self.pages.get(offset / self.page_size).copied()
    }

    /// Protection of every page touched by `range`, clamped to the mapping.
    pub fn protections(&self, range: Range<usize>) -> &[Protection] {
        let first = (range.start / self.page_size).min(self.pages.len());
        let last = range.end.div_ceil(self.page_size).clamp(first, self.pages.len());
        &self.pages[first..last]
    }

    /// Lets only `changes` more protection changes through; later ones fail.
    #[cfg(test)]
    pub(crate) fn limit_protection_changes(&mut self, changes: usize) {
        self.protect_budget = Some(changes);
    }

    #[cfg(test)]
    fn spend_protect_budget(&mut self) -> JitResult<()> {
        match &mut self.protect_budget {
            Some(0) => Err(JitError::Protection("protection change refused".to_string())),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn read(&self, offset: usize, len: usize) -> JitResult<&[u8]> {
        self.check_span(offset, len)?;
        // SAFETY: every page of the mapping stays readable under both protections.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) })
    }

    pub fn flush_icache(&self, offset: usize, len: usize) {
        if len == 0 || offset.saturating_add(len) > self.len {
            return;
        }
        // SAFETY: the span lies inside the mapping.
        sys::flush_icache(unsafe { self.ptr.add(offset) }, len);
    }

    fn check_span(&self, offset: usize, len: usize) -> JitResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(JitError::Protection(format!(
                "span {offset}+{len} outside region of {} bytes",
                self.len
            ))),
        }
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        if let Err(err) = sys::unmap(self.ptr, self.len) {
            tracing::warn!(error = %err, "failed to release executable region");
        }
    }
}

impl std::fmt::Debug for ExecutableRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableRegion")
            .field("base", &self.ptr)
            .field("len", &self.len)
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// Page size of the host, used to align shared segments.
pub fn page_size() -> usize {
    sys::page_size()
}

#[cfg(all(unix, not(target_os = "macos")))]
mod sys {
    use super::Protection;

    pub(super) fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 { 4096 } else { size as usize }
    }

    pub(super) fn map(len: usize) -> Result<*mut u8, String> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(format!("mmap failed: {}", std::io::Error::last_os_error()));
        }
        Ok(ptr as *mut u8)
    }

    pub(super) fn unmap(ptr: *mut u8, len: usize) -> Result<(), String> {
        let rc = unsafe { libc::munmap(ptr as *mut _, len) };
        if rc != 0 {
            return Err(format!("munmap failed: {}", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub(super) fn protect(ptr: *mut u8, len: usize, protection: Protection) -> Result<(), String> {
        let flags = match protection {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        };
        let rc = unsafe { libc::mprotect(ptr as *mut _, len, flags) };
        if rc != 0 {
            return Err(format!(
                "mprotect({protection:?}) failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }

    pub(super) unsafe fn write(dst: *mut u8, bytes: &[u8]) {
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
    }

    #[cfg(target_arch = "aarch64")]
    pub(super) fn flush_icache(ptr: *mut u8, len: usize) {
        unsafe extern "C" {
            fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
        }
        unsafe {
            __clear_cache(ptr as *mut libc::c_char, ptr.add(len) as *mut libc::c_char);
        }
    }

    #[cfg(not(target_arch = "aarch64"))]
    pub(super) fn flush_icache(_ptr: *mut u8, _len: usize) {}
}

#[cfg(target_os = "macos")]
mod sys {
    use super::Protection;

    unsafe extern "C" {
        fn pthread_jit_write_protect_supported_np() -> libc::c_int;
        fn pthread_jit_write_protect_np(enabled: libc::c_int);
        fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
    }

    pub(super) fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 { 16384 } else { size as usize }
    }

    pub(super) fn map(len: usize) -> Result<*mut u8, String> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(format!("mmap(MAP_JIT) failed: {}", std::io::Error::last_os_error()));
        }
        Ok(ptr as *mut u8)
    }

    pub(super) fn unmap(ptr: *mut u8, len: usize) -> Result<(), String> {
        let rc = unsafe { libc::munmap(ptr as *mut _, len) };
        if rc != 0 {
            return Err(format!("munmap failed: {}", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    // MAP_JIT pages stay RWX; W^X is enforced per thread around writes.
    pub(super) fn protect(_ptr: *mut u8, _len: usize, _protection: Protection) -> Result<(), String> {
        Ok(())
    }

    pub(super) unsafe fn write(dst: *mut u8, bytes: &[u8]) {
        unsafe {
            let use_write_protect = pthread_jit_write_protect_supported_np() != 0;
            if use_write_protect {
                pthread_jit_write_protect_np(0);
            }
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            if use_write_protect {
                pthread_jit_write_protect_np(1);
            }
        }
    }

    pub(super) fn flush_icache(ptr: *mut u8, len: usize) {
        unsafe { sys_icache_invalidate(ptr as *mut libc::c_void, len) };
    }
}

#[cfg(windows)]
mod sys {
    use super::Protection;
    use windows_sys::Win32::System::{
        Diagnostics::Debug::FlushInstructionCache,
        Memory::{
            MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE,
            VirtualAlloc, VirtualFree, VirtualProtect,
        },
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
        Threading::GetCurrentProcess,
    };

    pub(super) fn page_size() -> usize {
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        if info.dwPageSize == 0 {
            4096
        } else {
            info.dwPageSize as usize
        }
    }

    pub(super) fn map(len: usize) -> Result<*mut u8, String> {
        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            ) as *mut u8
        };
        if ptr.is_null() {
            return Err(format!(
                "VirtualAlloc failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(ptr)
    }

    pub(super) fn unmap(ptr: *mut u8, _len: usize) -> Result<(), String> {
        let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
        if ok == 0 {
            return Err(format!("VirtualFree failed: {}", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub(super) fn protect(ptr: *mut u8, len: usize, protection: Protection) -> Result<(), String> {
        let flags = match protection {
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::ReadExecute => PAGE_EXECUTE_READ,
        };
        let mut old_protect = 0u32;
        let ok = unsafe { VirtualProtect(ptr as *const _, len, flags, &mut old_protect) };
        if ok == 0 {
            return Err(format!(
                "VirtualProtect({protection:?}) failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }

    pub(super) unsafe fn write(dst: *mut u8, bytes: &[u8]) {
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
    }

    pub(super) fn flush_icache(ptr: *mut u8, len: usize) {
        let process = unsafe { GetCurrentProcess() };
        let ok = unsafe { FlushInstructionCache(process, ptr as *const _, len) };
        if ok == 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "FlushInstructionCache failed"
            );
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use super::Protection;

    pub(super) fn page_size() -> usize {
        4096
    }

    pub(super) fn map(_len: usize) -> Result<*mut u8, String> {
        Err("executable memory is not supported on this platform".to_string())
    }

    pub(super) fn unmap(_ptr: *mut u8, _len: usize) -> Result<(), String> {
        Ok(())
    }

    pub(super) fn protect(_ptr: *mut u8, _len: usize, _protection: Protection) -> Result<(), String> {
        Err("executable memory is not supported on this platform".to_string())
    }

    pub(super) unsafe fn write(_dst: *mut u8, _bytes: &[u8]) {}

    pub(super) fn flush_icache(_ptr: *mut u8, _len: usize) {}
}
