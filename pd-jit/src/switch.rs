//! Process-wide enablement switch.
//!
//! Written at initialization and shutdown only. The dispatch loop reads it before
//! every decision to consult native code; when it is off the VM is a plain
//! interpreter.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::JitError;

static ENABLED: AtomicBool = AtomicBool::new(false);

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

/// Turns native execution on. Returns false and leaves the switch off on hosts
/// without native code support.
pub fn enable() -> bool {
    if !native_supported() {
        tracing::info!("native code is not supported on this host; jit stays disabled");
        ENABLED.store(false, Ordering::Release);
        return false;
    }
    ENABLED.store(true, Ordering::Release);
    true
}

pub fn disable() {
    ENABLED.store(false, Ordering::Release);
}

pub(crate) fn force_disable(cause: &JitError) {
    tracing::warn!(error = %cause, "disabling jit");
    disable();
}

/// Whether this target has an executable-memory backend and a native encoder.
pub fn native_supported() -> bool {
    cfg!(any(
        all(
            target_arch = "x86_64",
            any(target_os = "linux", target_os = "windows")
        ),
        all(
            target_arch = "aarch64",
            any(target_os = "linux", target_os = "macos")
        )
    ))
}
