//! Process-wide JIT instance, set up once at VM startup.

use std::sync::OnceLock;

use tracing::info;

use crate::config::JitConfig;
use crate::error::{JitError, JitResult};
use crate::shared::SharedJit;
use crate::switch;

static GLOBAL: OnceLock<SharedJit> = OnceLock::new();

/// Reserves the process-wide code buffer and turns the switch on.
///
/// Returns `Ok(None)` when the config disables the JIT. A failed reservation leaves
/// the switch off and returns the error; interpretation is unaffected either way.
pub fn init(config: JitConfig) -> JitResult<Option<&'static SharedJit>> {
    if GLOBAL.get().is_some() {
        return Err(JitError::AlreadyInitialized);
    }
    if !config.enabled {
        info!("jit disabled by configuration");
        switch::disable();
        return Ok(None);
    }
    let code_size = config.code_size;
    let jit = SharedJit::new(config)?;
    GLOBAL.set(jit).map_err(|_| JitError::AlreadyInitialized)?;
    let enabled = switch::enable();
    info!(code_size, enabled, "jit initialized");
    Ok(GLOBAL.get())
}

pub fn get() -> Option<&'static SharedJit> {
    GLOBAL.get()
}

/// Turns the switch off. The code buffer stays mapped until the process exits.
pub fn shutdown() {
    switch::disable();
    if GLOBAL.get().is_some() {
        info!("jit shut down");
    }
}
