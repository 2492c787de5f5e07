//! Process-wide serialization for the "create a descriptor, then mark it
//! close-on-exec" window on platforms/paths with no atomic syscall variant.

use lazy_static::lazy_static;
use std::sync::{Mutex, MutexGuard};

lazy_static! {
    static ref CLOEXEC_MUTEX: Mutex<()> = Mutex::new(());
}

/// A process-wide gate. Any code that creates a file descriptor without an
/// atomic close-on-exec variant, or that forks/spawns a child, must hold this
/// gate across the non-atomic section. Holders must not block on I/O other
/// than the brief descriptor-creation syscall while the gate is held.
pub struct CloexecGate;

impl CloexecGate {
    /// Acquire the gate, blocking until available.
    pub fn lock() -> anyhow::Result<CloexecGuard> {
        let guard = CLOEXEC_MUTEX
            .lock()
            .map_err(|e| anyhow::anyhow!("cloexec mutex poisoned: {e}"))?;
        Ok(CloexecGuard(guard))
    }
}

/// RAII guard holding the process-wide gate.
pub struct CloexecGuard<'a>(MutexGuard<'a, ()>);
