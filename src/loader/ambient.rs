//! Process-wide "current loader" slot.
//!
//! Traced programs receive their loader explicitly through `LoadContext`, but
//! code they start on other threads can only find it here. A capture takes
//! ownership of the slot for the duration of its in-process run, installs its
//! tracking loader behind a guard, and the guard puts the previous loader back
//! when dropped, including during unwinding.

use crate::loader::{Loader, PathLoader};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use tracing::trace;

static CURRENT: RwLock<Option<Arc<dyn Loader>>> = RwLock::new(None);
static OWNER: Mutex<()> = Mutex::new(());
static BASE: OnceLock<Arc<dyn Loader>> = OnceLock::new();

/// The installed loader, or the base loader when nothing is installed.
pub fn current() -> Arc<dyn Loader> {
    let installed = CURRENT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    installed.unwrap_or_else(base)
}

/// True while some capture has a loader installed.
pub fn is_installed() -> bool {
    CURRENT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

/// Loader used when nothing is installed: the `LOADTRACE_PATH` search path.
pub fn base() -> Arc<dyn Loader> {
    BASE.get_or_init(|| Arc::new(PathLoader::from_env()) as Arc<dyn Loader>)
        .clone()
}

/// Exclusive right to swap the slot. Blocks while another capture holds it.
pub struct Ownership {
    _lock: MutexGuard<'static, ()>,
}

pub fn acquire() -> Ownership {
    Ownership {
        _lock: OWNER.lock().unwrap_or_else(PoisonError::into_inner),
    }
}

/// Restores the previously installed loader on drop.
#[must_use = "dropping the guard immediately restores the previous loader"]
pub struct AmbientGuard<'a> {
    previous: Option<Arc<dyn Loader>>,
    _owner: PhantomData<&'a Ownership>,
}

pub fn install<'a>(_owner: &'a Ownership, loader: Arc<dyn Loader>) -> AmbientGuard<'a> {
    let mut slot = CURRENT.write().unwrap_or_else(PoisonError::into_inner);
    let previous = slot.replace(loader);
    trace!(had_previous = previous.is_some(), "ambient loader installed");
    AmbientGuard {
        previous,
        _owner: PhantomData,
    }
}

impl Drop for AmbientGuard<'_> {
    fn drop(&mut self) {
        let mut slot = CURRENT.write().unwrap_or_else(PoisonError::into_inner);
        *slot = self.previous.take();
        trace!(restored = slot.is_some(), "ambient loader restored");
    }
}
