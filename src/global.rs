//! Process-wide default engine.
//!
//! Prefer constructing a [`RequestEngine`] and passing it around. The
//! default instance exists for call sites that have no handle; it is built
//! lazily from [`EngineConfig::default`] unless one was installed with
//! [`set_default_engine`].

use std::sync::{Arc, PoisonError, RwLock};

use crate::{EngineConfig, RequestEngine};

static DEFAULT_ENGINE: RwLock<Option<Arc<RequestEngine>>> = RwLock::new(None);

/// Returns the default engine, creating it on first use.
pub fn default_engine() -> Arc<RequestEngine> {
    if let Some(engine) = DEFAULT_ENGINE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
    {
        return Arc::clone(engine);
    }

    let mut slot = DEFAULT_ENGINE
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    Arc::clone(slot.get_or_insert_with(|| Arc::new(RequestEngine::new(EngineConfig::default()))))
}

/// Installs `engine` as the default and returns a handle to it.
pub fn set_default_engine(engine: RequestEngine) -> Arc<RequestEngine> {
    let engine = Arc::new(engine);
    *DEFAULT_ENGINE
        .write()
        .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&engine));
    engine
}

/// Drops the default engine; the next [`default_engine`] call builds a fresh one.
pub fn reset_default_engine() {
    DEFAULT_ENGINE
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
}
