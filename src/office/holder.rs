//! Process-wide default pool for callers that are not wired with one.
//!
//! The holder only stores a reference; whoever installs a pool keeps
//! starting and stopping it.

use crate::office::pool::OfficePool;
use std::sync::{Arc, PoisonError, RwLock};

static INSTALLED: RwLock<Option<Arc<OfficePool>>> = RwLock::new(None);

pub fn get() -> Option<Arc<OfficePool>> {
    INSTALLED
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Install `pool` (or clear the slot with `None`), returning the previous one.
pub fn set(pool: Option<Arc<OfficePool>>) -> Option<Arc<OfficePool>> {
    let mut slot = INSTALLED.write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *slot, pool)
}
