//! Supervised pool of external office processes.
//!
//! Callers submit closures over a [`office::Connection`]; the pool runs each
//! one on an idle instance, restarts instances that hang or crash, and
//! recycles processes after a configured number of tasks.

pub mod cli;
pub mod config;
pub mod converter;
pub mod error;
pub mod format;
pub mod office;
pub mod util;

pub use converter::{ConversionReport, DocumentConverter};
pub use error::{OfficeError, Result};
pub use office::{holder, OfficePool, PoolSettings};
