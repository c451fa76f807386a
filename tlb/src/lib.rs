//! Alpha AXP address-translation core: per-CPU TLBs, a shared set-associative
//! translation cache, a three-level page-table walker, and the pipeline,
//! collision, error, and optimizer machinery that coordinate them.
//!
//! [`integrator::TlbCacheIntegrator`] is the entry point; everything else is
//! exposed for embedders that want finer-grained control or direct access to
//! statistics.

pub mod cache;
pub mod collab;
pub mod collision;
pub mod config;
pub mod coordinator;
pub mod entry;
pub mod error;
pub mod faults;
pub mod integrator;
pub mod observer;
pub mod optimizer;
pub mod pagetable;
pub mod percpu;
pub mod system;
pub mod translator;
pub mod walker;

pub use config::Config;
pub use error::{TranslationError, TranslationResult};
pub use integrator::{HitLevel, Response, TlbCacheIntegrator};
