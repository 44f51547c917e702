//! Crash-safe, concurrency-safe store for PRD documents
//!
//! ```no_run
//! use prd_store::{ProgressionEngine, ShellExecutor, StoreConfig};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> prd_store::Result<()> {
//! let dir = Path::new("docs");
//! let config = StoreConfig::discover(dir)?;
//! let engine = ProgressionEngine::new(config, Arc::new(ShellExecutor::new("./run-phase.sh")));
//! let outcome = engine.run_next(dir, &prd_store::owner_token()).await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod prd;
pub mod store;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use prd::{
    analyze, repair, validate, CycleReport, Document, IterationOutcome, PhaseExecutor,
    ProgressionEngine, RepairOptions, RepairReport, ShellExecutor, Story, ValidationResult,
};
pub use store::{owner_token, Collection, LockGuard};
