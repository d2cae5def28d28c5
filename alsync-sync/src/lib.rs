//! Last-writer-wins synchronization of replicated item directories
//!
//! - [`Scanner`] turns remote listings into change magnitudes
//! - [`ConflictResolver`] picks the authoritative replica per sub-path
//! - [`SyncCoordinator`] runs passes and drives tasks through backup and copy

pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod errors;
pub mod scanner;
pub mod workers;

pub use config::{SyncConfig, DEFAULT_BACKUP_DIR_NAME};
pub use conflict::{ConflictResolver, Resolution};
pub use coordinator::{PropagationStats, RunReport, ScanOutcome, SyncCoordinator};
pub use errors::{Result, SyncError};
pub use scanner::{ScanStats, Scanner};
pub use workers::{backup_hash, sidecar_path, Phase, PhaseReport, Worker};
