//! Token-driven catch-up synchronisation.

pub mod syncer;

pub use syncer::{DeltaError, DeltaSyncer, SyncerConfig};
