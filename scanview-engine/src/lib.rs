pub mod cache;
pub mod error;
pub mod pool;
pub mod prefetch;
pub mod ranges;
pub mod session;
pub mod state;
pub mod swap;
pub mod token;

// Re-export primary types for convenience.
pub use cache::{CachedVolume, RawFileCache, VolumeCache};
pub use error::EngineError;
pub use pool::{BatchRun, DecodeTask, PoolError, TaskEnv, TaskError, TaskOutcome, WorkerPool};
pub use ranges::RangeTable;
pub use session::{EngineConfig, SessionContext};
pub use state::SessionState;
pub use token::{CancelToken, RunId};
