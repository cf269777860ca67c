pub mod collab;
pub mod error;
pub mod hierarchy;
pub mod id;
pub mod range;
pub mod volume;

// Re-export primary types for convenience.
pub use collab::{ImageDownloader, VolumeCodec, VolumeRenderer};
pub use error::{CoreError, DecodeError, FetchError, RendererError};
pub use hierarchy::{Decision, Experiment, Image, Scan, SessionTree, SessionTreeBuilder};
pub use id::{ExperimentId, ImageId, ScanId, SiteId};
pub use range::IntensityRange;
pub use volume::Volume;

/// Convenience result type for the core crate.
pub type Result<T> = std::result::Result<T, CoreError>;
