use crate::error::{DecodeError, FetchError, RendererError};
use crate::id::ImageId;
use crate::volume::Volume;

/// Fetches an image's raw bytes from wherever they live.
///
/// Called from worker threads, so implementations must be shareable.
pub trait ImageDownloader: Send + Sync {
    fn download(&self, id: &ImageId) -> Result<Vec<u8>, FetchError>;
}

/// Decodes raw file bytes into a [`Volume`].
pub trait VolumeCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Volume, DecodeError>;
}

/// The display surface volumes are handed to.
///
/// Driven from a single dedicated thread; implementations own whatever
/// rendering state they need and are never shared.
pub trait VolumeRenderer: Send {
    /// Called before [`display`](Self::display). When `scan_changed` is
    /// true the upcoming volume belongs to a different scan than the last
    /// one shown, and any per-scan display state should be rebuilt.
    fn prepare(&mut self, scan_changed: bool);

    fn display(&mut self, volume: &Volume) -> Result<(), RendererError>;
}
