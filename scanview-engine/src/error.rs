use thiserror::Error;

use scanview_core::ImageId;

/// Errors surfaced by [`SessionContext`](crate::session::SessionContext).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("image {0} is not part of the loaded session")]
    UnknownImage(ImageId),
}
