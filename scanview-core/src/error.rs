use thiserror::Error;

use crate::id::ImageId;

/// Errors originating from the session data model.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("duplicate experiment id: {0}")]
    DuplicateExperiment(String),

    #[error("duplicate scan id: {0}")]
    DuplicateScan(String),

    #[error("duplicate image id: {0}")]
    DuplicateImage(String),

    #[error("unknown experiment id: {0}")]
    UnknownExperiment(String),

    #[error("unknown scan id: {0}")]
    UnknownScan(String),

    #[error("invalid volume: {reason}")]
    InvalidVolume { reason: String },
}

/// Failure to obtain an image's raw bytes.
///
/// Cloneable so a single in-flight failure can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("download of {id} failed: {reason}")]
    Download { id: ImageId, reason: String },

    #[error("server returned HTTP {status} for {id}")]
    Http { id: ImageId, status: u16 },

    #[error("download of {0} was abandoned before completing")]
    Abandoned(ImageId),
}

/// Failure to decode raw bytes into a volume.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("unsupported voxel data type code: {0}")]
    UnsupportedDataType(i16),

    #[error("payload truncated: expected {expected} bytes of voxel data, got {actual}")]
    TruncatedData { expected: usize, actual: usize },
}

/// Failure to display a volume on a renderer.
#[derive(Debug, Error)]
pub enum RendererError {
    #[error("volume incompatible with renderer: {reason}")]
    Incompatible { reason: String },
}
