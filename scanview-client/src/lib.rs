pub mod nifti;
pub mod rest;
pub mod tree;

// Re-export primary types for convenience.
pub use nifti::NiftiCodec;
pub use rest::{ApiConfig, ClientError, RestClient};
pub use tree::load_session_tree;
