//! Blob-storage adapter for Huawei Cloud OBS.
//!
//! [`adapters::obs::ObsBackend`] implements the portable
//! [`adapters::StorageBackend`] contract on top of the vendor's
//! S3-compatible API, mapping vendor failures onto [`BackendError`].

pub mod adapters;
pub mod config;
pub mod model;
pub mod util;

pub use adapters::{obs::ObsBackend, StorageBackend};
pub use config::BackendConfig;
pub use model::{error::BackendError, multipart::MultipartUpload};
