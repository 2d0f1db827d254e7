use std::collections::HashMap;

use aws_sdk_s3::primitives::ByteStream;

use crate::model::{
    blob::{
        Capabilities, CopyBlobOutput, DeleteBlobsOutput, GetBlobOutput, HeadBlobOutput,
        ListBlobsInput, ListPage, MultipartCommitOutput, MultipartExpireOutput,
        MultipartPartOutput, PutBlobInput, PutBlobOutput,
    },
    error::BackendError,
    multipart::MultipartUpload,
};

pub mod mock;
pub mod obs;

/// Portable blob-storage contract. Every call blocks until the remote
/// exchange has finished.
pub trait StorageBackend: Send + Sync {
    /// Probe the bucket without changing anything.
    fn init(&self) -> Result<(), BackendError>;

    fn capabilities(&self) -> &Capabilities;

    fn bucket(&self) -> &str;

    fn head_blob(&self, key: &str) -> Result<HeadBlobOutput, BackendError>;

    /// One page per call; callers follow `continuation_token` themselves.
    fn list_blobs(&self, input: &ListBlobsInput) -> Result<ListPage, BackendError>;

    fn get_blob(&self, key: &str, start: u64, count: u64) -> Result<GetBlobOutput, BackendError>;

    fn put_blob(&self, input: PutBlobInput) -> Result<PutBlobOutput, BackendError>;

    fn delete_blob(&self, key: &str) -> Result<Option<String>, BackendError>;

    fn delete_blobs(&self, keys: &[String]) -> Result<DeleteBlobsOutput, BackendError>;

    /// `Some(metadata)` replaces the destination metadata outright.
    fn copy_blob(
        &self,
        source: &str,
        destination: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<CopyBlobOutput, BackendError>;

    fn rename_blob(&self, source: &str, destination: &str) -> Result<(), BackendError>;

    fn multipart_begin(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<MultipartUpload, BackendError>;

    fn multipart_add(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        body: ByteStream,
    ) -> Result<MultipartPartOutput, BackendError>;

    fn multipart_commit(&self, upload: &MultipartUpload)
        -> Result<MultipartCommitOutput, BackendError>;

    fn multipart_abort(&self, upload: &MultipartUpload) -> Result<(), BackendError>;

    fn multipart_expire(&self) -> Result<MultipartExpireOutput, BackendError>;

    fn make_bucket(&self, bucket: &str) -> Result<(), BackendError>;

    fn remove_bucket(&self, bucket: &str) -> Result<(), BackendError>;
}
