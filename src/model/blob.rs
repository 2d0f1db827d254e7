use std::{collections::HashMap, fmt, time::SystemTime};

use aws_sdk_s3::primitives::ByteStream;

use crate::{model::error::BackendError, util};

/// Static limits of a backend instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub name: String,
    pub max_multipart_size: u64,
    pub max_parts: u32,
}

/// Snapshot of a single remote object as returned by a list page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobItem {
    pub key: String,
    pub etag: String,
    pub size: u64,
    pub last_modified: SystemTime,
    pub storage_class: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadBlobOutput {
    pub item: BlobItem,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub request_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ListBlobsInput {
    pub prefix: String,
    pub delimiter: String,
    pub max_keys: Option<u32>,
    pub continuation_token: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    pub items: Vec<BlobItem>,
    pub prefixes: Vec<String>,
    pub continuation_token: Option<String>,
    pub is_truncated: bool,
    pub request_id: Option<String>,
}

/// Body of a downloaded object. The stream is driven to completion on the
/// runtime the backend was built with.
pub struct BlobBody {
    stream: ByteStream,
    runtime: Option<tokio::runtime::Handle>,
}

impl BlobBody {
    pub(crate) fn new(stream: ByteStream, runtime: Option<tokio::runtime::Handle>) -> Self {
        Self { stream, runtime }
    }

    pub fn read_to_end(self) -> Result<Vec<u8>, BackendError> {
        let bytes = util::poll::block_in(self.runtime.as_ref(), self.stream.collect())
            .map_err(|err| {
                BackendError::service("ReadFailure", format!("failed to collect body: {}", err))
            })?;

        Ok(bytes.into_bytes().to_vec())
    }

    pub fn into_inner(self) -> ByteStream {
        self.stream
    }
}

impl fmt::Debug for BlobBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobBody").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct GetBlobOutput {
    pub head: HeadBlobOutput,
    pub body: BlobBody,
}

pub struct PutBlobInput {
    pub key: String,
    pub body: ByteStream,
    pub size: Option<u64>,
    pub content_type: Option<String>,
    /// Explicit storage class; the configured default applies when unset.
    pub storage_class: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl PutBlobInput {
    pub fn from_bytes(key: &str, data: Vec<u8>) -> Self {
        Self {
            key: key.to_string(),
            size: Some(data.len() as u64),
            body: ByteStream::from(data),
            content_type: None,
            storage_class: None,
            metadata: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutBlobOutput {
    pub etag: String,
    pub last_modified: SystemTime,
    pub storage_class: String,
    pub request_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteBlobsOutput {
    pub deleted: usize,
    pub request_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyBlobOutput {
    pub etag: String,
    pub last_modified: Option<SystemTime>,
    pub request_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartPartOutput {
    pub part_number: u32,
    pub etag: String,
    pub request_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartCommitOutput {
    pub etag: String,
    pub last_modified: SystemTime,
    pub request_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultipartExpireOutput {
    pub aborted: usize,
    pub kept: usize,
}
