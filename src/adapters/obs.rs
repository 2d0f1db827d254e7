use std::{collections::HashMap, time::SystemTime};

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    operation::RequestId,
    primitives::ByteStream,
};
use time::OffsetDateTime;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tracing::{debug, error, info, warn};

use crate::{
    adapters::StorageBackend,
    config::{BackendConfig, DEFAULT_STORAGE_CLASS},
    model::{
        blob::{
            BlobBody, BlobItem, Capabilities, CopyBlobOutput, DeleteBlobsOutput, GetBlobOutput,
            HeadBlobOutput, ListBlobsInput, ListPage, MultipartCommitOutput, MultipartExpireOutput,
            MultipartPartOutput, PutBlobInput, PutBlobOutput,
        },
        error::{classify, BackendError, VendorError},
        multipart::{MultipartUpload, PartGap, UploadState, MAX_PARTS},
        obs::{CopyRequest, InitiateRequest, ListQuery, ObsRpc, PartRequest, PutRequest, RpcFuture},
    },
    util::{
        object::{copy_source, metadata_to_lower, range_header, size_from_length, to_system_time},
        poll,
    },
};

pub const MAX_MULTIPART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// In-flight uploads older than this are swept by `multipart_expire`.
pub const MULTIPART_RETENTION: time::Duration = time::Duration::hours(48);

const DELETE_BATCH: usize = 1000;

pub struct ObsBackend {
    cap: Capabilities,
    bucket: String,
    config: BackendConfig,
    client: Box<dyn ObsRpc>,
    runtime: Option<Handle>,
    // Kept alive when the backend had to start its own runtime.
    owned_runtime: Option<Runtime>,
}

fn request_id<T: RequestId>(output: &T) -> Option<String> {
    output.request_id().map(str::to_string)
}

impl ObsBackend {
    /// Build a backend talking to a real OBS endpoint. Uses the caller's
    /// tokio runtime when there is one, otherwise starts a small one.
    ///
    /// Calls block the calling thread while the runtime's workers drive the
    /// IO, so a current-thread runtime is rejected with `Config`.
    pub fn new(bucket: &str, config: BackendConfig) -> Result<Self, BackendError> {
        if !config.endpoint.starts_with("https://") && !config.endpoint.starts_with("http://") {
            return Err(BackendError::Config(format!(
                "failed to create obs client, invalid endpoint: {}",
                config.endpoint
            )));
        }

        let (owned_runtime, runtime) = match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                return Err(BackendError::Config(
                    "a current-thread runtime cannot drive blocking obs calls".to_string(),
                ));
            }
            Ok(handle) => (None, handle),
            Err(_) => {
                let owned = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("obsblob-io")
                    .enable_all()
                    .build()
                    .map_err(|err| {
                        BackendError::Config(format!("failed to start io runtime: {}", err))
                    })?;
                let handle = owned.handle().clone();
                (Some(owned), handle)
            }
        };

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint);
        if config.has_static_credentials() {
            loader = loader.credentials_provider(Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                "obsblob-static",
            ));
        }

        let sdk_config = poll::block_in(Some(&runtime), loader.load());
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.path_style)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_config);

        info!(
            bucket = bucket,
            endpoint = %config.endpoint,
            region = %config.region,
            "created obs backend"
        );

        let mut backend = Self::with_client(bucket, config, Box::new(client));
        backend.runtime = Some(runtime);
        backend.owned_runtime = owned_runtime;
        Ok(backend)
    }

    pub fn with_client(bucket: &str, config: BackendConfig, client: Box<dyn ObsRpc>) -> Self {
        Self {
            cap: Capabilities {
                name: "obs".to_string(),
                max_multipart_size: MAX_MULTIPART_SIZE,
                max_parts: MAX_PARTS,
            },
            bucket: bucket.to_string(),
            config,
            client,
            runtime: Handle::try_current().ok(),
            owned_runtime: None,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn call<T>(&self, operation: &str, future: RpcFuture<T>) -> Result<T, BackendError> {
        poll::block_in(self.runtime.as_ref(), future).map_err(|err| self.surface(operation, &err))
    }

    /// Classify a vendor failure. Unmapped failures are logged here and
    /// nowhere else; region mismatches are never logged.
    fn surface(&self, operation: &str, err: &VendorError) -> BackendError {
        let mapped = classify(err);
        if let BackendError::Service { .. } = mapped {
            error!(
                http = ?err.status,
                code = ?err.code,
                request = ?err.request_id,
                bucket = %self.bucket,
                error_message = err.message.as_deref().unwrap_or(""),
                error_group = operation,
                "obs request failed"
            );
        }
        mapped
    }

    fn terminal_error(upload: &MultipartUpload, state: UploadState) -> BackendError {
        BackendError::NotFound(format!(
            "upload {} of {} is already {:?}",
            upload.upload_id(),
            upload.key(),
            state
        ))
    }
}

impl Drop for ObsBackend {
    fn drop(&mut self) {
        // Dropping a runtime from inside another async context panics.
        if let Some(runtime) = self.owned_runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl StorageBackend for ObsBackend {
    fn init(&self) -> Result<(), BackendError> {
        match self.call("head_bucket", self.client.head_bucket(&self.bucket)) {
            Ok(_) => Ok(()),
            Err(err) => {
                if err.is_not_found() || err.is_permission_denied() {
                    error!(
                        bucket = %self.bucket,
                        error_message = %err,
                        error_group = "head_bucket",
                        "bucket is not accessible"
                    );
                }
                Err(err)
            }
        }
    }

    fn capabilities(&self) -> &Capabilities {
        &self.cap
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn head_blob(&self, key: &str) -> Result<HeadBlobOutput, BackendError> {
        let out = self.call("head_object", self.client.head_object(&self.bucket, key))?;

        Ok(HeadBlobOutput {
            item: BlobItem {
                key: key.to_string(),
                etag: out.e_tag().unwrap_or_default().to_string(),
                size: size_from_length(out.content_length()),
                last_modified: to_system_time(out.last_modified()),
                storage_class: out
                    .storage_class()
                    .map(|class| class.as_str())
                    .unwrap_or(DEFAULT_STORAGE_CLASS)
                    .to_string(),
            },
            content_type: out.content_type().map(str::to_string),
            metadata: out.metadata().cloned().unwrap_or_default(),
            request_id: request_id(&out),
        })
    }

    fn list_blobs(&self, input: &ListBlobsInput) -> Result<ListPage, BackendError> {
        let query = ListQuery {
            prefix: Some(input.prefix.clone()).filter(|p| !p.is_empty()),
            delimiter: Some(input.delimiter.clone()).filter(|d| !d.is_empty()),
            max_keys: input.max_keys.map(|m| m.min(i32::MAX as u32) as i32),
            marker: input.continuation_token.clone().filter(|t| !t.is_empty()),
        };
        debug!(query = ?query, "list_blobs");

        let out = self.call("list_objects", self.client.list_objects(&self.bucket, query))?;

        let items: Vec<BlobItem> = out
            .contents()
            .iter()
            .map(|o| BlobItem {
                key: o.key().unwrap_or_default().to_string(),
                etag: o.e_tag().unwrap_or_default().to_string(),
                size: size_from_length(o.size()),
                last_modified: to_system_time(o.last_modified()),
                storage_class: o
                    .storage_class()
                    .map(|class| class.as_str())
                    .unwrap_or(DEFAULT_STORAGE_CLASS)
                    .to_string(),
            })
            .collect();
        let prefixes: Vec<String> = out
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix())
            .map(str::to_string)
            .collect();

        let is_truncated = out.is_truncated().unwrap_or(false);
        // Without a delimiter the service sends no NextMarker; the greatest
        // entry on the page resumes the listing.
        let continuation_token = if is_truncated {
            out.next_marker()
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .or_else(|| {
                    items
                        .last()
                        .map(|item| item.key.clone())
                        .into_iter()
                        .chain(prefixes.last().cloned())
                        .max()
                })
        } else {
            None
        };

        Ok(ListPage {
            request_id: request_id(&out),
            items,
            prefixes,
            continuation_token,
            is_truncated,
        })
    }

    fn get_blob(&self, key: &str, start: u64, count: u64) -> Result<GetBlobOutput, BackendError> {
        let range = range_header(start, count);
        debug!(key = key, range = ?range, "get_blob");

        let out = self.call(
            "get_object",
            self.client.get_object(&self.bucket, key, range),
        )?;

        let head = HeadBlobOutput {
            item: BlobItem {
                key: key.to_string(),
                etag: out.e_tag().unwrap_or_default().to_string(),
                size: size_from_length(out.content_length()),
                last_modified: to_system_time(out.last_modified()),
                storage_class: out
                    .storage_class()
                    .map(|class| class.as_str())
                    .unwrap_or(DEFAULT_STORAGE_CLASS)
                    .to_string(),
            },
            content_type: out.content_type().map(str::to_string),
            metadata: out.metadata().cloned().unwrap_or_default(),
            request_id: request_id(&out),
        };

        Ok(GetBlobOutput {
            head,
            body: BlobBody::new(out.body, self.runtime.clone()),
        })
    }

    fn put_blob(&self, input: PutBlobInput) -> Result<PutBlobOutput, BackendError> {
        let storage_class = self
            .config
            .storage_class_for(input.size, input.storage_class.as_deref());
        debug!(key = %input.key, size = ?input.size, storage_class = %storage_class, "put_blob");

        let req = PutRequest {
            key: input.key,
            body: input.body,
            size: input.size.map(|size| size as i64),
            content_type: input.content_type,
            storage_class: storage_class.clone(),
            acl: self.config.acl.clone(),
            metadata: metadata_to_lower(&input.metadata),
        };
        let out = self.call("put_object", self.client.put_object(&self.bucket, req))?;

        Ok(PutBlobOutput {
            etag: out.e_tag().unwrap_or_default().to_string(),
            // The response carries no modification time; its arrival is the
            // closest local observation.
            last_modified: SystemTime::now(),
            storage_class,
            request_id: request_id(&out),
        })
    }

    fn delete_blob(&self, key: &str) -> Result<Option<String>, BackendError> {
        let out = self.call("delete_object", self.client.delete_object(&self.bucket, key))?;
        Ok(request_id(&out))
    }

    fn delete_blobs(&self, keys: &[String]) -> Result<DeleteBlobsOutput, BackendError> {
        let mut output = DeleteBlobsOutput {
            deleted: 0,
            request_id: None,
        };
        let mut failures: Vec<(String, VendorError)> = Vec::new();

        for batch in keys.chunks(DELETE_BATCH) {
            let result = poll::block_in(
                self.runtime.as_ref(),
                self.client.delete_objects(&self.bucket, batch.to_vec()),
            );
            // A failed batch leaves all of its keys behind; later batches
            // still run so the report covers every key.
            let out = match result {
                Ok(out) => out,
                Err(err) => {
                    failures.extend(batch.iter().map(|key| (key.clone(), err.clone())));
                    continue;
                }
            };

            output.request_id = request_id(&out);
            output.deleted += batch.len().saturating_sub(out.errors().len());
            for err in out.errors() {
                failures.push((
                    err.key().unwrap_or_default().to_string(),
                    VendorError {
                        status: None,
                        code: err.code().map(str::to_string),
                        message: err.message().map(str::to_string),
                        request_id: output.request_id.clone(),
                    },
                ));
            }
        }

        if let Some((_, first)) = failures.first() {
            let failed: Vec<&str> = failures.iter().map(|(key, _)| key.as_str()).collect();
            let summary = VendorError {
                message: Some(format!(
                    "failed to delete {} of {} keys [{}]: {}",
                    failed.len(),
                    keys.len(),
                    failed.join(", "),
                    first.message.as_deref().unwrap_or("-")
                )),
                ..first.clone()
            };
            return Err(self.surface("delete_objects", &summary));
        }

        Ok(output)
    }

    fn copy_blob(
        &self,
        source: &str,
        destination: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<CopyBlobOutput, BackendError> {
        let req = CopyRequest {
            source: copy_source(&self.bucket, source),
            destination: destination.to_string(),
            metadata: metadata.map(metadata_to_lower),
            acl: self.config.acl.clone(),
        };
        debug!(
            source = source,
            destination = destination,
            replace = req.metadata.is_some(),
            "copy_blob"
        );

        let out = self.call("copy_object", self.client.copy_object(&self.bucket, req))?;
        let result = out.copy_object_result();

        Ok(CopyBlobOutput {
            etag: result
                .and_then(|r| r.e_tag())
                .unwrap_or_default()
                .to_string(),
            last_modified: result
                .and_then(|r| r.last_modified())
                .map(|date| to_system_time(Some(date))),
            request_id: request_id(&out),
        })
    }

    fn rename_blob(&self, source: &str, destination: &str) -> Result<(), BackendError> {
        Err(BackendError::Unsupported(format!(
            "obs has no atomic rename: {} -> {}",
            source, destination
        )))
    }

    fn multipart_begin(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<MultipartUpload, BackendError> {
        let metadata = metadata_to_lower(metadata);
        let req = InitiateRequest {
            key: key.to_string(),
            storage_class: self.config.storage_class.clone(),
            acl: self.config.acl.clone(),
            metadata: metadata.clone(),
        };

        let out = self.call(
            "create_multipart_upload",
            self.client.create_multipart_upload(&self.bucket, req),
        )?;
        let upload_id = out.upload_id().ok_or_else(|| {
            BackendError::service(
                "MissingUploadId",
                format!("no upload id returned for: {}", key),
            )
        })?;

        debug!(key = key, upload_id = upload_id, "multipart_begin");
        Ok(MultipartUpload::new(key, upload_id, metadata))
    }

    fn multipart_add(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        body: ByteStream,
    ) -> Result<MultipartPartOutput, BackendError> {
        MultipartUpload::check_part_number(part_number);

        let state = upload.state();
        if state.is_terminal() {
            return Err(Self::terminal_error(upload, state));
        }

        let req = PartRequest {
            key: upload.key().to_string(),
            upload_id: upload.upload_id().to_string(),
            part_number: part_number as i32,
            body,
        };
        debug!(
            key = upload.key(),
            upload_id = upload.upload_id(),
            part_number = part_number,
            "multipart_add"
        );

        let out = self.call("upload_part", self.client.upload_part(&self.bucket, req))?;
        let etag = out
            .e_tag()
            .ok_or_else(|| {
                BackendError::service(
                    "MissingETag",
                    format!("no etag returned for part {} of: {}", part_number, upload.key()),
                )
            })?
            .to_string();

        // A commit or abort may have won the race while the part was in flight.
        upload
            .record_part(part_number, &etag)
            .map_err(|state| Self::terminal_error(upload, state))?;

        Ok(MultipartPartOutput {
            part_number,
            etag,
            request_id: request_id(&out),
        })
    }

    fn multipart_commit(
        &self,
        upload: &MultipartUpload,
    ) -> Result<MultipartCommitOutput, BackendError> {
        let state = upload.state();
        if state.is_terminal() {
            return Err(Self::terminal_error(upload, state));
        }

        let parts = upload.completed_parts().map_err(|gap| {
            let message = match gap {
                PartGap::Empty => format!("no parts uploaded for: {}", upload.key()),
                PartGap::Missing(part_number) => {
                    format!("part {} of {} was never uploaded", part_number, upload.key())
                }
                PartGap::CountMismatch { counted, filled } => format!(
                    "{} parts counted but {} slots filled for: {}",
                    counted,
                    filled,
                    upload.key()
                ),
            };
            self.surface(
                "complete_multipart_upload",
                &VendorError {
                    code: Some("InvalidPart".to_string()),
                    message: Some(message),
                    ..Default::default()
                },
            )
        })?;

        let out = self.call(
            "complete_multipart_upload",
            self.client.complete_multipart_upload(
                &self.bucket,
                upload.key(),
                upload.upload_id(),
                parts,
            ),
        )?;
        upload.finish(UploadState::Committed);
        debug!(
            key = upload.key(),
            upload_id = upload.upload_id(),
            parts = upload.num_parts(),
            "multipart_commit"
        );

        Ok(MultipartCommitOutput {
            etag: out.e_tag().unwrap_or_default().to_string(),
            last_modified: SystemTime::now(),
            request_id: request_id(&out),
        })
    }

    fn multipart_abort(&self, upload: &MultipartUpload) -> Result<(), BackendError> {
        match upload.state() {
            UploadState::Aborted => {
                debug!(upload_id = upload.upload_id(), "multipart upload already aborted");
                return Ok(());
            }
            UploadState::Committed => {
                return Err(Self::terminal_error(upload, UploadState::Committed));
            }
            _ => {}
        }

        let result = self.call(
            "abort_multipart_upload",
            self.client
                .abort_multipart_upload(&self.bucket, upload.key(), upload.upload_id()),
        );

        match result {
            Ok(_) => {
                upload.finish(UploadState::Aborted);
                Ok(())
            }
            // Gone on the server already, e.g. swept by expire.
            Err(err) if err.is_not_found() => {
                upload.finish(UploadState::Aborted);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn multipart_expire(&self) -> Result<MultipartExpireOutput, BackendError> {
        let now = OffsetDateTime::now_utc();
        let mut output = MultipartExpireOutput::default();
        let mut key_marker = None;
        let mut upload_id_marker = None;

        'sweep: loop {
            let page = self.call(
                "list_multipart_uploads",
                self.client.list_multipart_uploads(
                    &self.bucket,
                    key_marker.take(),
                    upload_id_marker.take(),
                ),
            )?;
            debug!(uploads = page.uploads().len(), "multipart_expire page");

            for upload in page.uploads() {
                let key = upload.key().unwrap_or_default();
                let upload_id = upload.upload_id().unwrap_or_default();
                let initiated = upload
                    .initiated()
                    .map(|date| OffsetDateTime::from(to_system_time(Some(date))));

                let expired =
                    initiated.is_some_and(|initiated| now - initiated > MULTIPART_RETENTION);
                if !expired {
                    debug!(key = key, upload_id = upload_id, "keeping mpu");
                    output.kept += 1;
                    continue;
                }

                let result = self.call(
                    "abort_multipart_upload",
                    self.client.abort_multipart_upload(&self.bucket, key, upload_id),
                );
                match result {
                    Ok(_) => {
                        info!(key = key, upload_id = upload_id, "aborted expired mpu");
                        output.aborted += 1;
                    }
                    Err(err) if err.is_permission_denied() => {
                        warn!(
                            error_message = %err,
                            error_group = "multipart_expire",
                            "not allowed to abort uploads, stopping sweep"
                        );
                        break 'sweep;
                    }
                    // Service failures were already logged by `call`.
                    Err(BackendError::Service { .. }) => {}
                    Err(err) => {
                        warn!(
                            key = key,
                            upload_id = upload_id,
                            error_message = %err,
                            error_group = "multipart_expire",
                            "failed to abort expired mpu"
                        );
                    }
                }
            }

            if !page.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = page.next_key_marker().map(str::to_string);
            upload_id_marker = page.next_upload_id_marker().map(str::to_string);
            if key_marker.is_none() && upload_id_marker.is_none() {
                break;
            }
        }

        Ok(output)
    }

    fn make_bucket(&self, bucket: &str) -> Result<(), BackendError> {
        debug!(bucket = bucket, "make_bucket is managed outside this backend");
        Ok(())
    }

    fn remove_bucket(&self, bucket: &str) -> Result<(), BackendError> {
        debug!(bucket = bucket, "remove_bucket is managed outside this backend");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use proptest::prelude::*;

    use super::*;
    use crate::{
        adapters::mock::{etag_of, MockObsClient},
        config::SmallObjectPolicy,
    };

    const BUCKET: &str = "dummy-bucket";

    fn backend() -> (ObsBackend, MockObsClient) {
        backend_with(BackendConfig::default())
    }

    fn backend_with(config: BackendConfig) -> (ObsBackend, MockObsClient) {
        let client = MockObsClient::new(BUCKET);
        let backend = ObsBackend::with_client(BUCKET, config, Box::new(client.clone()));
        (backend, client)
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .finish();

        let result = tracing::subscriber::with_default(subscriber, f);
        let logs = String::from_utf8_lossy(&buffer.0.lock().unwrap()).to_string();
        (result, logs)
    }

    fn list_all(
        backend: &ObsBackend,
        prefix: &str,
        delimiter: &str,
        max_keys: u32,
    ) -> (Vec<String>, Vec<String>, usize) {
        let mut input = ListBlobsInput {
            prefix: prefix.to_string(),
            delimiter: delimiter.to_string(),
            max_keys: Some(max_keys),
            continuation_token: None,
        };
        let mut keys = Vec::new();
        let mut prefixes = Vec::new();
        let mut pages = 0;

        loop {
            let page = backend.list_blobs(&input).unwrap();
            pages += 1;
            keys.extend(page.items.into_iter().map(|item| item.key));
            prefixes.extend(page.prefixes);
            if !page.is_truncated {
                break;
            }
            input.continuation_token = page.continuation_token;
        }

        (keys, prefixes, pages)
    }

    #[test]
    fn test_init() {
        let (backend, client) = backend();
        assert!(backend.init().is_ok());
        assert_eq!(client.calls(), vec!["head_bucket".to_string()]);

        let client = MockObsClient::new("other-bucket");
        let backend = ObsBackend::with_client(BUCKET, BackendConfig::default(), Box::new(client));
        assert!(backend.init().unwrap_err().is_not_found());
    }

    #[test]
    fn test_capabilities() {
        let (backend, _) = backend();

        assert_eq!(backend.capabilities().name, "obs");
        assert_eq!(backend.capabilities().max_multipart_size, 5 * 1024 * 1024 * 1024);
        assert_eq!(backend.capabilities().max_parts, 10_000);
        assert_eq!(backend.bucket(), BUCKET);
    }

    #[test]
    fn test_new_rejects_bad_endpoint() {
        let config = BackendConfig {
            endpoint: "obs.cn-east-3.myhuaweicloud.com".to_string(),
            ..Default::default()
        };

        assert!(matches!(ObsBackend::new(BUCKET, config), Err(BackendError::Config(_))));
    }

    #[test]
    fn test_new_rejects_current_thread_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        assert!(matches!(
            ObsBackend::new(BUCKET, BackendConfig::default()),
            Err(BackendError::Config(_))
        ));
    }

    #[test]
    fn test_owned_runtime_dropped_in_async_context() {
        let config = BackendConfig {
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            ..Default::default()
        };
        let backend = ObsBackend::new(BUCKET, config).unwrap();

        let outer = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        outer.block_on(async move { drop(backend) });
    }

    #[test]
    fn test_put_then_head() {
        let (backend, _) = backend();

        let cases: Vec<(&str, Vec<u8>)> = vec![
            ("file", b"hello world".to_vec()),
            ("folder/empty", Vec::new()),
            ("folder/subfolder/large", vec![7u8; 256 * 1024]),
        ];

        for (key, body) in cases {
            let mut input = PutBlobInput::from_bytes(key, body.clone());
            input.content_type = Some("text/plain".to_string());
            input.metadata = HashMap::from([("X-Owner".to_string(), "Ops".to_string())]);

            let put = backend.put_blob(input).unwrap();
            let head = backend.head_blob(key).unwrap();

            assert_eq!(head.item.size, body.len() as u64, "failed on `size` for case: {}", key);
            assert_eq!(head.item.etag, put.etag, "failed on `etag` for case: {}", key);
            assert_eq!(head.item.etag, etag_of(&body), "failed on `etag` for case: {}", key);
            assert_eq!(
                head.item.storage_class, "STANDARD",
                "failed on `storage_class` for case: {}",
                key
            );
            assert_eq!(head.content_type.as_deref(), Some("text/plain"));
            assert_eq!(head.metadata.get("x-owner").map(String::as_str), Some("Ops"));
            assert!(!head.metadata.contains_key("X-Owner"));
        }
    }

    #[test]
    fn test_head_missing() {
        let (backend, _) = backend();
        assert!(backend.head_blob("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_put_small_object_policy() {
        let config = BackendConfig {
            small_object: Some(SmallObjectPolicy {
                threshold: 1024,
                storage_class: "WARM".to_string(),
                override_explicit: false,
            }),
            ..Default::default()
        };
        let (backend, client) = backend_with(config);

        let small = backend.put_blob(PutBlobInput::from_bytes("small", vec![1; 10])).unwrap();
        let large = backend.put_blob(PutBlobInput::from_bytes("large", vec![1; 4096])).unwrap();
        let mut explicit = PutBlobInput::from_bytes("explicit", vec![1; 10]);
        explicit.storage_class = Some("COLD".to_string());
        let explicit = backend.put_blob(explicit).unwrap();

        assert_eq!(small.storage_class, "WARM");
        assert_eq!(large.storage_class, "STANDARD");
        assert_eq!(explicit.storage_class, "COLD");
        assert_eq!(client.object("small").unwrap().storage_class, "WARM");
        assert_eq!(backend.head_blob("small").unwrap().item.storage_class, "WARM");
    }

    #[test]
    fn test_list_partitions_prefixes() {
        let (backend, _) = backend();
        for key in ["a/1", "a/2", "a/b/3", "a/b/c/4", "a/d/5", "b/6", "a"] {
            backend.put_blob(PutBlobInput::from_bytes(key, b"x".to_vec())).unwrap();
        }

        let page = backend
            .list_blobs(&ListBlobsInput {
                prefix: "a/".to_string(),
                delimiter: "/".to_string(),
                ..Default::default()
            })
            .unwrap();

        let keys: Vec<_> = page.items.iter().map(|item| item.key.as_str()).collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
        assert_eq!(page.prefixes, vec!["a/b/".to_string(), "a/d/".to_string()]);
        assert!(!page.is_truncated);
        assert_eq!(page.continuation_token, None);

        for key in &keys {
            assert!(
                !page.prefixes.iter().any(|p| key.starts_with(p.as_str())),
                "key {} also covered by a prefix",
                key
            );
        }
    }

    #[test]
    fn test_list_empty_filters_not_sent() {
        let (backend, client) = backend();
        for key in ["a/1", "b/2", "c"] {
            client.insert_object(key, b"x");
        }

        let page = backend.list_blobs(&ListBlobsInput::default()).unwrap();

        assert_eq!(page.items.len(), 3);
        assert!(page.prefixes.is_empty());
        assert_eq!(client.last_list(), Some(ListQuery::default()));
    }

    #[test]
    fn test_list_pagination() {
        let (backend, client) = backend();
        let all = ["a/1", "a/2", "a/b/3", "a/b/4", "a/c/5", "a/d", "a/e/6"];
        for key in all {
            client.insert_object(key, b"x");
        }

        let (keys, prefixes, pages) = list_all(&backend, "", "", 2);
        assert_eq!(keys, all.iter().map(|k| k.to_string()).collect::<Vec<_>>());
        assert!(prefixes.is_empty());
        assert_eq!(pages, 4);

        let (keys, prefixes, _) = list_all(&backend, "a/", "/", 2);
        assert_eq!(keys, vec!["a/1", "a/2", "a/d"]);
        assert_eq!(prefixes, vec!["a/b/", "a/c/", "a/e/"]);
    }

    #[test]
    fn test_get_blob_ranges() {
        let (backend, _) = backend();
        backend
            .put_blob(PutBlobInput::from_bytes("data", b"0123456789".to_vec()))
            .unwrap();

        let cases = vec![
            ((0, 0), "0123456789"),
            ((0, 4), "0123"),
            ((3, 2), "34"),
            ((6, 0), "6789"),
            ((8, 10), "89"),
        ];

        for ((start, count), expected) in cases {
            let out = backend.get_blob("data", start, count).unwrap();
            let body = out.body.read_to_end().unwrap();
            assert_eq!(
                String::from_utf8(body).unwrap(),
                expected,
                "failed for case: {}+{}",
                start,
                count
            );
            assert_eq!(out.head.item.size, expected.len() as u64);
        }
    }

    #[test]
    fn test_get_missing() {
        let (backend, _) = backend();
        assert!(backend.get_blob("nope", 0, 0).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_blob() {
        let (backend, client) = backend();
        client.insert_object("file", b"x");

        backend.delete_blob("file").unwrap();

        assert!(client.object("file").is_none());
    }

    #[test]
    fn test_delete_blobs_reports_failures() {
        let (backend, client) = backend();
        for key in ["a", "b", "c"] {
            client.insert_object(key, b"x");
        }
        client.fail_key("b", VendorError::new(403, "AccessDenied", "access denied"));

        let keys: Vec<String> = ["a", "b", "c"].iter().map(|k| k.to_string()).collect();
        let err = backend.delete_blobs(&keys).unwrap_err();

        match err {
            BackendError::PermissionDenied(message) => {
                assert!(message.contains("[b]"), "unexpected message: {}", message)
            }
            other => panic!("expected permission denied, got {:?}", other),
        }
        assert_eq!(client.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn test_delete_blobs_batches() {
        let (backend, client) = backend();
        let keys: Vec<String> = (0..2500).map(|i| format!("key-{:04}", i)).collect();
        for key in &keys {
            client.insert_object(key, b"x");
        }

        let out = backend.delete_blobs(&keys).unwrap();

        assert_eq!(out.deleted, 2500);
        assert_eq!(client.count_calls("delete_objects"), 3);
        assert!(client.keys().is_empty());
        assert_eq!(backend.delete_blobs(&[]).unwrap().deleted, 0);
        assert_eq!(client.count_calls("delete_objects"), 3);
    }

    #[test]
    fn test_delete_blobs_keeps_earlier_failures() {
        let (backend, client) = backend();
        let keys: Vec<String> = (0..1500).map(|i| format!("key-{:04}", i)).collect();
        for key in &keys {
            client.insert_object(key, b"x");
        }
        client.fail_key("key-0003", VendorError::new(403, "AccessDenied", "access denied"));
        client.fail_after(
            "delete_objects",
            1,
            VendorError::new(500, "InternalError", "we encountered an internal error"),
        );

        let err = backend.delete_blobs(&keys).unwrap_err();

        match err {
            BackendError::PermissionDenied(message) => {
                assert!(message.contains("501 of 1500"), "unexpected message: {}", message);
                assert!(message.contains("key-0003"), "unexpected message: {}", message);
                assert!(message.contains("key-1000"), "unexpected message: {}", message);
                assert!(message.contains("key-1499"), "unexpected message: {}", message);
            }
            other => panic!("expected permission denied, got {:?}", other),
        }
        assert_eq!(client.count_calls("delete_objects"), 2);
        assert_eq!(client.keys().len(), 501);
    }

    #[test]
    fn test_copy_blob_metadata() {
        let (backend, client) = backend();
        let mut input = PutBlobInput::from_bytes("dir/src file", b"payload".to_vec());
        input.metadata = HashMap::from([
            ("a".to_string(), "1".to_string()),
            ("keep".to_string(), "no".to_string()),
        ]);
        let put = backend.put_blob(input).unwrap();

        let copied = backend.copy_blob("dir/src file", "dst-copy", None).unwrap();
        assert_eq!(copied.etag, put.etag);
        assert_eq!(client.object("dst-copy").unwrap().metadata.len(), 2);

        let replacement = HashMap::from([("B".to_string(), "2".to_string())]);
        backend
            .copy_blob("dir/src file", "dst-replace", Some(&replacement))
            .unwrap();
        let head = backend.head_blob("dst-replace").unwrap();
        assert_eq!(
            head.metadata,
            HashMap::from([("b".to_string(), "2".to_string())])
        );
        assert_eq!(head.item.size, 7);
    }

    #[test]
    fn test_copy_missing_source() {
        let (backend, _) = backend();
        assert!(backend.copy_blob("nope", "dst", None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_rename_unsupported() {
        let (backend, client) = backend();
        client.insert_object("src", b"x");

        let err = backend.rename_blob("src", "dst").unwrap_err();

        assert!(matches!(err, BackendError::Unsupported(_)));
        assert!(client.calls().is_empty());
        assert_eq!(client.keys(), vec!["src".to_string()]);
    }

    #[test]
    fn test_bucket_lifecycle_noop() {
        let (backend, client) = backend();

        assert!(backend.make_bucket("new-bucket").is_ok());
        assert!(backend.remove_bucket(BUCKET).is_ok());
        assert!(client.calls().is_empty());
    }

    fn upload_parts(backend: &ObsBackend, upload: &MultipartUpload, order: &[u32]) {
        for part_number in order {
            let body = ByteStream::from(format!("<{}>", part_number).into_bytes());
            backend.multipart_add(upload, *part_number, body).unwrap();
        }
    }

    #[test]
    fn test_multipart_roundtrip() {
        let (backend, client) = backend();
        let metadata = HashMap::from([("Mode".to_string(), "0644".to_string())]);

        let upload = backend.multipart_begin("big", &metadata).unwrap();
        assert_eq!(upload.state(), UploadState::Initiated);
        assert_eq!(upload.metadata().get("mode").map(String::as_str), Some("0644"));

        upload_parts(&backend, &upload, &[2, 3, 1]);
        assert_eq!(upload.num_parts(), 3);
        assert_eq!(upload.state(), UploadState::Uploading);

        let out = backend.multipart_commit(&upload).unwrap();

        assert_eq!(upload.state(), UploadState::Committed);
        let object = client.object("big").unwrap();
        assert_eq!(object.data, b"<1><2><3>".to_vec());
        assert_eq!(object.etag, out.etag);
        assert_eq!(object.metadata.get("mode").map(String::as_str), Some("0644"));
        assert!(client.upload_ids().is_empty());
    }

    #[test]
    fn test_multipart_commit_with_gap_fails() {
        let (backend, client) = backend();
        let upload = backend.multipart_begin("big", &HashMap::new()).unwrap();
        upload_parts(&backend, &upload, &[1, 3]);

        let err = backend.multipart_commit(&upload).unwrap_err();

        match err {
            BackendError::Service { code, .. } => assert_eq!(code, "InvalidPart"),
            other => panic!("expected service error, got {:?}", other),
        }
        assert_eq!(client.count_calls("complete_multipart_upload"), 0);
        assert_eq!(upload.state(), UploadState::Uploading);
        assert!(backend.multipart_abort(&upload).is_ok());
    }

    #[test]
    fn test_multipart_commit_empty_fails() {
        let (backend, _) = backend();
        let upload = backend.multipart_begin("big", &HashMap::new()).unwrap();

        assert!(matches!(
            backend.multipart_commit(&upload),
            Err(BackendError::Service { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "already set")]
    fn test_multipart_duplicate_part_panics() {
        let (backend, _) = backend();
        let upload = backend.multipart_begin("big", &HashMap::new()).unwrap();

        upload_parts(&backend, &upload, &[1, 1]);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_multipart_part_out_of_range_panics() {
        let (backend, _) = backend();
        let upload = backend.multipart_begin("big", &HashMap::new()).unwrap();

        let _ = backend.multipart_add(&upload, MAX_PARTS + 1, ByteStream::from(vec![1]));
    }

    #[test]
    fn test_multipart_abort_then_commit() {
        let (backend, client) = backend();
        let upload = backend.multipart_begin("big", &HashMap::new()).unwrap();
        upload_parts(&backend, &upload, &[1]);

        backend.multipart_abort(&upload).unwrap();

        assert_eq!(upload.state(), UploadState::Aborted);
        assert!(client.upload_ids().is_empty());
        assert!(backend.multipart_commit(&upload).unwrap_err().is_not_found());
        assert!(backend
            .multipart_add(&upload, 2, ByteStream::from(vec![1]))
            .unwrap_err()
            .is_not_found());
        // Second abort is a no-op.
        assert!(backend.multipart_abort(&upload).is_ok());
        assert_eq!(client.count_calls("abort_multipart_upload"), 1);
        assert!(client.object("big").is_none());
    }

    #[test]
    fn test_multipart_abort_after_commit() {
        let (backend, client) = backend();
        let upload = backend.multipart_begin("big", &HashMap::new()).unwrap();
        upload_parts(&backend, &upload, &[1]);
        backend.multipart_commit(&upload).unwrap();

        assert!(backend.multipart_abort(&upload).unwrap_err().is_not_found());
        assert!(backend.multipart_commit(&upload).unwrap_err().is_not_found());
        assert_eq!(client.count_calls("abort_multipart_upload"), 0);
        assert!(client.object("big").is_some());
    }

    #[test]
    fn test_multipart_add_racing_abort() {
        let (backend, client) = backend();
        let upload = Arc::new(backend.multipart_begin("big", &HashMap::new()).unwrap());
        upload_parts(&backend, &upload, &[1]);

        // The abort lands while part 2 is on the wire.
        let racing = upload.clone();
        client.on_call("upload_part", move || {
            racing.finish(UploadState::Aborted);
        });

        let err = backend
            .multipart_add(&upload, 2, ByteStream::from(vec![2]))
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(upload.state(), UploadState::Aborted);
        assert_eq!(upload.num_parts(), 1);
        assert_eq!(upload.part_etag(2), None);
    }

    #[test]
    fn test_multipart_abort_swept_upload() {
        let (backend, _) = backend();
        let upload = backend.multipart_begin("big", &HashMap::new()).unwrap();
        let twin = MultipartUpload::new("big", upload.upload_id(), HashMap::new());
        // The server side is gone once the first handle aborts.
        backend.multipart_abort(&upload).unwrap();

        assert!(backend.multipart_abort(&twin).unwrap_err().is_not_found());
        assert_eq!(twin.state(), UploadState::Aborted);
        assert!(backend.multipart_abort(&twin).is_ok());
    }

    #[test]
    fn test_multipart_begin_denied() {
        let (backend, _) = backend();
        let client = MockObsClient::new(BUCKET);
        client.fail(
            "create_multipart_upload",
            VendorError::new(403, "AccessDenied", "access denied"),
        );
        let denied = ObsBackend::with_client(BUCKET, BackendConfig::default(), Box::new(client));

        assert!(denied
            .multipart_begin("big", &HashMap::new())
            .unwrap_err()
            .is_permission_denied());
        assert!(backend.multipart_begin("big", &HashMap::new()).is_ok());
    }

    #[test]
    fn test_multipart_concurrent_add() {
        let (backend, client) = backend();
        let upload = backend.multipart_begin("big", &HashMap::new()).unwrap();

        std::thread::scope(|scope| {
            for worker in 0..4u32 {
                let backend = &backend;
                let upload = &upload;
                scope.spawn(move || {
                    for part_number in (1..=64u32).filter(|n| n % 4 == worker) {
                        let body = ByteStream::from(vec![part_number as u8]);
                        backend.multipart_add(upload, part_number, body).unwrap();
                    }
                });
            }
        });

        assert_eq!(upload.num_parts(), 64);
        backend.multipart_commit(&upload).unwrap();
        let expected: Vec<u8> = (1..=64u8).collect();
        assert_eq!(client.object("big").unwrap().data, expected);
    }

    proptest! {
        #[test]
        fn prop_commit_any_order(
            order in (1..=16u32).prop_flat_map(|n| Just((1..=n).collect::<Vec<_>>()).prop_shuffle())
        ) {
            let (backend, client) = backend();
            let upload = backend.multipart_begin("big", &HashMap::new()).unwrap();

            upload_parts(&backend, &upload, &order);
            prop_assert!(backend.multipart_commit(&upload).is_ok());

            let expected: String = (1..=order.len()).map(|n| format!("<{}>", n)).collect();
            prop_assert_eq!(client.object("big").unwrap().data, expected.into_bytes());
        }

        #[test]
        fn prop_commit_with_gap_fails(
            (order, missing) in (2..=16u32)
                .prop_flat_map(|n| (Just(n), 1..n))
                .prop_flat_map(|(n, missing)| {
                    let parts: Vec<u32> = (1..=n).filter(|p| *p != missing).collect();
                    (Just(parts).prop_shuffle(), Just(missing))
                })
        ) {
            let (backend, client) = backend();
            let upload = backend.multipart_begin("big", &HashMap::new()).unwrap();

            upload_parts(&backend, &upload, &order);
            prop_assert!(backend.multipart_commit(&upload).is_err());
            prop_assert!(upload.part_etag(missing).is_none());
            prop_assert!(client.object("big").is_none());
        }
    }

    fn hours_ago(hours: u64) -> SystemTime {
        SystemTime::now() - Duration::from_secs(hours * 3600)
    }

    #[test]
    fn test_expire() {
        let (backend, client) = backend();
        let old = client.insert_upload("old", hours_ago(49));
        let older = client.insert_upload("older", hours_ago(24 * 7));
        let fresh = client.insert_upload("fresh", hours_ago(47));
        let new = client.insert_upload("new", SystemTime::now());

        let out = backend.multipart_expire().unwrap();

        assert_eq!(out, MultipartExpireOutput { aborted: 2, kept: 2 });
        let remaining = client.upload_ids();
        assert!(!remaining.contains(&old));
        assert!(!remaining.contains(&older));
        assert!(remaining.contains(&fresh));
        assert!(remaining.contains(&new));
        // Two pages of two uploads.
        assert_eq!(client.count_calls("list_multipart_uploads"), 2);
    }

    #[test]
    fn test_expire_retention_boundary() {
        let (backend, client) = backend();
        let retention = Duration::from_secs(48 * 3600);
        let young = client.insert_upload(
            "young",
            SystemTime::now() - retention + Duration::from_millis(900),
        );
        let old = client.insert_upload(
            "old",
            SystemTime::now() - retention - Duration::from_secs(2),
        );

        let out = backend.multipart_expire().unwrap();

        assert_eq!(out, MultipartExpireOutput { aborted: 1, kept: 1 });
        assert_eq!(client.upload_ids(), vec![young]);
        assert!(!client.upload_ids().contains(&old));
    }

    #[test]
    fn test_expire_stops_on_permission_denied() {
        let (backend, client) = backend();
        for key in ["a", "b", "c"] {
            client.insert_upload(key, hours_ago(72));
        }
        client.fail(
            "abort_multipart_upload",
            VendorError::new(403, "AccessDenied", "access denied"),
        );

        let out = backend.multipart_expire().unwrap();

        assert_eq!(out.aborted, 0);
        assert_eq!(client.count_calls("abort_multipart_upload"), 1);
        assert_eq!(client.upload_ids().len(), 3);
    }

    #[test]
    fn test_expire_continues_past_other_failures() {
        let (backend, client) = backend();
        for key in ["a", "b"] {
            client.insert_upload(key, hours_ago(72));
        }
        client.fail(
            "abort_multipart_upload",
            VendorError::new(500, "InternalError", "we encountered an internal error"),
        );

        assert!(backend.multipart_expire().is_ok());
        assert_eq!(client.count_calls("abort_multipart_upload"), 2);
    }

    #[test]
    fn test_expire_list_failure_surfaces() {
        let (backend, client) = backend();
        client.fail(
            "list_multipart_uploads",
            VendorError::new(403, "AccessDenied", "access denied"),
        );

        assert!(backend.multipart_expire().unwrap_err().is_permission_denied());
    }

    #[test]
    fn test_region_mismatch_is_silent() {
        let (backend, client) = backend();
        client.fail(
            "head_object",
            VendorError::new(400, "BucketRegionError", "bucket is in another region")
                .with_request_id("req-1"),
        );

        let (result, logs) = capture_logs(|| backend.head_blob("file"));

        assert!(result.unwrap_err().is_region_mismatch());
        assert!(!logs.contains("ERROR"), "unexpected logs: {}", logs);
        assert!(!logs.contains("WARN"), "unexpected logs: {}", logs);
        assert!(!logs.contains("req-1"), "unexpected logs: {}", logs);
    }

    #[test]
    fn test_region_redirect_without_code_is_silent() {
        let (backend, client) = backend();
        client.fail("head_bucket", VendorError::status_only(301));

        let (result, logs) = capture_logs(|| backend.init());

        assert!(result.unwrap_err().is_region_mismatch());
        assert!(!logs.contains("ERROR"), "unexpected logs: {}", logs);
        assert!(!logs.contains("WARN"), "unexpected logs: {}", logs);
    }

    #[test]
    fn test_service_error_logged_once() {
        let (backend, client) = backend();
        client.fail(
            "put_object",
            VendorError::new(500, "InternalError", "we encountered an internal error")
                .with_request_id("req-2"),
        );

        let (result, logs) =
            capture_logs(|| backend.put_blob(PutBlobInput::from_bytes("file", b"x".to_vec())));

        match result.unwrap_err() {
            BackendError::Service {
                status,
                code,
                request_id,
                ..
            } => {
                assert_eq!(status, Some(500));
                assert_eq!(code, "InternalError");
                assert_eq!(request_id.as_deref(), Some("req-2"));
            }
            other => panic!("expected service error, got {:?}", other),
        }
        assert_eq!(logs.matches("ERROR").count(), 1, "unexpected logs: {}", logs);
        assert!(logs.contains("req-2"));
    }

    #[test]
    fn test_mapped_errors_not_logged_as_failures() {
        let (backend, _) = backend();

        let (result, logs) = capture_logs(|| backend.head_blob("nope"));

        assert!(result.unwrap_err().is_not_found());
        assert!(!logs.contains("obs request failed"), "unexpected logs: {}", logs);
    }

    #[test]
    fn test_timeout_propagates_as_service_error() {
        let (backend, client) = backend();
        client.fail(
            "get_object",
            VendorError {
                code: Some("RequestTimeout".to_string()),
                message: Some("operation timed out".to_string()),
                ..Default::default()
            },
        );

        let err = backend.get_blob("file", 0, 0).unwrap_err();

        assert!(matches!(err, BackendError::Service { .. }));
        assert!(err.is_retryable());
    }
}
