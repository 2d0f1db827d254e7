use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, HashMap},
    future,
    hash::{Hash, Hasher},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use aws_sdk_s3::{
    operation::{
        abort_multipart_upload::AbortMultipartUploadOutput,
        complete_multipart_upload::CompleteMultipartUploadOutput,
        copy_object::CopyObjectOutput,
        create_multipart_upload::CreateMultipartUploadOutput,
        delete_object::DeleteObjectOutput,
        delete_objects::DeleteObjectsOutput,
        get_object::GetObjectOutput,
        head_bucket::HeadBucketOutput,
        head_object::HeadObjectOutput,
        list_multipart_uploads::ListMultipartUploadsOutput,
        list_objects::ListObjectsOutput,
        put_object::PutObjectOutput,
        upload_part::UploadPartOutput,
    },
    primitives::{ByteStream, DateTime},
    types::{
        CommonPrefix, CopyObjectResult, DeletedObject, Error as ObjectError, MultipartUpload,
        Object, ObjectStorageClass, StorageClass,
    },
};

use crate::model::{
    error::VendorError,
    obs::{CopyRequest, InitiateRequest, ListQuery, ObsRpc, PartRequest, PutRequest, RpcFuture},
};

const DEFAULT_MAX_KEYS: usize = 1000;
const UPLOAD_PAGE: usize = 2;

#[derive(Clone, Debug)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub etag: String,
    pub last_modified: SystemTime,
    pub storage_class: String,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug)]
struct PendingUpload {
    key: String,
    initiated: SystemTime,
    storage_class: String,
    metadata: HashMap<String, String>,
    parts: BTreeMap<i32, (String, Vec<u8>)>,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: BTreeMap<String, PendingUpload>,
    next_upload: u64,
    // Operation -> (calls allowed through in total, error afterwards).
    faults: HashMap<String, (usize, VendorError)>,
    key_faults: HashMap<String, VendorError>,
    hooks: HashMap<String, Hook>,
    calls: Vec<String>,
    last_list: Option<ListQuery>,
}

/// In-memory emulation of a single OBS bucket. Clones share state, so a test
/// can hand one clone to the backend and inspect another.
#[derive(Clone)]
pub struct MockObsClient {
    bucket: String,
    state: Arc<Mutex<State>>,
}

pub fn etag_of(data: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("\"{:016x}\"", hasher.finish())
}

fn ready<T: Send + 'static>(result: Result<T, VendorError>) -> RpcFuture<T> {
    Box::pin(future::ready(result))
}

fn no_such_key(key: &str) -> VendorError {
    VendorError::new(404, "NoSuchKey", &format!("the specified key does not exist: {}", key))
}

fn no_such_upload(upload_id: &str) -> VendorError {
    VendorError::new(
        404,
        "NoSuchUpload",
        &format!("the specified upload does not exist: {}", upload_id),
    )
}

impl MockObsClient {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Make every call of `operation` fail with `err` until cleared.
    pub fn fail(&self, operation: &str, err: VendorError) {
        self.fail_after(operation, 0, err);
    }

    /// Let the next `passes` calls of `operation` through, then fail the
    /// rest with `err` until cleared.
    pub fn fail_after(&self, operation: &str, passes: usize, err: VendorError) {
        let mut state = self.lock();
        let made = state.calls.iter().filter(|c| *c == operation).count();
        state
            .faults
            .insert(operation.to_string(), (made + passes, err));
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.faults.clear();
        state.key_faults.clear();
    }

    /// Run `hook` whenever `operation` is issued, before it takes effect.
    pub fn on_call(&self, operation: &str, hook: impl Fn() + Send + Sync + 'static) {
        self.lock().hooks.insert(operation.to_string(), Arc::new(hook));
    }

    /// Reject deletion of `key` inside batch deletes.
    pub fn fail_key(&self, key: &str, err: VendorError) {
        self.lock().key_faults.insert(key.to_string(), err);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, operation: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == operation).count()
    }

    pub fn last_list(&self) -> Option<ListQuery> {
        self.lock().last_list.clone()
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn insert_object(&self, key: &str, data: &[u8]) {
        let stored = StoredObject {
            data: data.to_vec(),
            etag: etag_of(data),
            last_modified: SystemTime::now(),
            storage_class: "STANDARD".to_string(),
            content_type: None,
            metadata: HashMap::new(),
        };
        self.lock().objects.insert(key.to_string(), stored);
    }

    /// Seed an in-flight upload as if it had been started at `initiated`.
    pub fn insert_upload(&self, key: &str, initiated: SystemTime) -> String {
        let mut state = self.lock();
        Self::new_upload(&mut state, key, initiated, "STANDARD", HashMap::new())
    }

    pub fn upload_ids(&self) -> Vec<String> {
        self.lock().uploads.keys().cloned().collect()
    }

    fn new_upload(
        state: &mut State,
        key: &str,
        initiated: SystemTime,
        storage_class: &str,
        metadata: HashMap<String, String>,
    ) -> String {
        state.next_upload += 1;
        let upload_id = format!("upload-{:06}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                initiated,
                storage_class: storage_class.to_string(),
                metadata,
                parts: BTreeMap::new(),
            },
        );
        upload_id
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the call and check the bucket and any injected fault.
    fn enter(&self, operation: &str, bucket: &str) -> Result<MutexGuard<'_, State>, VendorError> {
        let mut state = self.lock();
        state.calls.push(operation.to_string());
        if let Some(hook) = state.hooks.get(operation) {
            hook();
        }

        if let Some((allowed, err)) = state.faults.get(operation) {
            let made = state.calls.iter().filter(|c| *c == operation).count();
            if made > *allowed {
                return Err(err.clone());
            }
        }
        if bucket != self.bucket {
            return Err(VendorError::new(
                404,
                "NoSuchBucket",
                &format!("the specified bucket does not exist: {}", bucket),
            ));
        }

        Ok(state)
    }

    fn list_page(state: &State, query: &ListQuery) -> ListObjectsOutput {
        let prefix = query.prefix.as_deref().unwrap_or("");
        let delimiter = query.delimiter.as_deref().unwrap_or("");
        let max_keys = query
            .max_keys
            .map(|m| m.max(0) as usize)
            .unwrap_or(DEFAULT_MAX_KEYS);
        let marker = query.marker.as_deref().unwrap_or("");

        let mut contents = Vec::new();
        let mut prefixes: Vec<String> = Vec::new();
        let mut last = None;
        let mut truncated = false;

        for (key, object) in &state.objects {
            if !key.starts_with(prefix) || key.as_str() <= marker {
                continue;
            }
            // A marker naming a common prefix skips everything under it.
            if !delimiter.is_empty() && marker.ends_with(delimiter) && key.starts_with(marker) {
                continue;
            }

            let entry = match key[prefix.len()..].find(delimiter) {
                Some(idx) if !delimiter.is_empty() => {
                    let common = key[..prefix.len() + idx + delimiter.len()].to_string();
                    if prefixes.last() == Some(&common) {
                        continue;
                    }
                    Err(common)
                }
                _ => Ok((key, object)),
            };

            if contents.len() + prefixes.len() >= max_keys {
                truncated = true;
                break;
            }

            match entry {
                Ok((key, object)) => {
                    last = Some(key.clone());
                    contents.push(
                        Object::builder()
                            .key(key.clone())
                            .e_tag(object.etag.clone())
                            .size(object.data.len() as i64)
                            .last_modified(DateTime::from(object.last_modified))
                            .storage_class(ObjectStorageClass::from(object.storage_class.as_str()))
                            .build(),
                    );
                }
                Err(common) => {
                    last = Some(common.clone());
                    prefixes.push(common);
                }
            }
        }

        let mut out = ListObjectsOutput::builder()
            .is_truncated(truncated)
            .set_contents(Some(contents))
            .set_common_prefixes(Some(
                prefixes
                    .into_iter()
                    .map(|p| CommonPrefix::builder().prefix(p).build())
                    .collect(),
            ));
        // Like the real service, NextMarker only comes back with a delimiter.
        if truncated && !delimiter.is_empty() {
            out = out.set_next_marker(last);
        }
        out.build()
    }
}

impl ObsRpc for MockObsClient {
    fn head_bucket(&self, bucket: &str) -> RpcFuture<HeadBucketOutput> {
        let result = self
            .enter("head_bucket", bucket)
            .map(|_| HeadBucketOutput::builder().build())
            .map_err(|err| match err.code.as_deref() {
                Some("NoSuchBucket") => VendorError::status_only(404),
                _ => err,
            });
        ready(result)
    }

    fn head_object(&self, bucket: &str, key: &str) -> RpcFuture<HeadObjectOutput> {
        let result = self.enter("head_object", bucket).and_then(|state| {
            // HEAD responses carry no error body.
            let object = state
                .objects
                .get(key)
                .ok_or_else(|| VendorError::status_only(404))?;

            Ok(HeadObjectOutput::builder()
                .e_tag(object.etag.clone())
                .content_length(object.data.len() as i64)
                .last_modified(DateTime::from(object.last_modified))
                .set_storage_class(
                    Some(object.storage_class.as_str())
                        .filter(|class| *class != "STANDARD")
                        .map(StorageClass::from),
                )
                .set_content_type(object.content_type.clone())
                .set_metadata(Some(object.metadata.clone()))
                .build())
        });
        ready(result)
    }

    fn list_objects(&self, bucket: &str, query: ListQuery) -> RpcFuture<ListObjectsOutput> {
        let result = self.enter("list_objects", bucket).map(|mut state| {
            state.last_list = Some(query.clone());
            Self::list_page(&state, &query)
        });
        ready(result)
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<String>,
    ) -> RpcFuture<GetObjectOutput> {
        let result = self.enter("get_object", bucket).and_then(|state| {
            let object = state.objects.get(key).ok_or_else(|| no_such_key(key))?;
            let len = object.data.len();

            let (start, end) = match range.as_deref().and_then(|r| r.strip_prefix("bytes=")) {
                None => (0, len),
                Some(bounds) => {
                    let (start, end) = bounds.split_once('-').unwrap_or((bounds, ""));
                    let start: usize = start.parse().unwrap_or(0);
                    let end = end
                        .parse::<usize>()
                        .map(|e| (e + 1).min(len))
                        .unwrap_or(len);
                    if start >= len && len > 0 {
                        return Err(VendorError::new(
                            416,
                            "InvalidRange",
                            "the requested range is not satisfiable",
                        ));
                    }
                    (start.min(len), end)
                }
            };
            let body = object.data[start..end].to_vec();

            Ok(GetObjectOutput::builder()
                .e_tag(object.etag.clone())
                .content_length(body.len() as i64)
                .last_modified(DateTime::from(object.last_modified))
                .storage_class(StorageClass::from(object.storage_class.as_str()))
                .set_content_type(object.content_type.clone())
                .set_metadata(Some(object.metadata.clone()))
                .body(ByteStream::from(body))
                .build())
        });
        ready(result)
    }

    fn put_object(&self, bucket: &str, req: PutRequest) -> RpcFuture<PutObjectOutput> {
        if let Err(err) = self.enter("put_object", bucket) {
            return ready(Err(err));
        }

        let client = self.clone();
        Box::pin(async move {
            let data = req
                .body
                .collect()
                .await
                .map_err(|err| VendorError::new(400, "IncompleteBody", &err.to_string()))?
                .into_bytes()
                .to_vec();

            let etag = etag_of(&data);
            client.lock().objects.insert(
                req.key,
                StoredObject {
                    data,
                    etag: etag.clone(),
                    last_modified: SystemTime::now(),
                    storage_class: req.storage_class,
                    content_type: req.content_type,
                    metadata: req.metadata,
                },
            );

            Ok(PutObjectOutput::builder().e_tag(etag).build())
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> RpcFuture<DeleteObjectOutput> {
        let result = self.enter("delete_object", bucket).map(|mut state| {
            state.objects.remove(key);
            DeleteObjectOutput::builder().build()
        });
        ready(result)
    }

    fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> RpcFuture<DeleteObjectsOutput> {
        let result = self.enter("delete_objects", bucket).and_then(|mut state| {
            if keys.len() > DEFAULT_MAX_KEYS {
                return Err(VendorError::new(400, "MalformedXML", "too many keys"));
            }

            let mut out = DeleteObjectsOutput::builder();
            for key in keys {
                match state.key_faults.get(&key).cloned() {
                    Some(err) => {
                        out = out.errors(
                            ObjectError::builder()
                                .key(key)
                                .set_code(err.code)
                                .set_message(err.message)
                                .build(),
                        );
                    }
                    None => {
                        state.objects.remove(&key);
                        out = out.deleted(DeletedObject::builder().key(key).build());
                    }
                }
            }
            Ok(out.build())
        });
        ready(result)
    }

    fn copy_object(&self, bucket: &str, req: CopyRequest) -> RpcFuture<CopyObjectOutput> {
        let result = self.enter("copy_object", bucket).and_then(|mut state| {
            let prefix = format!("{}/", bucket);
            let source = req.source.strip_prefix(&prefix).unwrap_or(&req.source);
            let source = percent_encoding::percent_decode_str(source)
                .decode_utf8_lossy()
                .to_string();

            let mut object = state
                .objects
                .get(&source)
                .cloned()
                .ok_or_else(|| no_such_key(&source))?;
            if let Some(metadata) = req.metadata {
                object.metadata = metadata;
            }
            object.last_modified = SystemTime::now();

            let result = CopyObjectResult::builder()
                .e_tag(object.etag.clone())
                .last_modified(DateTime::from(object.last_modified))
                .build();
            state.objects.insert(req.destination, object);

            Ok(CopyObjectOutput::builder().copy_object_result(result).build())
        });
        ready(result)
    }

    fn create_multipart_upload(
        &self,
        bucket: &str,
        req: InitiateRequest,
    ) -> RpcFuture<CreateMultipartUploadOutput> {
        let result = self.enter("create_multipart_upload", bucket).map(|mut state| {
            let upload_id = Self::new_upload(
                &mut state,
                &req.key,
                SystemTime::now(),
                &req.storage_class,
                req.metadata,
            );
            CreateMultipartUploadOutput::builder()
                .bucket(bucket)
                .key(req.key)
                .upload_id(upload_id)
                .build()
        });
        ready(result)
    }

    fn upload_part(&self, bucket: &str, req: PartRequest) -> RpcFuture<UploadPartOutput> {
        if let Err(err) = self.enter("upload_part", bucket) {
            return ready(Err(err));
        }

        let client = self.clone();
        Box::pin(async move {
            let data = req
                .body
                .collect()
                .await
                .map_err(|err| VendorError::new(400, "IncompleteBody", &err.to_string()))?
                .into_bytes()
                .to_vec();

            let mut state = client.lock();
            let upload = state
                .uploads
                .get_mut(&req.upload_id)
                .filter(|upload| upload.key == req.key)
                .ok_or_else(|| no_such_upload(&req.upload_id))?;

            let etag = etag_of(&data);
            upload.parts.insert(req.part_number, (etag.clone(), data));

            Ok(UploadPartOutput::builder().e_tag(etag).build())
        })
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(u32, String)>,
    ) -> RpcFuture<CompleteMultipartUploadOutput> {
        let result = self
            .enter("complete_multipart_upload", bucket)
            .and_then(|mut state| {
                let upload = state
                    .uploads
                    .get(upload_id)
                    .filter(|upload| upload.key == key)
                    .ok_or_else(|| no_such_upload(upload_id))?;

                if parts.is_empty() || !parts.windows(2).all(|w| w[0].0 < w[1].0) {
                    return Err(VendorError::new(
                        400,
                        "InvalidPartOrder",
                        "the list of parts was not in ascending order",
                    ));
                }

                let mut data = Vec::new();
                for (part_number, etag) in &parts {
                    match upload.parts.get(&(*part_number as i32)) {
                        Some((stored, bytes)) if stored == etag => data.extend_from_slice(bytes),
                        _ => {
                            return Err(VendorError::new(
                                400,
                                "InvalidPart",
                                &format!(
                                    "part {} was not uploaded or its etag differs",
                                    part_number
                                ),
                            ))
                        }
                    }
                }

                let upload = state
                    .uploads
                    .remove(upload_id)
                    .ok_or_else(|| no_such_upload(upload_id))?;
                let etag = format!("\"{}-{}\"", etag_of(&data).trim_matches('"'), parts.len());
                state.objects.insert(
                    key.to_string(),
                    StoredObject {
                        data,
                        etag: etag.clone(),
                        last_modified: SystemTime::now(),
                        storage_class: upload.storage_class,
                        content_type: None,
                        metadata: upload.metadata,
                    },
                );

                Ok(CompleteMultipartUploadOutput::builder()
                    .bucket(bucket)
                    .key(key)
                    .e_tag(etag)
                    .build())
            });
        ready(result)
    }

    fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> RpcFuture<AbortMultipartUploadOutput> {
        let result = self
            .enter("abort_multipart_upload", bucket)
            .and_then(|mut state| {
                match state.uploads.get(upload_id) {
                    Some(upload) if upload.key == key => {}
                    _ => return Err(no_such_upload(upload_id)),
                }
                state.uploads.remove(upload_id);
                Ok(AbortMultipartUploadOutput::builder().build())
            });
        ready(result)
    }

    fn list_multipart_uploads(
        &self,
        bucket: &str,
        _key_marker: Option<String>,
        upload_id_marker: Option<String>,
    ) -> RpcFuture<ListMultipartUploadsOutput> {
        let result = self
            .enter("list_multipart_uploads", bucket)
            .map(|state| {
                // Paged in upload-id order, so the upload-id marker alone
                // positions the next page.
                let marker = upload_id_marker.unwrap_or_default();
                let remaining: Vec<_> = state
                    .uploads
                    .iter()
                    .filter(|(id, _)| id.as_str() > marker.as_str())
                    .collect();
                let truncated = remaining.len() > UPLOAD_PAGE;

                let mut out = ListMultipartUploadsOutput::builder()
                    .bucket(bucket)
                    .is_truncated(truncated);
                let mut last = None;
                for (upload_id, upload) in remaining.into_iter().take(UPLOAD_PAGE) {
                    last = Some((upload.key.clone(), upload_id.clone()));
                    out = out.uploads(
                        MultipartUpload::builder()
                            .key(upload.key.clone())
                            .upload_id(upload_id.clone())
                            .initiated(DateTime::from(upload.initiated))
                            .build(),
                    );
                }
                if let (true, Some((key, upload_id))) = (truncated, last) {
                    out = out.next_key_marker(key).next_upload_id_marker(upload_id);
                }
                out.build()
            });
        ready(result)
    }
}
