use std::{collections::HashMap, future::Future, pin::Pin};

use aws_sdk_s3::{
    config::http::HttpResponse,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
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
    primitives::ByteStream,
    types::{
        CompletedMultipartUpload, CompletedPart, Delete, MetadataDirective, ObjectCannedAcl,
        ObjectIdentifier, StorageClass,
    },
};

use crate::model::error::VendorError;

pub type RpcFuture<T> = Pin<Box<dyn Future<Output = Result<T, VendorError>> + Send>>;

const REQUEST_ID_HEADERS: [&str; 2] = ["x-obs-request-id", "x-amz-request-id"];

impl<E> From<SdkError<E, HttpResponse>> for VendorError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    fn from(err: SdkError<E, HttpResponse>) -> Self {
        let status = err.raw_response().map(|res| res.status().as_u16());
        let request_id = err.raw_response().and_then(|res| {
            REQUEST_ID_HEADERS
                .iter()
                .find_map(|name| res.headers().get(*name))
                .map(str::to_string)
        });

        let code = match &err {
            SdkError::TimeoutError(_) => Some("RequestTimeout".to_string()),
            SdkError::DispatchFailure(_) => Some("DispatchFailure".to_string()),
            SdkError::ConstructionFailure(_) => Some("ConstructionFailure".to_string()),
            SdkError::ResponseError(_) => Some("ResponseError".to_string()),
            _ => err.code().map(str::to_string),
        };
        let message = err
            .message()
            .map(str::to_string)
            .or_else(|| Some(DisplayErrorContext(&err).to_string()));

        VendorError {
            status,
            code,
            message,
            request_id,
        }
    }
}

impl From<aws_sdk_s3::error::BuildError> for VendorError {
    fn from(err: aws_sdk_s3::error::BuildError) -> Self {
        VendorError {
            code: Some("ConstructionFailure".to_string()),
            message: Some(err.to_string()),
            ..Default::default()
        }
    }
}

/// Filters for one page of a marker-based listing. `None` fields are not
/// sent at all.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub max_keys: Option<i32>,
    pub marker: Option<String>,
}

pub struct PutRequest {
    pub key: String,
    pub body: ByteStream,
    pub size: Option<i64>,
    pub content_type: Option<String>,
    pub storage_class: String,
    pub acl: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct CopyRequest {
    pub source: String,
    pub destination: String,
    /// Replaces the destination metadata when set.
    pub metadata: Option<HashMap<String, String>>,
    pub acl: Option<String>,
}

#[derive(Clone, Debug)]
pub struct InitiateRequest {
    pub key: String,
    pub storage_class: String,
    pub acl: Option<String>,
    pub metadata: HashMap<String, String>,
}

pub struct PartRequest {
    pub key: String,
    pub upload_id: String,
    pub part_number: i32,
    pub body: ByteStream,
}

/// The OBS operations the backend issues. Implemented by the SDK client for
/// real endpoints and by `adapters::mock::MockObsClient` in tests.
pub trait ObsRpc: Send + Sync {
    fn head_bucket(&self, bucket: &str) -> RpcFuture<HeadBucketOutput>;

    fn head_object(&self, bucket: &str, key: &str) -> RpcFuture<HeadObjectOutput>;

    fn list_objects(&self, bucket: &str, query: ListQuery) -> RpcFuture<ListObjectsOutput>;

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<String>,
    ) -> RpcFuture<GetObjectOutput>;

    fn put_object(&self, bucket: &str, req: PutRequest) -> RpcFuture<PutObjectOutput>;

    fn delete_object(&self, bucket: &str, key: &str) -> RpcFuture<DeleteObjectOutput>;

    fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> RpcFuture<DeleteObjectsOutput>;

    fn copy_object(&self, bucket: &str, req: CopyRequest) -> RpcFuture<CopyObjectOutput>;

    fn create_multipart_upload(
        &self,
        bucket: &str,
        req: InitiateRequest,
    ) -> RpcFuture<CreateMultipartUploadOutput>;

    fn upload_part(&self, bucket: &str, req: PartRequest) -> RpcFuture<UploadPartOutput>;

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(u32, String)>,
    ) -> RpcFuture<CompleteMultipartUploadOutput>;

    fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> RpcFuture<AbortMultipartUploadOutput>;

    fn list_multipart_uploads(
        &self,
        bucket: &str,
        key_marker: Option<String>,
        upload_id_marker: Option<String>,
    ) -> RpcFuture<ListMultipartUploadsOutput>;
}

impl ObsRpc for aws_sdk_s3::Client {
    fn head_bucket(&self, bucket: &str) -> RpcFuture<HeadBucketOutput> {
        let req = self.head_bucket().bucket(bucket);
        Box::pin(async move { req.send().await.map_err(VendorError::from) })
    }

    fn head_object(&self, bucket: &str, key: &str) -> RpcFuture<HeadObjectOutput> {
        let req = self.head_object().bucket(bucket).key(key);
        Box::pin(async move { req.send().await.map_err(VendorError::from) })
    }

    fn list_objects(&self, bucket: &str, query: ListQuery) -> RpcFuture<ListObjectsOutput> {
        let req = self
            .list_objects()
            .bucket(bucket)
            .set_prefix(query.prefix)
            .set_delimiter(query.delimiter)
            .set_max_keys(query.max_keys)
            .set_marker(query.marker);
        Box::pin(async move { req.send().await.map_err(VendorError::from) })
    }

    fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<String>,
    ) -> RpcFuture<GetObjectOutput> {
        let req = self.get_object().bucket(bucket).key(key).set_range(range);
        Box::pin(async move { req.send().await.map_err(VendorError::from) })
    }

    fn put_object(&self, bucket: &str, req: PutRequest) -> RpcFuture<PutObjectOutput> {
        let req = self
            .put_object()
            .bucket(bucket)
            .key(req.key)
            .body(req.body)
            .set_content_length(req.size)
            .set_content_type(req.content_type)
            .storage_class(StorageClass::from(req.storage_class.as_str()))
            .set_acl(req.acl.as_deref().map(ObjectCannedAcl::from))
            .set_metadata(Some(req.metadata));
        Box::pin(async move { req.send().await.map_err(VendorError::from) })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> RpcFuture<DeleteObjectOutput> {
        let req = self.delete_object().bucket(bucket).key(key);
        Box::pin(async move { req.send().await.map_err(VendorError::from) })
    }

    fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> RpcFuture<DeleteObjectsOutput> {
        let req = self.delete_objects().bucket(bucket);
        Box::pin(async move {
            let objects = keys
                .into_iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()?;

            req.delete(delete).send().await.map_err(VendorError::from)
        })
    }

    fn copy_object(&self, bucket: &str, req: CopyRequest) -> RpcFuture<CopyObjectOutput> {
        let directive = if req.metadata.is_some() {
            MetadataDirective::Replace
        } else {
            MetadataDirective::Copy
        };

        let req = self
            .copy_object()
            .bucket(bucket)
            .key(req.destination)
            .copy_source(req.source)
            .metadata_directive(directive)
            .set_metadata(req.metadata)
            .set_acl(req.acl.as_deref().map(ObjectCannedAcl::from));
        Box::pin(async move { req.send().await.map_err(VendorError::from) })
    }

    fn create_multipart_upload(
        &self,
        bucket: &str,
        req: InitiateRequest,
    ) -> RpcFuture<CreateMultipartUploadOutput> {
        let req = self
            .create_multipart_upload()
            .bucket(bucket)
            .key(req.key)
            .storage_class(StorageClass::from(req.storage_class.as_str()))
            .set_acl(req.acl.as_deref().map(ObjectCannedAcl::from))
            .set_metadata(Some(req.metadata));
        Box::pin(async move { req.send().await.map_err(VendorError::from) })
    }

    fn upload_part(&self, bucket: &str, req: PartRequest) -> RpcFuture<UploadPartOutput> {
        let req = self
            .upload_part()
            .bucket(bucket)
            .key(req.key)
            .upload_id(req.upload_id)
            .part_number(req.part_number)
            .body(req.body);
        Box::pin(async move { req.send().await.map_err(VendorError::from) })
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(u32, String)>,
    ) -> RpcFuture<CompleteMultipartUploadOutput> {
        let parts = parts
            .into_iter()
            .map(|(part_number, etag)| {
                CompletedPart::builder()
                    .part_number(part_number as i32)
                    .e_tag(etag)
                    .build()
            })
            .collect::<Vec<_>>();

        let req = self
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            );
        Box::pin(async move { req.send().await.map_err(VendorError::from) })
    }

    fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> RpcFuture<AbortMultipartUploadOutput> {
        let req = self
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id);
        Box::pin(async move { req.send().await.map_err(VendorError::from) })
    }

    fn list_multipart_uploads(
        &self,
        bucket: &str,
        key_marker: Option<String>,
        upload_id_marker: Option<String>,
    ) -> RpcFuture<ListMultipartUploadsOutput> {
        let req = self
            .list_multipart_uploads()
            .bucket(bucket)
            .set_key_marker(key_marker)
            .set_upload_id_marker(upload_id_marker);
        Box::pin(async move { req.send().await.map_err(VendorError::from) })
    }
}
