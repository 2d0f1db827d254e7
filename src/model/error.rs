use std::fmt;

use thiserror::Error;

/// Raw failure as reported by the OBS endpoint or the SDK transport.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VendorError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub request_id: Option<String>,
}

impl VendorError {
    pub fn new(status: u16, code: &str, message: &str) -> Self {
        Self {
            status: Some(status),
            code: Some(code.to_string()),
            message: Some(message.to_string()),
            request_id: None,
        }
    }

    /// An error response that carried a status line but no parseable body,
    /// which is what HEAD requests get back.
    pub fn status_only(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }
}

impl fmt::Display for VendorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "http={} code={} message={} request={}",
            self.status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            self.code.as_deref().unwrap_or("-"),
            self.message.as_deref().unwrap_or("-"),
            self.request_id.as_deref().unwrap_or("-"),
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The bucket lives in another region. Callers rediscover the region and
    /// retry; this is never logged.
    #[error("bucket region mismatch: {0}")]
    RegionMismatch(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("service error: http={status:?} code={code} message={message} request={request_id:?}")]
    Service {
        status: Option<u16>,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    /// Raised only while building the backend.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BackendError {
    pub fn service(code: &str, message: String) -> Self {
        BackendError::Service {
            status: None,
            code: code.to_string(),
            message,
            request_id: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, BackendError::PermissionDenied(_))
    }

    pub fn is_region_mismatch(&self) -> bool {
        matches!(self, BackendError::RegionMismatch(_))
    }

    /// Whether the caller's retry policy may reasonably try again. The
    /// backend itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Service { status, code, .. } => {
                matches!(status, Some(429) | Some(500) | Some(503))
                    || code == "RequestTimeout"
                    || code == "SlowDown"
            }
            _ => false,
        }
    }
}

/// Translate a vendor failure into the portable taxonomy. Codes are matched
/// first, the HTTP status is the fallback, and everything else is carried
/// through with its diagnostic fields.
pub fn classify(err: &VendorError) -> BackendError {
    let message = err
        .message
        .clone()
        .or_else(|| err.code.clone())
        .unwrap_or_else(|| format!("http status {}", err.status.unwrap_or(0)));

    match err.code.as_deref() {
        Some("BucketRegionError")
        | Some("PermanentRedirect")
        | Some("AuthorizationHeaderMalformed")
        | Some("IncorrectEndpoint") => return BackendError::RegionMismatch(message),
        Some("NoSuchBucket") | Some("NoSuchKey") | Some("NoSuchUpload") | Some("NotFound") => {
            return BackendError::NotFound(message)
        }
        Some("BucketAlreadyOwnedByYou") | Some("BucketAlreadyExists") => {
            return BackendError::AlreadyExists(message)
        }
        Some("AccessDenied")
        | Some("AllAccessDisabled")
        | Some("InvalidAccessKeyId")
        | Some("SignatureDoesNotMatch") => return BackendError::PermissionDenied(message),
        Some("NotImplemented") | Some("MethodNotAllowed") => {
            return BackendError::Unsupported(message)
        }
        _ => {}
    }

    match err.status {
        // HEAD responses carry no body, so a wrong-region redirect has no code.
        Some(301) => BackendError::RegionMismatch(message),
        Some(403) => BackendError::PermissionDenied(message),
        Some(404) => BackendError::NotFound(message),
        Some(405) | Some(501) => BackendError::Unsupported(message),
        _ => BackendError::Service {
            status: err.status,
            code: err.code.clone().unwrap_or_else(|| "Unknown".to_string()),
            message,
            request_id: err.request_id.clone(),
        },
    }
}
