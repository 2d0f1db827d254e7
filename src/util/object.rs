use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};

use aws_sdk_s3::primitives::DateTime;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::model::error::BackendError;

/// Characters left alone in a copy source; everything else is escaped.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn parse_bucket_from_uri(bucket_uri: &str) -> Result<&str, BackendError> {
    let bucket = match bucket_uri.split_once("://") {
        Some(("obs", rest)) | Some(("s3", rest)) => rest.trim_end_matches('/'),
        Some((scheme, _)) => {
            return Err(BackendError::Config(format!(
                "unsupported scheme `{}` in: {}",
                scheme, bucket_uri
            )))
        }
        None => bucket_uri,
    };

    if bucket.is_empty() || bucket.contains('/') {
        return Err(BackendError::Config(format!(
            "failed to parse bucket of: {}",
            bucket_uri
        )));
    }

    Ok(bucket)
}

/// Object metadata keys are case-insensitive on the wire; store them folded.
pub fn metadata_to_lower(metadata: &HashMap<String, String>) -> HashMap<String, String> {
    metadata
        .iter()
        .map(|(key, value)| (key.to_lowercase(), value.clone()))
        .collect()
}

/// HTTP range header for `count` bytes from `start`; zero count reads to the
/// end and zero/zero reads the whole object. A count reaching past the
/// largest offset also reads to the end.
pub fn range_header(start: u64, count: u64) -> Option<String> {
    match (start, count) {
        (0, 0) => None,
        (start, 0) => Some(format!("bytes={}-", start)),
        (start, count) => match start.checked_add(count - 1) {
            Some(end) => Some(format!("bytes={}-{}", start, end)),
            None => Some(format!("bytes={}-", start)),
        },
    }
}

pub fn copy_source(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, utf8_percent_encode(key, COPY_SOURCE))
}

pub fn to_system_time(date: Option<&DateTime>) -> SystemTime {
    let secs = date.map(|d| d.secs()).unwrap_or(0).max(0);
    let nanos = date.map(|d| d.subsec_nanos()).unwrap_or(0);

    SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nanos)
}

pub fn size_from_length(length: Option<i64>) -> u64 {
    length.unwrap_or(0).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bucket() {
        assert!(matches!(parse_bucket_from_uri("obs://bucket"), Ok("bucket")));
        assert!(matches!(parse_bucket_from_uri("s3://bucket/"), Ok("bucket")));
        assert!(matches!(parse_bucket_from_uri("bucket"), Ok("bucket")));
        assert!(matches!(parse_bucket_from_uri("gs://bucket"), Err(_)));
        assert!(matches!(parse_bucket_from_uri("obs://"), Err(_)));
        assert!(matches!(parse_bucket_from_uri("obs://bucket/dir"), Err(_)));
    }

    #[test]
    fn test_range_header() {
        let cases = vec![
            ((0, 0), None),
            ((0, 10), Some("bytes=0-9")),
            ((100, 0), Some("bytes=100-")),
            ((100, 1), Some("bytes=100-100")),
            ((10, u64::MAX), Some("bytes=10-")),
            ((1, u64::MAX), Some("bytes=1-18446744073709551615")),
            ((u64::MAX, 1), Some("bytes=18446744073709551615-18446744073709551615")),
        ];

        for ((start, count), expected) in cases {
            assert_eq!(
                range_header(start, count).as_deref(),
                expected,
                "failed for case: {}+{}",
                start,
                count
            );
        }
    }

    #[test]
    fn test_metadata_to_lower() {
        let metadata = HashMap::from([
            ("Content-Owner".to_string(), "Alice".to_string()),
            ("x-Mode".to_string(), "0644".to_string()),
        ]);

        let result = metadata_to_lower(&metadata);

        assert_eq!(result.get("content-owner").map(String::as_str), Some("Alice"));
        assert_eq!(result.get("x-mode").map(String::as_str), Some("0644"));
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_copy_source() {
        assert_eq!(copy_source("bucket", "dir/file.txt"), "bucket/dir/file.txt");
        assert_eq!(copy_source("bucket", "a b+c"), "bucket/a%20b%2Bc");
    }

    #[test]
    fn test_to_system_time() {
        assert_eq!(to_system_time(None), SystemTime::UNIX_EPOCH);
        assert_eq!(
            to_system_time(Some(&DateTime::from_secs(60))),
            SystemTime::UNIX_EPOCH + Duration::from_secs(60)
        );
    }
}
