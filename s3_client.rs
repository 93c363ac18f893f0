//! S3-compatible HTTP client.
//!
//! Talks path-style (`endpoint/bucket/key`) to AWS S3, MinIO and friends.
//! Requests are presigned with `rusty-s3` (SigV4 query signing, payload
//! left unsigned) and sent with reqwest, so streaming bodies need no
//! up-front hash. Response documents are read with `quick-xml`.

use crate::config::S3Config;
use crate::error::StorageError;
use crate::object_store::{CompletedPart, ObjectBody, ObjectClient};
use crate::storage::{BlobStream, BoxReader, KeyPage};
use crate::streaming::CHUNK_SIZE;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use rusty_s3::actions::{CreateMultipartUpload, ListObjectsV2};
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use serde::Deserialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Validity of a presigned URL. S3 checks it when the request starts, so a
/// long upload may outlive it.
const PRESIGN_TTL: Duration = Duration::from_secs(15 * 60);
const COPY_SOURCE: &str = "x-amz-copy-source";

pub struct S3Client {
    http: reqwest::Client,
    bucket: Bucket,
    credentials: Credentials,
}

/// Slot where an upload body parks the error that ended it early.
pub(crate) type BodyFailure = Arc<Mutex<Option<io::Error>>>;

/// `<Error>` document returned by S3 on failure, sometimes with a 200 status.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

impl S3Client {
    pub fn new(cfg: &S3Config) -> Result<Self, StorageError> {
        let endpoint = Url::parse(cfg.endpoint.trim())
            .map_err(|e| StorageError::backend(format!("invalid s3 endpoint {}: {}", cfg.endpoint, e)))?;
        let bucket = Bucket::new(endpoint, UrlStyle::Path, cfg.bucket.clone(), cfg.region.clone())
            .map_err(|e| StorageError::backend(format!("invalid s3 bucket {}: {}", cfg.bucket, e)))?;

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StorageError::backend(format!("building s3 http client: {}", e)))?;

        Ok(Self {
            http,
            bucket,
            credentials: Credentials::new(cfg.access_key_id.clone(), cfg.secret_access_key.clone()),
        })
    }

    fn creds(&self) -> Option<&Credentials> {
        Some(&self.credentials)
    }

    /// `x-amz-copy-source` value: `/bucket/key`, percent-encoded per segment.
    fn copy_source(&self, key: &str) -> String {
        let mut url = self.bucket.base_url().clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.clear().push(self.bucket.name()).extend(key.split('/'));
        }
        url.path().to_string()
    }

    async fn send(
        &self,
        request: RequestBuilder,
        failure: Option<&BodyFailure>,
        key: &str,
    ) -> Result<Response, StorageError> {
        match request.send().await {
            Ok(response) => Ok(response),
            Err(e) => {
                if let Some(source_error) = failure.and_then(|slot| slot.lock().take()) {
                    return Err(StorageError::Io(source_error));
                }
                Err(StorageError::backend(format!("s3 request for {} failed: {}", key, e)))
            }
        }
    }

    async fn send_ok(&self, request: RequestBuilder, key: &str) -> Result<Response, StorageError> {
        let response = self.send(request, None, key).await?;
        expect_success(response, key).await
    }

    async fn send_for_text(&self, request: RequestBuilder, key: &str) -> Result<String, StorageError> {
        self.send_ok(request, key)
            .await?
            .text()
            .await
            .map_err(|e| StorageError::backend(format!("reading s3 response for {}: {}", key, e)))
    }
}

async fn expect_success(response: Response, key: &str) -> Result<Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(StorageError::NotFound(key.to_string()));
    }
    let body = response.text().await.unwrap_or_default();
    let code = parse_error(&body).map(|e| e.code).unwrap_or_default();
    Err(StorageError::backend(format!(
        "s3 returned {} for {}: {}",
        status, key, code
    )))
}

fn parse_error(body: &str) -> Option<ErrorBody> {
    quick_xml::de::from_str::<ErrorBody>(body).ok()
}

/// Some S3 operations answer 200 and report failure in the body.
fn reject_error_body(body: &str, key: &str) -> Result<(), StorageError> {
    match parse_error(body) {
        Some(err) => Err(StorageError::backend(format!(
            "s3 rejected {}: {} {}",
            key, err.code, err.message
        ))),
        None => Ok(()),
    }
}

fn parse_listing(body: &str) -> Result<KeyPage, StorageError> {
    let listing = ListObjectsV2::parse_response(body)
        .map_err(|e| StorageError::backend(format!("malformed listing: {}", e)))?;
    Ok(KeyPage {
        keys: listing.contents.into_iter().map(|c| c.key).collect(),
        next: listing.next_continuation_token,
    })
}

/// Pump `reader` into a request body. The bounded channel keeps the reader
/// in step with the upload.
pub(crate) fn streaming_body(reader: BoxReader, failure: BodyFailure) -> reqwest::Body {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(4);
    tokio::spawn(async move {
        let mut chunks = ReaderStream::with_capacity(reader, CHUNK_SIZE);
        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(bytes) => Ok(bytes),
                Err(e) => {
                    let relay = io::Error::new(e.kind(), e.to_string());
                    *failure.lock() = Some(e);
                    Err(relay)
                }
            };
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(ReceiverStream::new(rx))
}

#[async_trait]
impl ObjectClient for S3Client {
    async fn head_object(&self, key: &str) -> Result<Option<u64>, StorageError> {
        let url = self.bucket.head_object(self.creds(), key).sign(PRESIGN_TTL);
        let response = self.send(self.http.head(url), None, key).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_success(response, key).await?;
        let len = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(Some(len))
    }

    async fn get_object(&self, key: &str) -> Result<BlobStream, StorageError> {
        let url = self.bucket.get_object(self.creds(), key).sign(PRESIGN_TTL);
        let response = self.send_ok(self.http.get(url), key).await?;
        let len = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = Box::pin(response.bytes_stream().map_err(io::Error::other));
        Ok(BlobStream::new(Box::new(StreamReader::new(body)), len))
    }

    async fn put_object(&self, key: &str, body: ObjectBody, len: u64) -> Result<(), StorageError> {
        let url = self.bucket.put_object(self.creds(), key).sign(PRESIGN_TTL);
        let failure = BodyFailure::default();
        let request = match body {
            ObjectBody::Bytes(data) => self.http.put(url).body(data),
            ObjectBody::Stream(reader) => self
                .http
                .put(url)
                .header(CONTENT_LENGTH, len)
                .body(streaming_body(reader, failure.clone())),
        };
        let response = self.send(request, Some(&failure), key).await?;
        if let Some(source_error) = failure.lock().take() {
            return Err(StorageError::Io(source_error));
        }
        expect_success(response, key).await?;
        debug!(key = %key, bytes = len, "object stored");
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> Result<String, StorageError> {
        let url = self
            .bucket
            .create_multipart_upload(self.creds(), key)
            .sign(PRESIGN_TTL);
        let body = self.send_for_text(self.http.post(url), key).await?;
        let created = CreateMultipartUpload::parse_response(&body)
            .map_err(|e| StorageError::backend(format!("no UploadId in response for {}: {}", key, e)))?;
        Ok(created.upload_id().to_string())
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, StorageError> {
        let number = u16::try_from(part_number)
            .map_err(|_| StorageError::backend(format!("part number {} out of range for {}", part_number, key)))?;
        let url = self
            .bucket
            .upload_part(self.creds(), key, number, upload_id)
            .sign(PRESIGN_TTL);
        let response = self.send_ok(self.http.put(url).body(data), key).await?;
        response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::backend(format!("no ETag for part {} of {}", part_number, key)))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        mut parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        // Parts are numbered by position in the completion document.
        parts.sort_by_key(|p| p.part_number);
        let action = self.bucket.complete_multipart_upload(
            self.creds(),
            key,
            upload_id,
            parts.iter().map(|p| p.etag.as_str()),
        );
        let url = action.sign(PRESIGN_TTL);
        let request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/xml")
            .body(action.body());
        let body = self.send_for_text(request, key).await?;
        reject_error_body(&body, key)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        let url = self
            .bucket
            .abort_multipart_upload(self.creds(), key, upload_id)
            .sign(PRESIGN_TTL);
        match self.send_ok(self.http.delete(url), key).await {
            Ok(_) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let url = self.bucket.delete_object(self.creds(), key).sign(PRESIGN_TTL);
        match self.send_ok(self.http.delete(url), key).await {
            Ok(_) => Ok(()),
            Err(StorageError::NotFound(_)) => {
                warn!(key = %key, "object not found during delete");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.copy_source(from);
        let mut action = self.bucket.put_object(self.creds(), to);
        action.headers_mut().insert(COPY_SOURCE, source.clone());
        let url = action.sign(PRESIGN_TTL);
        let body = self
            .send_for_text(self.http.put(url).header(COPY_SOURCE, source), from)
            .await?;
        reject_error_body(&body, to)
    }

    async fn list_objects(
        &self,
        prefix: &str,
        continuation: Option<String>,
        max_keys: u32,
    ) -> Result<KeyPage, StorageError> {
        let mut action = self.bucket.list_objects_v2(self.creds());
        let query = action.query_mut();
        query.insert("max-keys", max_keys.to_string());
        query.insert("prefix", prefix.to_string());
        if let Some(token) = continuation {
            query.insert("continuation-token", token);
        }
        let url = action.sign(PRESIGN_TTL);
        let body = self.send_for_text(self.http.get(url), self.bucket.name()).await?;
        parse_listing(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(endpoint: &str) -> S3Client {
        S3Client::new(&S3Config {
            endpoint: endpoint.into(),
            region: "us-east-1".into(),
            bucket: "vault".into(),
            access_key_id: "minio".into(),
            secret_access_key: "minio123".into(),
        })
        .expect("client")
    }

    fn query_value(url: &Url, name: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn presigned_urls_are_path_style_and_scoped() {
        let s3 = client("http://127.0.0.1:9000/");
        let url = s3.bucket.get_object(s3.creds(), "users/1/blob").sign(PRESIGN_TTL);

        assert_eq!(url.host_str(), Some("127.0.0.1"));
        assert_eq!(url.port(), Some(9000));
        assert_eq!(url.path(), "/vault/users/1/blob");
        assert_eq!(query_value(&url, "X-Amz-Algorithm").as_deref(), Some("AWS4-HMAC-SHA256"));
        let credential = query_value(&url, "X-Amz-Credential").expect("credential");
        assert!(credential.starts_with("minio/"));
        assert!(credential.ends_with("/us-east-1/s3/aws4_request"));
        assert!(query_value(&url, "X-Amz-Signature").is_some());
    }

    #[test]
    fn copy_source_encodes_each_segment() {
        let s3 = client("http://127.0.0.1:9000");
        assert_eq!(s3.copy_source("users/42/a b.txt"), "/vault/users/42/a%20b.txt");
        assert_eq!(s3.copy_source("plain"), "/vault/plain");
    }

    #[test]
    fn copy_source_header_is_signed() {
        let s3 = client("http://127.0.0.1:9000");
        let mut action = s3.bucket.put_object(s3.creds(), "dst");
        action.headers_mut().insert(COPY_SOURCE, s3.copy_source("src"));
        let url = action.sign(PRESIGN_TTL);
        let signed = query_value(&url, "X-Amz-SignedHeaders").expect("signed headers");
        assert!(signed.split(';').any(|h| h == COPY_SOURCE), "{}", signed);
    }

    #[test]
    fn listing_xml_is_parsed() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult><Name>vault</Name><Prefix>blobs/</Prefix><KeyCount>2</KeyCount>
<MaxKeys>2</MaxKeys><IsTruncated>true</IsTruncated>
<Contents><Key>blobs/a</Key><LastModified>2024-01-01T00:00:00.000Z</LastModified><ETag>"1"</ETag><Size>10</Size><StorageClass>STANDARD</StorageClass></Contents>
<Contents><Key>blobs/c</Key><LastModified>2024-01-01T00:00:00.000Z</LastModified><ETag>"2"</ETag><Size>12</Size><StorageClass>STANDARD</StorageClass></Contents>
<NextContinuationToken>token-1</NextContinuationToken></ListBucketResult>"#;
        let page = parse_listing(body).expect("listing");
        assert_eq!(page.keys, vec!["blobs/a", "blobs/c"]);
        assert_eq!(page.next.as_deref(), Some("token-1"));
    }

    #[test]
    fn error_bodies_are_rejected() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>InternalError</Code><Message>try &amp; again</Message></Error>"#;
        let err = reject_error_body(body, "k").expect_err("error body");
        assert!(err.to_string().contains("InternalError"));
        assert!(err.to_string().contains("try & again"));

        let copied = "<CopyObjectResult><ETag>\"9\"</ETag></CopyObjectResult>";
        assert!(reject_error_body(copied, "k").is_ok());
        assert!(reject_error_body("", "k").is_ok());
    }

    #[test]
    fn bad_endpoint_is_a_backend_error() {
        let err = S3Client::new(&S3Config {
            endpoint: "not a url".into(),
            region: "us-east-1".into(),
            bucket: "vault".into(),
            access_key_id: "k".into(),
            secret_access_key: "s".into(),
        })
        .err()
        .expect("invalid endpoint");
        assert!(matches!(err, StorageError::Backend(_)));
    }
}
