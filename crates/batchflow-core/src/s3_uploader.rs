//! Production [`Uploader`] backed by `aws-sdk-s3`. Falls back to a plain
//! `PutObject` for objects smaller than one multipart part, and to a real
//! multipart upload (create / upload-part / complete) once the accumulated
//! stream crosses S3's minimum part size, keeping the upload bounded in
//! memory for large exports while still producing one object.

use crate::error::{BatchflowError, Result, UploadErrorKind};
use crate::upload::Uploader;
use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

/// S3's minimum part size for all but the final part of a multipart
/// upload.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

pub struct S3Uploader {
    client: Client,
    bucket: String,
}

impl S3Uploader {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl Uploader for S3Uploader {
    async fn put_stream(
        &self,
        path: &str,
        mut chunks: BoxStream<'static, Result<Bytes>>,
    ) -> Result<()> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut multipart: Option<(String, Vec<CompletedPart>)> = None;
        let mut part_number: i32 = 1;

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);

            if buffer.len() >= MIN_PART_SIZE {
                if multipart.is_none() {
                    let created = self
                        .client
                        .create_multipart_upload()
                        .bucket(&self.bucket)
                        .key(path)
                        .send()
                        .await
                        .map_err(classify_sdk_error)?;
                    let upload_id = created.upload_id().unwrap_or_default().to_string();
                    multipart = Some((upload_id, Vec::new()));
                }
                let (upload_id, parts) = multipart.as_mut().unwrap();
                let body = std::mem::take(&mut buffer);
                let resp = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(path)
                    .upload_id(upload_id.clone())
                    .part_number(part_number)
                    .body(ByteStream::from(body))
                    .send()
                    .await
                    .map_err(classify_sdk_error)?;
                parts.push(
                    CompletedPart::builder()
                        .e_tag(resp.e_tag().unwrap_or_default())
                        .part_number(part_number)
                        .build(),
                );
                part_number += 1;
            }
        }

        match multipart {
            None => {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(path)
                    .body(ByteStream::from(buffer))
                    .send()
                    .await
                    .map_err(classify_sdk_error)?;
            }
            Some((upload_id, mut parts)) => {
                if !buffer.is_empty() {
                    let resp = self
                        .client
                        .upload_part()
                        .bucket(&self.bucket)
                        .key(path)
                        .upload_id(upload_id.clone())
                        .part_number(part_number)
                        .body(ByteStream::from(buffer))
                        .send()
                        .await
                        .map_err(classify_sdk_error)?;
                    parts.push(
                        CompletedPart::builder()
                            .e_tag(resp.e_tag().unwrap_or_default())
                            .part_number(part_number)
                            .build(),
                    );
                }
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(path)
                    .upload_id(upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(classify_sdk_error)?;
            }
        }

        Ok(())
    }
}

fn classify_sdk_error<E, R>(err: SdkError<E, R>) -> BatchflowError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let code = err.as_service_error().and_then(|e| e.code());
    let kind = match code {
        Some("SlowDown") | Some("RequestTimeout") | Some("ThrottlingException") => {
            UploadErrorKind::Throttled
        }
        Some("InternalError") | Some("ServiceUnavailable") => UploadErrorKind::ServerError,
        Some(_) => UploadErrorKind::ClientError,
        None => UploadErrorKind::ServerError,
    };
    BatchflowError::Upload {
        kind,
        source: anyhow::anyhow!(err.to_string()),
    }
}
