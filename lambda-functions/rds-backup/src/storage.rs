use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Storage-side identity of one in-flight multipart transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHandle {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// A part the store has acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartReceipt {
    pub part_number: i32,
    pub e_tag: String,
    pub size: u64,
}

/// The multipart operations the upload pipeline relies on.
///
/// Parts may be sent more than once; nothing becomes visible until
/// [`ObjectStore::complete`] succeeds.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn initiate(&self, bucket: &str, key: &str) -> anyhow::Result<TransferHandle>;

    /// Uploads one part and returns its ETag.
    async fn upload_part(
        &self,
        handle: &TransferHandle,
        part_number: i32,
        body: Bytes,
    ) -> anyhow::Result<String>;

    async fn complete(&self, handle: &TransferHandle, parts: &[PartReceipt]) -> anyhow::Result<()>;

    async fn abort(&self, handle: &TransferHandle) -> anyhow::Result<()>;

    /// Removes a committed object.
    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<()>;
}

pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn initiate(&self, bucket: &str, key: &str) -> anyhow::Result<TransferHandle> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type("application/gzip")
            .send()
            .await
            .with_context(|| format!("Failed to create multipart upload for s3://{bucket}/{key}"))?;

        let upload_id = output
            .upload_id()
            .context("Multipart upload response carried no upload id")?;

        Ok(TransferHandle {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        })
    }

    async fn upload_part(
        &self,
        handle: &TransferHandle,
        part_number: i32,
        body: Bytes,
    ) -> anyhow::Result<String> {
        let output = self
            .client
            .upload_part()
            .bucket(&handle.bucket)
            .key(&handle.key)
            .upload_id(&handle.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("Failed to upload part {part_number}"))?;

        output
            .e_tag()
            .map(str::to_string)
            .with_context(|| format!("Part {part_number} response carried no ETag"))
    }

    async fn complete(&self, handle: &TransferHandle, parts: &[PartReceipt]) -> anyhow::Result<()> {
        let completed = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(&part.e_tag)
                    .build()
            })
            .collect::<Vec<_>>();

        self.client
            .complete_multipart_upload()
            .bucket(&handle.bucket)
            .key(&handle.key)
            .upload_id(&handle.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to complete multipart upload for s3://{}/{}",
                    handle.bucket, handle.key
                )
            })?;

        Ok(())
    }

    async fn abort(&self, handle: &TransferHandle) -> anyhow::Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&handle.bucket)
            .key(&handle.key)
            .upload_id(&handle.upload_id)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to abort multipart upload {} for s3://{}/{}",
                    handle.upload_id, handle.bucket, handle.key
                )
            })?;

        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to delete s3://{bucket}/{key}"))?;

        Ok(())
    }
}
