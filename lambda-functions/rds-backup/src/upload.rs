use std::io::Write;
use std::time::Duration;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::BackupArtifact;
use crate::deadline::Deadline;
use crate::dump::DumpFrame;
use crate::error::UploadError;
use crate::retry::{retry_cancellable, RetryError, RetryPolicy};
use crate::storage::{ObjectStore, PartReceipt, TransferHandle};

/// Multipart uploads accept at most this many parts.
pub const MAX_PARTS: i32 = 10_000;

/// Reserved at the end of the invocation for abort and cleanup.
const ABORT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    /// Complete was issued; storage may have committed the object.
    Finalizing,
    Completed,
    Aborted,
}

/// One multipart transfer and the parts the store has acknowledged so far.
pub struct UploadSession<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    handle: TransferHandle,
    parts: Vec<PartReceipt>,
    hasher: Sha256,
    size_bytes: u64,
    state: SessionState,
}

impl<'a, S: ObjectStore + ?Sized> UploadSession<'a, S> {
    pub async fn initiate(
        store: &'a S,
        bucket: &str,
        key: &str,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Self, UploadError> {
        let handle = retry_cancellable(retry, cancel, "initiate_upload", || {
            store.initiate(bucket, key)
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => UploadError::Cancelled,
            RetryError::Exhausted { cause, .. } => UploadError::Initiate {
                key: key.to_string(),
                cause,
            },
        })?;
        info!(bucket, key, upload_id = %handle.upload_id, "Initiated multipart upload");

        Ok(Self {
            store,
            handle,
            parts: Vec::new(),
            hasher: Sha256::new(),
            size_bytes: 0,
            state: SessionState::Open,
        })
    }

    pub fn parts(&self) -> &[PartReceipt] {
        &self.parts
    }

    /// Ships the next part, retrying it on its own up to the policy bound.
    pub async fn send_part(
        &mut self,
        body: Bytes,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        let part_number = self.parts.len() as i32 + 1;
        if part_number > MAX_PARTS {
            return Err(UploadError::TooManyParts { max: MAX_PARTS });
        }

        let store = self.store;
        let handle = &self.handle;
        let e_tag = retry_cancellable(retry, cancel, "upload_part", || {
            store.upload_part(handle, part_number, body.clone())
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => UploadError::Cancelled,
            RetryError::Exhausted { attempts, cause } => UploadError::Part {
                part_number,
                attempts,
                cause,
            },
        })?;

        self.hasher.update(&body);
        self.size_bytes += body.len() as u64;
        self.parts.push(PartReceipt {
            part_number,
            e_tag,
            size: body.len() as u64,
        });
        debug!(part_number, size = body.len(), "Uploaded part");
        Ok(())
    }

    /// Commits every acknowledged part as one visible object.
    ///
    /// Cancellation is honoured only before an attempt is issued. An issued
    /// attempt runs until it answers or `deadline` (less the abort reserve)
    /// passes, since storage may commit the object even if the caller stops
    /// waiting.
    pub async fn complete(
        &mut self,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
        deadline: Deadline,
    ) -> Result<BackupArtifact, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        self.state = SessionState::Finalizing;

        let stop_at = deadline.less(ABORT_TIMEOUT);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let cause = match tokio::time::timeout_at(
                stop_at,
                self.store.complete(&self.handle, &self.parts),
            )
            .await
            {
                Ok(Ok(())) => break,
                Ok(Err(e)) => e,
                Err(_) => {
                    return Err(UploadError::Finalize {
                        cause: anyhow::anyhow!("no answer to complete before the deadline"),
                    })
                }
            };
            if retry.is_last(attempt) {
                return Err(UploadError::Finalize { cause });
            }

            let backoff = retry.backoff_after(attempt);
            warn!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %format!("{cause:#}"),
                "Complete failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        self.state = SessionState::Completed;

        let artifact = BackupArtifact {
            bucket: self.handle.bucket.clone(),
            key: self.handle.key.clone(),
            size_bytes: self.size_bytes,
            checksum_sha256: hex::encode(self.hasher.clone().finalize()),
            parts: self.parts.len(),
        };
        info!(
            key = %artifact.key,
            size_bytes = artifact.size_bytes,
            parts = artifact.parts,
            "Completed multipart upload"
        );
        Ok(artifact)
    }

    /// Discards the transfer so no partial object ever becomes visible.
    ///
    /// After a complete that was never confirmed the object itself is deleted too.
    pub async fn abort(&mut self) {
        let finalizing = match self.state {
            SessionState::Open => false,
            SessionState::Finalizing => true,
            SessionState::Completed | SessionState::Aborted => return,
        };
        self.state = SessionState::Aborted;

        let cleanup = async {
            let aborted = self.store.abort(&self.handle).await;
            if !finalizing {
                return aborted;
            }
            // A committed upload no longer exists; the object is what must go.
            if let Err(e) = aborted {
                debug!(error = %format!("{e:#}"), "Abort after complete failed");
            }
            self.store.delete(&self.handle.bucket, &self.handle.key).await
        };
        match tokio::time::timeout(ABORT_TIMEOUT, cleanup).await {
            Ok(Ok(())) => warn!(
                key = %self.handle.key,
                upload_id = %self.handle.upload_id,
                parts = self.parts.len(),
                deleted_object = finalizing,
                "Aborted multipart upload"
            ),
            Ok(Err(e)) => error!(
                key = %self.handle.key,
                error = %format!("{e:#}"),
                "Failed to abort multipart upload"
            ),
            Err(_) => error!(
                key = %self.handle.key,
                timeout_ms = ABORT_TIMEOUT.as_millis() as u64,
                "Timed out aborting multipart upload"
            ),
        }
    }
}

/// Gzip-compresses the export and cuts the output into equally sized parts.
struct PartBuffer {
    encoder: GzEncoder<Vec<u8>>,
    part_size: usize,
}

impl PartBuffer {
    fn new(part_size: usize) -> Self {
        Self {
            encoder: GzEncoder::new(Vec::with_capacity(part_size), Compression::default()),
            part_size,
        }
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<Vec<Bytes>> {
        self.encoder.write_all(data)?;
        Ok(self.take_full_parts())
    }

    fn take_full_parts(&mut self) -> Vec<Bytes> {
        let buf = self.encoder.get_mut();
        let mut parts = Vec::new();
        while buf.len() >= self.part_size {
            let rest = buf.split_off(self.part_size);
            parts.push(Bytes::from(std::mem::replace(buf, rest)));
        }
        parts
    }

    /// Flushes the gzip trailer; returns the remaining full parts and the short tail.
    fn finish(mut self) -> std::io::Result<(Vec<Bytes>, Bytes)> {
        self.encoder.try_finish()?;
        let parts = self.take_full_parts();
        let tail = self.encoder.finish()?;
        Ok((parts, Bytes::from(tail)))
    }
}

/// Consumes the dump stream and writes it to object storage.
pub struct UploadPipeline<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    part_size: usize,
    retry: RetryPolicy,
    deadline: Deadline,
}

impl<'a, S: ObjectStore + ?Sized> UploadPipeline<'a, S> {
    pub fn new(store: &'a S, part_size: usize, retry: RetryPolicy, deadline: Deadline) -> Self {
        Self {
            store,
            part_size: part_size.max(1),
            retry,
            deadline,
        }
    }

    /// Uploads the stream as `bucket/key`.
    ///
    /// The object becomes visible only when the stream ends with
    /// [`DumpFrame::End`]; every other exit aborts the transfer and closes the
    /// receiver so the producer stops reading.
    pub async fn upload(
        &self,
        mut frames: mpsc::Receiver<DumpFrame>,
        bucket: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<BackupArtifact, UploadError> {
        let mut session = None;
        let result = self
            .transfer(&mut frames, bucket, key, cancel, &mut session)
            .await;

        if let Err(e) = &result {
            warn!(key, error = %e, "Upload failed, aborting");
            frames.close();
            if let Some(session) = session.as_mut() {
                session.abort().await;
            }
        }
        result
    }

    async fn transfer(
        &self,
        frames: &mut mpsc::Receiver<DumpFrame>,
        bucket: &str,
        key: &str,
        cancel: &CancellationToken,
        session: &mut Option<UploadSession<'a, S>>,
    ) -> Result<BackupArtifact, UploadError> {
        let mut next = next_frame(frames, cancel).await?;
        let open = session.insert(
            UploadSession::initiate(self.store, bucket, key, &self.retry, cancel).await?,
        );
        let mut buffer = PartBuffer::new(self.part_size);

        loop {
            match next {
                DumpFrame::Data(chunk) => {
                    for part in buffer.write(&chunk)? {
                        open.send_part(part, &self.retry, cancel).await?;
                    }
                }
                DumpFrame::End { bytes } => {
                    let (parts, tail) = buffer.finish()?;
                    for part in parts {
                        open.send_part(part, &self.retry, cancel).await?;
                    }
                    if !tail.is_empty() || open.parts().is_empty() {
                        open.send_part(tail, &self.retry, cancel).await?;
                    }
                    debug!(dump_bytes = bytes, parts = open.parts().len(), "Dump stream ended");
                    return open.complete(&self.retry, cancel, self.deadline).await;
                }
            }
            next = next_frame(frames, cancel).await?;
        }
    }
}

async fn next_frame(
    frames: &mut mpsc::Receiver<DumpFrame>,
    cancel: &CancellationToken,
) -> Result<DumpFrame, UploadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        frame = frames.recv() => frame.ok_or(UploadError::ProducerAborted),
    }
}
