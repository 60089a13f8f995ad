use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::DumpSession;
use crate::error::DumpError;

/// One item of the export stream handed to the upload pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum DumpFrame {
    Data(Bytes),
    /// Clean end of the export; `bytes` is the total length of all `Data` frames.
    End { bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpSummary {
    pub bytes: u64,
    pub chunks: u64,
}

pub struct DumpExecutor {
    chunk_size: usize,
}

impl DumpExecutor {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Streams the export of `session` into `sink`, chunk by chunk.
    ///
    /// Memory use is bounded by the chunk size times the channel capacity: a
    /// full channel suspends the read loop until the consumer catches up.
    pub async fn run<S: DumpSession>(
        &self,
        session: &mut S,
        sink: mpsc::Sender<DumpFrame>,
        cancel: &CancellationToken,
    ) -> Result<DumpSummary, DumpError> {
        let mut summary = DumpSummary { bytes: 0, chunks: 0 };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DumpError::new(0, anyhow::anyhow!("cancelled before export started"))),
            started = session.begin_export() => started.map_err(|e| DumpError::new(0, e))?,
        }
        info!(chunk_size = self.chunk_size, "Export started");

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(DumpError::new(summary.bytes, anyhow::anyhow!("cancelled while reading export")));
                }
                read = session.read_chunk(self.chunk_size) => read,
            };

            let frame = match read {
                Ok(Some(chunk)) if chunk.is_empty() => continue,
                Ok(Some(chunk)) => {
                    if chunk.len() > self.chunk_size {
                        return Err(DumpError::new(
                            summary.bytes,
                            anyhow::anyhow!(
                                "session returned {} bytes, above the {} byte chunk bound",
                                chunk.len(),
                                self.chunk_size
                            ),
                        ));
                    }
                    summary.bytes += chunk.len() as u64;
                    summary.chunks += 1;
                    DumpFrame::Data(chunk)
                }
                Ok(None) => DumpFrame::End {
                    bytes: summary.bytes,
                },
                Err(e) => return Err(DumpError::new(summary.bytes, e)),
            };
            let finished = matches!(frame, DumpFrame::End { .. });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(DumpError::new(summary.bytes, anyhow::anyhow!("cancelled while handing off a chunk")));
                }
                sent = sink.send(frame) => {
                    if sent.is_err() {
                        return Err(DumpError::new(summary.bytes, anyhow::anyhow!("upload stopped consuming the export")));
                    }
                }
            }

            if finished {
                info!(bytes = summary.bytes, chunks = summary.chunks, "Export finished");
                return Ok(summary);
            }
            debug!(bytes = summary.bytes, "Export progress");
        }
    }
}
