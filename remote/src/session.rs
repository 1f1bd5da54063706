//! Workers of one parallel transfer and the scope that joins them.
//!
//! A sending worker walks its byte ranges and announces each piece with a DATA header of at most
//! `chunk_size` bytes. A receiving worker loops on headers until DONE, seeking whenever a header
//! offset differs from its position. Both move payload in `trans_buf_size` pieces and report progress
//! to the shared [`Checkpoint`].

use anyhow::Context;
use common::restart::Gap;
use common::{Checkpoint, TransferConfig};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

use crate::crypt::EncryptionContext;
use crate::error::{Error, TransferError, TransferSummary};
use crate::protocol::{Opcode, TransferHeader};
use crate::streams::PortalConnection;

/// Bytes `[offset, offset + len)` a sending worker moves, credited to `segment` in the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
    pub segment: Option<usize>,
}

impl From<Gap> for ByteRange {
    fn from(gap: Gap) -> Self {
        Self {
            offset: gap.offset,
            len: gap.len,
            segment: gap.follows_segment,
        }
    }
}

/// Split `size` bytes into `count` contiguous segments: segment `i` starts at `i * (size / count)`
/// and the last one also takes the remainder.
pub fn split_segments(size: u64, count: usize) -> Vec<ByteRange> {
    let count = count.max(1);
    let seg_size = size / count as u64;
    (0..count)
        .map(|i| {
            let offset = i as u64 * seg_size;
            let len = if i + 1 == count {
                size - offset
            } else {
                seg_size
            };
            ByteRange {
                offset,
                len,
                segment: Some(i),
            }
        })
        .collect()
}

/// Which checkpoint segment a receiving worker credits.
#[derive(Debug, Clone)]
pub(crate) enum Credit {
    Nothing,
    Segment(usize),
    /// Resumed transfer: credit the segment the containing gap follows.
    Gaps(std::sync::Arc<[Gap]>),
}

impl Credit {
    fn segment_for(&self, offset: u64) -> Option<usize> {
        match self {
            Credit::Nothing => None,
            Credit::Segment(idx) => Some(*idx),
            Credit::Gaps(gaps) => gaps
                .iter()
                .find(|gap| gap.offset <= offset && offset < gap.offset + gap.len)
                .and_then(|gap| gap.follows_segment),
        }
    }
}

/// State every worker of one transfer shares.
#[derive(Debug)]
pub(crate) struct StreamContext {
    pub config: std::sync::Arc<TransferConfig>,
    pub encryption: Option<std::sync::Arc<EncryptionContext>>,
    pub checkpoint: Option<std::sync::Arc<Checkpoint>>,
    pub object_size: u64,
}

impl StreamContext {
    fn crypt(&self) -> Option<&EncryptionContext> {
        self.encryption.as_deref()
    }

    async fn record_progress(&self, segment: Option<usize>, offset: u64, delta: u64) {
        let (Some(checkpoint), Some(segment)) = (self.checkpoint.as_deref(), segment) else {
            return;
        };
        checkpoint.record_progress(segment, offset, delta);
        if let Err(err) = checkpoint.flush_if_due().await {
            tracing::warn!("failed to update checkpoint, continuing transfer: {:#}", err);
        }
    }
}

async fn send_ranges_inner(
    ctx: &StreamContext,
    conn: &mut PortalConnection,
    path: &std::path::Path,
    ranges: &[ByteRange],
    summary: &mut TransferSummary,
) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {path:?} for reading"))?;
    let mut pos = 0u64;
    let mut buf = vec![0u8; ctx.config.trans_buf_size];
    for range in ranges.iter().filter(|range| range.len > 0) {
        let end = range.offset + range.len;
        let mut offset = range.offset;
        while offset < end {
            let header_len = (end - offset).min(ctx.config.chunk_size);
            conn.send
                .send_header(&TransferHeader::data(offset, header_len)?)
                .await?;
            if offset != pos {
                file.seek(std::io::SeekFrom::Start(offset))
                    .await
                    .with_context(|| format!("failed to seek {path:?} to {offset}"))?;
                pos = offset;
            }
            let header_end = offset + header_len;
            while pos < header_end {
                let piece = (header_end - pos).min(buf.len() as u64) as usize;
                file.read_exact(&mut buf[..piece])
                    .await
                    .with_context(|| format!("failed to read {piece} bytes of {path:?} at {pos}"))?;
                conn.send.send_chunk(&buf[..piece], ctx.crypt()).await?;
                summary.bytes_transferred += piece as u64;
                summary.chunks += 1;
                ctx.record_progress(range.segment, pos, piece as u64).await;
                pos += piece as u64;
            }
            offset = header_end;
        }
    }
    conn.send.send_header(&TransferHeader::done()).await?;
    conn.send.close().await?;
    Ok(())
}

/// Sending worker: moves `ranges` of the local file and finishes with DONE.
#[instrument(level = "debug", skip(ctx, conn, ranges), fields(peer = %conn.peer))]
pub(crate) async fn send_ranges(
    ctx: std::sync::Arc<StreamContext>,
    mut conn: PortalConnection,
    path: std::path::PathBuf,
    ranges: Vec<ByteRange>,
) -> Result<TransferSummary, Error> {
    let mut summary = TransferSummary {
        workers: 1,
        ..Default::default()
    };
    match send_ranges_inner(&ctx, &mut conn, &path, &ranges, &mut summary).await {
        Ok(()) => Ok(summary),
        Err(err) => {
            summary.failed_workers = 1;
            Err(Error::new(err, summary))
        }
    }
}

async fn receive_inner(
    ctx: &StreamContext,
    conn: &mut PortalConnection,
    path: &std::path::Path,
    credit: &Credit,
    summary: &mut TransferSummary,
) -> anyhow::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open {path:?} for writing"))?;
    let mut pos = 0u64;
    let mut buf = Vec::with_capacity(ctx.config.trans_buf_size);
    loop {
        let header = conn.recv.recv_header().await?;
        if header.opcode == Opcode::Done {
            break;
        }
        let (offset, length) = header.validate(ctx.object_size, summary.bytes_transferred)?;
        if offset != pos {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .with_context(|| format!("failed to seek {path:?} to {offset}"))?;
            pos = offset;
        }
        let segment = credit.segment_for(offset);
        let mut remaining = length;
        while remaining > 0 {
            let got = conn
                .recv
                .recv_chunk(remaining, ctx.config.trans_buf_size, ctx.crypt(), &mut buf)
                .await?;
            file.write_all(&buf[..got])
                .await
                .with_context(|| format!("failed to write {got} bytes to {path:?} at {pos}"))?;
            summary.bytes_transferred += got as u64;
            summary.chunks += 1;
            ctx.record_progress(segment, pos, got as u64).await;
            pos += got as u64;
            remaining -= got as u64;
        }
    }
    file.flush()
        .await
        .with_context(|| format!("failed to flush {path:?}"))?;
    Ok(())
}

/// Receiving worker: applies DATA headers to the local file until DONE.
#[instrument(level = "debug", skip(ctx, conn, credit), fields(peer = %conn.peer))]
pub(crate) async fn receive(
    ctx: std::sync::Arc<StreamContext>,
    mut conn: PortalConnection,
    path: std::path::PathBuf,
    credit: Credit,
) -> Result<TransferSummary, Error> {
    let mut summary = TransferSummary {
        workers: 1,
        ..Default::default()
    };
    match receive_inner(&ctx, &mut conn, &path, &credit, &mut summary).await {
        Ok(()) => Ok(summary),
        Err(err) => {
            summary.failed_workers = 1;
            Err(Error::new(err, summary))
        }
    }
}

/// Scope owning the workers of one transfer.
///
/// Dropping the session aborts whatever is still running; [`TransferSession::join`] waits for all of
/// them and settles the checkpoint.
pub(crate) struct TransferSession {
    ctx: std::sync::Arc<StreamContext>,
    workers: tokio::task::JoinSet<Result<TransferSummary, Error>>,
}

impl TransferSession {
    pub fn new(ctx: StreamContext) -> Self {
        Self {
            ctx: std::sync::Arc::new(ctx),
            workers: tokio::task::JoinSet::new(),
        }
    }

    pub fn spawn_send(
        &mut self,
        conn: PortalConnection,
        path: &std::path::Path,
        ranges: Vec<ByteRange>,
    ) {
        self.workers
            .spawn(send_ranges(self.ctx.clone(), conn, path.to_path_buf(), ranges));
    }

    pub fn spawn_receive(&mut self, conn: PortalConnection, path: &std::path::Path, credit: Credit) {
        self.workers
            .spawn(receive(self.ctx.clone(), conn, path.to_path_buf(), credit));
    }

    /// Wait for every worker and check that `expected` bytes were moved in total.
    ///
    /// The first failure aborts the remaining workers, whose sockets close as they are dropped. On
    /// failure the checkpoint is written so a later resume starts from the progress made; on success
    /// it is removed.
    pub async fn join(mut self, expected: u64) -> Result<TransferSummary, Error> {
        let mut summary = TransferSummary::default();
        let mut first_error: Option<anyhow::Error> = None;
        while let Some(res) = self.workers.join_next().await {
            match res {
                Ok(Ok(worker)) => summary = summary + worker,
                Ok(Err(error)) => {
                    tracing::error!("portal worker failed: {:#}", &error);
                    summary = summary + error.summary;
                    if first_error.is_none() {
                        first_error = Some(error.source);
                        self.workers.abort_all();
                    }
                }
                Err(error) if error.is_cancelled() => {
                    summary.workers += 1;
                    summary.failed_workers += 1;
                }
                Err(error) => {
                    summary.workers += 1;
                    summary.failed_workers += 1;
                    if first_error.is_none() {
                        first_error = Some(anyhow::Error::new(error).context("portal worker panicked"));
                        self.workers.abort_all();
                    }
                }
            }
        }
        if first_error.is_none() && summary.bytes_transferred != expected {
            first_error = Some(
                TransferError::TransferLengthMismatch {
                    expected,
                    actual: summary.bytes_transferred,
                }
                .into(),
            );
        }
        let checkpoint = self.ctx.checkpoint.as_deref();
        if let Some(error) = first_error {
            if let Some(checkpoint) = checkpoint.filter(|checkpoint| checkpoint.is_enabled()) {
                match checkpoint.flush().await {
                    Ok(()) => tracing::info!(
                        "saved checkpoint {:?} after failed transfer",
                        checkpoint.path()
                    ),
                    Err(err) => tracing::warn!("failed to save checkpoint: {:#}", err),
                }
            }
            return Err(Error::new(error, summary));
        }
        let finished = match checkpoint {
            Some(checkpoint) => checkpoint.finish().await,
            None => Ok(()),
        };
        if let Err(err) = finished {
            tracing::warn!("failed to remove checkpoint after transfer: {:#}", err);
        }
        tracing::debug!("transfer complete\n{}", &summary);
        Ok(summary)
    }
}
