//! Client side of a parallel transfer.
//!
//! [`TransferEngine::put`] sends a local file over `thread_count` portal connections and
//! [`TransferEngine::get`] receives one. Every connection is opened before any byte moves; if one
//! cannot be opened the transfer fails without starting. Transfers of large enough objects keep a
//! checkpoint at [`TransferRequest::restart_file`], which [`TransferEngine::resume_put`] and
//! [`TransferEngine::resume_get`] use to move only the missing byte ranges.

use anyhow::Context;
use common::restart::{Gap, RestartError, RestartInfo, RestartOperation, RestartPolicy};
use common::{Checkpoint, TransferConfig};
use tracing::instrument;

use crate::crypt::EncryptionContext;
use crate::error::{Error, TransferError, TransferSummary};
use crate::portal::{self, PortalAddr};
use crate::session::{ByteRange, Credit, StreamContext, TransferSession, split_segments};
use crate::streams::PortalConnection;

/// One put or get.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub portal: PortalAddr,
    pub local_path: std::path::PathBuf,
    pub obj_path: String,
    pub size: u64,
    pub thread_count: usize,
    /// Where the checkpoint lives while the transfer runs
    pub restart_file: Option<std::path::PathBuf>,
}

/// How to continue a transfer that may have been interrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePlan {
    /// No usable checkpoint, move everything.
    Restart,
    /// Move only `gaps`; progress keeps being recorded into `info`.
    Gaps { info: RestartInfo, gaps: Vec<Gap> },
}

#[derive(Debug)]
pub struct TransferEngine {
    config: std::sync::Arc<TransferConfig>,
    encryption: Option<std::sync::Arc<EncryptionContext>>,
}

impl TransferEngine {
    pub fn new(
        config: TransferConfig,
        encryption: Option<EncryptionContext>,
    ) -> anyhow::Result<Self> {
        config
            .validate()
            .map_err(|msg| anyhow::anyhow!("invalid transfer config: {msg}"))?;
        Ok(Self {
            config: std::sync::Arc::new(config),
            encryption: encryption.map(std::sync::Arc::new),
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn session(&self, object_size: u64, checkpoint: Option<Checkpoint>) -> TransferSession {
        TransferSession::new(StreamContext {
            config: self.config.clone(),
            encryption: self.encryption.clone(),
            checkpoint: checkpoint.map(std::sync::Arc::new),
            object_size,
        })
    }

    /// Open and immediately close `count` connections so the remote side is not left waiting.
    async fn drain(&self, portal: &PortalAddr, count: usize) {
        let attempts = (0..count).map(|_| portal::connect(portal, &self.config));
        let results = futures::future::join_all(attempts).await;
        let opened = results.iter().filter(|res| res.is_ok()).count();
        tracing::warn!(
            "closed {} of {} portal connections to {} after rejecting the request",
            opened,
            count,
            portal.addr
        );
    }

    /// Open all connections up front; any failure aborts the transfer before data moves.
    async fn open_connections(
        &self,
        portal: &PortalAddr,
        thread_count: usize,
    ) -> Result<Vec<PortalConnection>, Error> {
        if thread_count > self.config.max_threads {
            self.drain(portal, thread_count).await;
            return Err(Error::new(
                TransferError::TooManyThreads {
                    requested: thread_count,
                    max: self.config.max_threads,
                }
                .into(),
                TransferSummary::default(),
            ));
        }
        let attempts = (0..thread_count).map(|_| portal::connect(portal, &self.config));
        futures::future::try_join_all(attempts)
            .await
            .with_context(|| {
                format!(
                    "failed to open {} portal connections to {}",
                    thread_count, portal.addr
                )
            })
            .map_err(|err| Error::new(err, TransferSummary::default()))
    }

    fn checkpoint(
        &self,
        operation: RestartOperation,
        request: &TransferRequest,
        threads: usize,
    ) -> Checkpoint {
        let policy = RestartPolicy::from(self.config.as_ref());
        let info = RestartInfo::begin(
            operation,
            &request.local_path,
            &request.obj_path,
            request.size,
            threads,
            &policy,
        );
        Checkpoint::new(info, request.restart_file.clone(), policy.flush_threshold)
    }

    /// Send the local file to the portal.
    #[instrument(skip(self, request), fields(local = ?request.local_path, obj = %request.obj_path))]
    pub async fn put(&self, request: &TransferRequest) -> Result<TransferSummary, Error> {
        let threads = request.thread_count.max(1);
        let connections = self.open_connections(&request.portal, threads).await?;
        let local_size = tokio::fs::metadata(&request.local_path)
            .await
            .with_context(|| format!("failed to stat {:?}", request.local_path))
            .map_err(|err| Error::new(err, TransferSummary::default()))?
            .len();
        if local_size != request.size {
            return Err(Error::new(
                anyhow::Error::new(TransferError::TransferLengthMismatch {
                    expected: request.size,
                    actual: local_size,
                })
                .context(format!("{:?} changed size before the put", request.local_path)),
                TransferSummary::default(),
            ));
        }
        let checkpoint = self.checkpoint(RestartOperation::Put, request, threads);
        let mut session = self.session(request.size, Some(checkpoint));
        for (conn, segment) in connections
            .into_iter()
            .zip(split_segments(request.size, threads))
        {
            session.spawn_send(conn, &request.local_path, vec![segment]);
        }
        tracing::info!(
            "put of {} started on {} portal connections",
            bytesize::ByteSize(request.size),
            threads
        );
        session.join(request.size).await
    }

    /// Receive the object into the local file.
    ///
    /// The file is sized up front and not truncated, so an interrupted get leaves the bytes it moved
    /// in place for a resume.
    #[instrument(skip(self, request), fields(local = ?request.local_path, obj = %request.obj_path))]
    pub async fn get(&self, request: &TransferRequest) -> Result<TransferSummary, Error> {
        let threads = request.thread_count.max(1);
        let connections = self.open_connections(&request.portal, threads).await?;
        prepare_local_file(&request.local_path, request.size)
            .await
            .map_err(|err| Error::new(err, TransferSummary::default()))?;
        let checkpoint = self.checkpoint(RestartOperation::Get, request, threads);
        let mut session = self.session(request.size, Some(checkpoint));
        for (idx, conn) in connections.into_iter().enumerate() {
            session.spawn_receive(conn, &request.local_path, Credit::Segment(idx));
        }
        tracing::info!(
            "get of {} started on {} portal connections",
            bytesize::ByteSize(request.size),
            threads
        );
        session.join(request.size).await
    }

    /// Decide whether the checkpoint at `request.restart_file` can be trusted.
    ///
    /// A missing, unreadable, or inconsistent checkpoint means starting over.
    pub async fn plan_resume(
        &self,
        operation: RestartOperation,
        request: &TransferRequest,
    ) -> ResumePlan {
        let Some(path) = request.restart_file.as_deref() else {
            return ResumePlan::Restart;
        };
        let loaded = RestartInfo::load(path).await.and_then(|info| {
            info.validate_for(path, &request.local_path, &request.obj_path, request.size)?;
            Ok(info)
        });
        let info = match loaded {
            Ok(info) => info,
            Err(RestartError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                tracing::debug!("no checkpoint at {:?}, transferring everything", path);
                return ResumePlan::Restart;
            }
            Err(err) => {
                tracing::warn!("ignoring checkpoint, transferring everything: {:#}", err);
                return ResumePlan::Restart;
            }
        };
        if info.operation != operation || !info.is_tracking() {
            tracing::warn!(
                "checkpoint {:?} does not describe a tracked {:?}, transferring everything",
                path,
                operation
            );
            return ResumePlan::Restart;
        }
        if operation == RestartOperation::Get {
            let local_size = tokio::fs::metadata(&request.local_path)
                .await
                .map(|meta| meta.len())
                .ok();
            if local_size != Some(request.size) {
                tracing::warn!(
                    "partial file {:?} is missing or resized, transferring everything",
                    request.local_path
                );
                return ResumePlan::Restart;
            }
        }
        let gaps = info.resume();
        tracing::info!(
            "resuming from checkpoint {:?}: {} already moved, {} gaps left",
            path,
            bytesize::ByteSize(info.bytes_done()),
            gaps.len()
        );
        ResumePlan::Gaps { info, gaps }
    }

    async fn discard_checkpoint(&self, request: &TransferRequest) {
        let Some(path) = request.restart_file.as_deref() else {
            return;
        };
        if let Err(err) = RestartInfo::clear(path).await {
            tracing::warn!("failed to remove stale checkpoint: {:#}", err);
        }
    }

    fn resumed_checkpoint(&self, request: &TransferRequest, info: RestartInfo) -> Checkpoint {
        Checkpoint::new(
            info,
            request.restart_file.clone(),
            self.config.restart_flush_threshold,
        )
    }

    /// Continue an interrupted put, moving only the missing ranges over one connection.
    ///
    /// Without a usable checkpoint this is a full [`TransferEngine::put`].
    #[instrument(skip(self, request), fields(local = ?request.local_path, obj = %request.obj_path))]
    pub async fn resume_put(&self, request: &TransferRequest) -> Result<TransferSummary, Error> {
        let (info, gaps) = match self.plan_resume(RestartOperation::Put, request).await {
            ResumePlan::Restart => {
                self.discard_checkpoint(request).await;
                return self.put(request).await;
            }
            ResumePlan::Gaps { info, gaps } => (info, gaps),
        };
        let connections = self.open_connections(&request.portal, 1).await?;
        let expected = gaps.iter().map(|gap| gap.len).sum();
        let checkpoint = self.resumed_checkpoint(request, info);
        let mut session = self.session(request.size, Some(checkpoint));
        let ranges: Vec<ByteRange> = gaps.into_iter().map(ByteRange::from).collect();
        for conn in connections {
            session.spawn_send(conn, &request.local_path, ranges.clone());
        }
        session.join(expected).await
    }

    /// Continue an interrupted get, receiving only the missing ranges over one connection.
    #[instrument(skip(self, request), fields(local = ?request.local_path, obj = %request.obj_path))]
    pub async fn resume_get(&self, request: &TransferRequest) -> Result<TransferSummary, Error> {
        let (info, gaps) = match self.plan_resume(RestartOperation::Get, request).await {
            ResumePlan::Restart => {
                self.discard_checkpoint(request).await;
                return self.get(request).await;
            }
            ResumePlan::Gaps { info, gaps } => (info, gaps),
        };
        let connections = self.open_connections(&request.portal, 1).await?;
        let expected = gaps.iter().map(|gap| gap.len).sum();
        let checkpoint = self.resumed_checkpoint(request, info);
        let mut session = self.session(request.size, Some(checkpoint));
        let credit = Credit::Gaps(gaps.into());
        for conn in connections {
            session.spawn_receive(conn, &request.local_path, credit.clone());
        }
        session.join(expected).await
    }
}

/// Create `path` if needed and size it to `size` without discarding existing contents.
pub(crate) async fn prepare_local_file(path: &std::path::Path, size: u64) -> anyhow::Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .with_context(|| format!("failed to create {path:?}"))?;
    file.set_len(size)
        .await
        .with_context(|| format!("failed to size {path:?} to {size} bytes"))?;
    Ok(())
}
