//! Serving side of a parallel transfer.
//!
//! The server accepts the portal connections of one transfer on a [`PortalListener`] and either
//! receives the object (`serve_put*`) or sends it (`serve_get*`). When sending it assigns the
//! segments: connection `i`, in accept order, carries segment `i` of [`split_segments`].

use common::TransferConfig;
use tracing::instrument;

use crate::crypt::EncryptionContext;
use crate::engine::prepare_local_file;
use crate::error::{Error, TransferError, TransferSummary};
use crate::portal::PortalListener;
use crate::session::{ByteRange, Credit, StreamContext, TransferSession, split_segments};
use crate::streams::PortalConnection;

#[derive(Debug)]
pub struct PortalServer {
    config: std::sync::Arc<TransferConfig>,
    encryption: Option<std::sync::Arc<EncryptionContext>>,
}

impl PortalServer {
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

    /// Bind a listener for the next transfer.
    pub async fn listen(&self, ip: std::net::IpAddr) -> anyhow::Result<PortalListener> {
        PortalListener::bind(ip, self.config.clone()).await
    }

    fn session(&self, object_size: u64) -> TransferSession {
        TransferSession::new(StreamContext {
            config: self.config.clone(),
            encryption: self.encryption.clone(),
            checkpoint: None,
            object_size,
        })
    }

    async fn accept(
        &self,
        listener: &PortalListener,
        count: usize,
    ) -> Result<Vec<PortalConnection>, Error> {
        if count > self.config.max_threads {
            return Err(Error::new(
                TransferError::TooManyThreads {
                    requested: count,
                    max: self.config.max_threads,
                }
                .into(),
                TransferSummary::default(),
            ));
        }
        listener
            .accept(count)
            .await
            .map_err(|err| Error::new(err, TransferSummary::default()))
    }

    /// Receive a put of `size` bytes into `path` over `thread_count` connections.
    #[instrument(skip(self, listener))]
    pub async fn serve_put(
        &self,
        listener: &PortalListener,
        path: &std::path::Path,
        size: u64,
        thread_count: usize,
    ) -> Result<TransferSummary, Error> {
        let connections = self.accept(listener, thread_count.max(1)).await?;
        prepare_local_file(path, size)
            .await
            .map_err(|err| Error::new(err, TransferSummary::default()))?;
        let mut session = self.session(size);
        for conn in connections {
            session.spawn_receive(conn, path, Credit::Nothing);
        }
        session.join(size).await
    }

    /// Receive a resumed put: one connection carrying exactly `ranges` of the object.
    #[instrument(skip(self, listener, ranges))]
    pub async fn serve_put_ranges(
        &self,
        listener: &PortalListener,
        path: &std::path::Path,
        size: u64,
        ranges: &[(u64, u64)],
    ) -> Result<TransferSummary, Error> {
        let connections = self.accept(listener, 1).await?;
        prepare_local_file(path, size)
            .await
            .map_err(|err| Error::new(err, TransferSummary::default()))?;
        let mut session = self.session(size);
        for conn in connections {
            session.spawn_receive(conn, path, Credit::Nothing);
        }
        session.join(ranges.iter().map(|(_, len)| len).sum()).await
    }

    /// Send `size` bytes of `path` as a get over `thread_count` connections.
    #[instrument(skip(self, listener))]
    pub async fn serve_get(
        &self,
        listener: &PortalListener,
        path: &std::path::Path,
        size: u64,
        thread_count: usize,
    ) -> Result<TransferSummary, Error> {
        let threads = thread_count.max(1);
        let connections = self.accept(listener, threads).await?;
        let mut session = self.session(size);
        for (conn, segment) in connections.into_iter().zip(split_segments(size, threads)) {
            session.spawn_send(conn, path, vec![segment]);
        }
        session.join(size).await
    }

    /// Send a resumed get: exactly `ranges` of the object over one connection.
    #[instrument(skip(self, listener, ranges))]
    pub async fn serve_get_ranges(
        &self,
        listener: &PortalListener,
        path: &std::path::Path,
        size: u64,
        ranges: &[(u64, u64)],
    ) -> Result<TransferSummary, Error> {
        let connections = self.accept(listener, 1).await?;
        let ranges: Vec<ByteRange> = ranges
            .iter()
            .map(|&(offset, len)| ByteRange {
                offset,
                len,
                segment: None,
            })
            .collect();
        let expected = ranges.iter().map(|range| range.len).sum();
        let mut session = self.session(size);
        for conn in connections {
            session.spawn_send(conn, path, ranges.clone());
        }
        session.join(expected).await
    }
}
