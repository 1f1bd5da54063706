//! Portal sockets: the data-plane connections of one parallel transfer.
//!
//! The listening side publishes a [`PortalAddr`] (socket address plus a random cookie). Every client
//! connection opens by writing the cookie as a big-endian `u32`; connections presenting anything else
//! are dropped.

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

use crate::error::TransferError;
use crate::port_ranges::PortRanges;
use crate::streams::PortalConnection;

/// Where to connect the portal sockets of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortalAddr {
    pub addr: std::net::SocketAddr,
    pub cookie: u32,
}

/// Apply the configured socket buffer sizes, logging rather than failing when the OS refuses.
fn configure_tcp_buffers(stream: &tokio::net::TcpStream, config: &common::TransferConfig) {
    let socket = socket2::SockRef::from(stream);
    if let Some(Err(err)) = config
        .tcp_send_buffer
        .map(|size| socket.set_send_buffer_size(size))
    {
        tracing::warn!("failed to set TCP send buffer size: {err}");
    }
    if let Some(Err(err)) = config
        .tcp_recv_buffer
        .map(|size| socket.set_recv_buffer_size(size))
    {
        tracing::warn!("failed to set TCP receive buffer size: {err}");
    }
}

fn connection_error(addr: std::net::SocketAddr, reason: impl std::fmt::Display) -> TransferError {
    TransferError::ConnectionError {
        addr,
        reason: reason.to_string(),
    }
}

/// Open one portal connection and present the cookie.
#[instrument(level = "debug", skip(config))]
pub async fn connect(
    portal: &PortalAddr,
    config: &common::TransferConfig,
) -> anyhow::Result<PortalConnection> {
    let connecting = tokio::net::TcpStream::connect(portal.addr);
    let mut stream = match tokio::time::timeout(config.connect_timeout, connecting).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(connection_error(portal.addr, err).into()),
        Err(_) => {
            return Err(connection_error(
                portal.addr,
                format!(
                    "timed out after {}",
                    humantime::format_duration(config.connect_timeout)
                ),
            )
            .into());
        }
    };
    stream
        .set_nodelay(true)
        .map_err(|err| connection_error(portal.addr, err))?;
    configure_tcp_buffers(&stream, config);
    let cookie = portal.cookie.to_be_bytes();
    match tokio::time::timeout(config.io_timeout, stream.write_all(&cookie)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(connection_error(portal.addr, err).into()),
        Err(_) => return Err(connection_error(portal.addr, "timed out sending cookie").into()),
    }
    PortalConnection::from_tcp(stream, config.io_timeout)
}

/// Listening side of a portal: hands out the address and accepts the expected connections.
#[derive(Debug)]
pub struct PortalListener {
    listener: tokio::net::TcpListener,
    cookie: u32,
    config: std::sync::Arc<common::TransferConfig>,
}

impl PortalListener {
    /// Bind on `ip`, inside the configured port ranges when there are any.
    pub async fn bind(
        ip: std::net::IpAddr,
        config: std::sync::Arc<common::TransferConfig>,
    ) -> anyhow::Result<Self> {
        let listener = match config.port_ranges.as_deref() {
            Some(ranges) => PortRanges::parse(ranges)?
                .bind_tcp_listener(ip, config.connect_timeout)
                .await
                .context("failed to bind portal listener")?,
            None => tokio::net::TcpListener::bind(std::net::SocketAddr::new(ip, 0))
                .await
                .with_context(|| format!("failed to bind portal listener on {ip}"))?,
        };
        Ok(Self {
            listener,
            cookie: rand::random(),
            config,
        })
    }

    pub fn portal_addr(&self) -> anyhow::Result<PortalAddr> {
        Ok(PortalAddr {
            addr: self
                .listener
                .local_addr()
                .context("failed to read portal listener address")?,
            cookie: self.cookie,
        })
    }

    async fn check_cookie(&self, stream: &mut tokio::net::TcpStream) -> anyhow::Result<()> {
        let mut cookie = [0u8; 4];
        // part of connection setup, so a silent client cannot hold up later connections
        tokio::time::timeout(self.config.connect_timeout, stream.read_exact(&mut cookie))
            .await
            .context("timed out waiting for portal cookie")?
            .context("failed to read portal cookie")?;
        let received = u32::from_be_bytes(cookie);
        if received != self.cookie {
            return Err(TransferError::CookieMismatch {
                expected: self.cookie,
                received,
            }
            .into());
        }
        Ok(())
    }

    /// Accept until `count` connections have presented the right cookie, in arrival order.
    ///
    /// Each wait for a new connection, and for its cookie, is bounded by the connect timeout.
    #[instrument(level = "debug", skip(self))]
    pub async fn accept(&self, count: usize) -> anyhow::Result<Vec<PortalConnection>> {
        let mut connections = Vec::with_capacity(count);
        while connections.len() < count {
            let (mut stream, peer) =
                tokio::time::timeout(self.config.connect_timeout, self.listener.accept())
                    .await
                    .with_context(|| {
                        format!(
                            "timed out waiting for portal connection {} of {count}",
                            connections.len() + 1
                        )
                    })?
                    .context("failed to accept portal connection")?;
            if let Err(err) = self.check_cookie(&mut stream).await {
                tracing::warn!("rejecting portal connection from {}: {:#}", peer, err);
                continue;
            }
            stream.set_nodelay(true)?;
            configure_tcp_buffers(&stream, &self.config);
            tracing::debug!("accepted portal connection {} from {}", connections.len(), peer);
            connections.push(PortalConnection::from_tcp(stream, self.config.io_timeout)?);
        }
        Ok(connections)
    }
}
