//! Parallel portal transfers for replmover.
//!
//! A transfer moves one object between a local file and a remote peer over `N` independent TCP
//! connections ("portals"), each covering a disjoint byte range:
//!
//! - [`protocol`] frames every payload with a fixed [`protocol::TransferHeader`]
//! - [`crypt`] seals individual chunks when the session negotiated encryption
//! - [`portal`] opens and accepts the connections, authenticated by a per-transfer cookie
//! - [`engine::TransferEngine`] runs puts and gets on the client side, keeps the restart checkpoint
//!   and resumes interrupted transfers
//! - [`server::PortalServer`] is the serving counterpart that assigns segments
//!
//! # Failures
//!
//! Every worker runs as a task of one transfer session. The first failing worker cancels the others;
//! all sockets and files are closed before the caller sees the error. The returned [`Error`] carries
//! the first failure plus the bytes moved until then, and [`Error::kind`] gives its class.
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! let server = remote::PortalServer::new(common::TransferConfig::default(), None)?;
//! let listener = server.listen("127.0.0.1".parse()?).await?;
//! let engine = remote::TransferEngine::new(common::TransferConfig::default(), None)?;
//! let request = remote::TransferRequest {
//!     portal: listener.portal_addr()?,
//!     local_path: "/tmp/data.bin".into(),
//!     obj_path: "/zone/home/alice/data.bin".to_string(),
//!     size: 1 << 30,
//!     thread_count: 4,
//!     restart_file: Some("/tmp/data.bin.restart".into()),
//! };
//! let (sent, received) = tokio::join!(
//!     engine.put(&request),
//!     server.serve_put(&listener, "/srv/vault/data.bin".as_ref(), request.size, 4),
//! );
//! println!("{}", sent?);
//! received?;
//! # Ok(())
//! # }
//! ```

pub mod crypt;
pub mod engine;
pub mod error;
pub mod port_ranges;
pub mod portal;
pub mod protocol;
pub mod server;
mod session;
pub mod streams;

pub use crypt::{EncryptionContext, Negotiation};
pub use engine::{ResumePlan, TransferEngine, TransferRequest};
pub use error::{Error, ErrorKind, TransferError, TransferSummary};
pub use portal::{PortalAddr, PortalListener};
pub use server::PortalServer;
pub use session::{ByteRange, split_segments};
