//! Node-to-node links over Unix domain sockets.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use quire_proto::NodeRecord;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::codec::NodeTransport;
use crate::config::OrdererConfig;
use crate::node::LocalNode;
use crate::remote::RemoteNode;

/// Accepts peer nodes on `socket_path` until `shutdown` fires, then closes
/// every orderer hosted by `node`.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound or a stale socket file
/// cannot be removed.
pub async fn serve(
	socket_path: impl AsRef<Path>,
	node: Arc<LocalNode>,
	shutdown: CancellationToken,
) -> std::io::Result<()> {
	let path = socket_path.as_ref();
	if path.exists() {
		tokio::fs::remove_file(path).await?;
	}

	let listener = UnixListener::bind(path)?;
	tracing::info!(node = node.id(), path = %path.display(), "node listening");

	loop {
		tokio::select! {
			_ = shutdown.cancelled() => {
				tracing::info!(node = node.id(), "node shutting down");
				break;
			}
			res = listener.accept() => match res {
				Ok((stream, _addr)) => {
					node.serve(NodeTransport::from_stream(stream), shutdown.child_token());
				}
				Err(e) => {
					tracing::error!(error = %e, "failed to accept peer");
				}
			}
		}
	}

	node.close().await;
	Ok(())
}

/// Connects to the node described by `record`, whose address is a socket path.
///
/// An expired record yields an invalid node without touching the socket.
///
/// # Errors
///
/// Returns an error if the socket cannot be reached.
pub async fn connect(record: &NodeRecord, config: &OrdererConfig) -> std::io::Result<RemoteNode> {
	let now = Utc::now();
	if record.is_expired(now) {
		let (transport, _) = NodeTransport::pair();
		return Ok(RemoteNode::from_record(record, transport, now, config));
	}
	let stream = UnixStream::connect(&record.address).await?;
	Ok(RemoteNode::from_record(record, NodeTransport::from_stream(stream), now, config))
}
