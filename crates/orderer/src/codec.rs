//! Node transport: frame channels, optionally pumped over a byte stream.
//!
//! On a stream every frame is a little-endian `u32` length followed by that
//! many bytes of JSON.

use std::io::{Error as IoError, ErrorKind};

use quire_proto::NodeFrame;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Largest frame accepted from a stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Writes one length-prefixed frame and flushes.
///
/// # Errors
///
/// Fails on I/O errors, on encoding errors and for frames above [`MAX_FRAME_LEN`].
pub async fn write_frame<W>(writer: &mut W, frame: &NodeFrame) -> std::io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	let buf = serde_json::to_vec(frame).map_err(|e| IoError::new(ErrorKind::InvalidData, e.to_string()))?;
	if buf.len() > MAX_FRAME_LEN {
		return Err(IoError::new(ErrorKind::InvalidData, "frame too large"));
	}
	writer.write_u32_le(buf.len() as u32).await?;
	writer.write_all(&buf).await?;
	writer.flush().await
}

/// Reads one length-prefixed frame.
///
/// # Errors
///
/// Returns [`ErrorKind::UnexpectedEof`] when the stream ends and
/// [`ErrorKind::InvalidData`] for oversized or malformed frames.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<NodeFrame>
where
	R: AsyncRead + Unpin,
{
	let len = reader.read_u32_le().await? as usize;
	if len > MAX_FRAME_LEN {
		return Err(IoError::new(ErrorKind::InvalidData, format!("frame of {len} bytes exceeds limit")));
	}
	let mut buf = vec![0u8; len];
	reader.read_exact(&mut buf).await?;
	serde_json::from_slice(&buf).map_err(|e| IoError::new(ErrorKind::InvalidData, e.to_string()))
}

/// One end of a node-to-node link.
///
/// The link is closed once `inbound` yields `None`.
#[derive(Debug)]
pub struct NodeTransport {
	/// Frames to the peer.
	pub outbound: mpsc::UnboundedSender<NodeFrame>,
	/// Frames from the peer.
	pub inbound: mpsc::UnboundedReceiver<NodeFrame>,
}

impl NodeTransport {
	/// Creates two in-memory ends wired to each other.
	pub fn pair() -> (Self, Self) {
		let (a_tx, a_rx) = mpsc::unbounded_channel();
		let (b_tx, b_rx) = mpsc::unbounded_channel();
		(
			Self {
				outbound: a_tx,
				inbound: b_rx,
			},
			Self {
				outbound: b_tx,
				inbound: a_rx,
			},
		)
	}

	/// Pumps frames over `stream` with one reader and one writer task.
	///
	/// The reader ends on EOF or a bad frame, closing `inbound`. The writer
	/// shuts the stream down once every `outbound` sender is dropped.
	pub fn from_stream<S>(stream: S) -> Self
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (mut reader, mut writer) = tokio::io::split(stream);
		let (in_tx, in_rx) = mpsc::unbounded_channel();
		let (out_tx, mut out_rx) = mpsc::unbounded_channel::<NodeFrame>();

		tokio::spawn(async move {
			loop {
				match read_frame(&mut reader).await {
					Ok(frame) => {
						if in_tx.send(frame).is_err() {
							break;
						}
					}
					Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
					Err(e) => {
						tracing::warn!(error = %e, "node transport read failed");
						break;
					}
				}
			}
			tracing::debug!("node transport reader closed");
		});

		tokio::spawn(async move {
			while let Some(frame) = out_rx.recv().await {
				if let Err(e) = write_frame(&mut writer, &frame).await {
					tracing::warn!(error = %e, "node transport write failed");
					return;
				}
			}
			if let Err(e) = writer.shutdown().await {
				tracing::debug!(error = %e, "node transport shutdown failed");
			}
		});

		Self {
			outbound: out_tx,
			inbound: in_rx,
		}
	}
}

#[cfg(test)]
mod tests {
	use quire_proto::{ConnectionId, NodeMessage};

	use super::*;

	#[tokio::test]
	async fn frames_cross_a_duplex_stream() {
		let (a, b) = tokio::io::duplex(1024);
		let mut left = NodeTransport::from_stream(a);
		let mut right = NodeTransport::from_stream(b);

		left.outbound
			.send(NodeFrame {
				cid: Some(ConnectionId(3)),
				message: NodeMessage::Disconnect,
			})
			.unwrap();
		let frame = right.inbound.recv().await.unwrap();
		assert_eq!(frame.cid, Some(ConnectionId(3)));

		drop(right.outbound);
		assert!(left.inbound.recv().await.is_none());
	}

	#[tokio::test]
	async fn oversized_length_prefix_is_rejected() {
		let (mut a, mut b) = tokio::io::duplex(64);
		a.write_u32_le(u32::MAX).await.unwrap();
		let err = read_frame(&mut b).await.unwrap_err();
		assert_eq!(err.kind(), ErrorKind::InvalidData);
	}
}
