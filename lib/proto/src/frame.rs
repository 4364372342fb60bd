//! Length-prefixed framing.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Refuse frames larger than this. A graph payload is a few kilobytes;
/// anything near this size is a corrupt or hostile length prefix.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("i/o error on connection")]
	Io(#[from] std::io::Error),

	#[error("could not encode or decode payload")]
	Codec(#[from] serde_json::Error),

	#[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
	FrameTooLarge { len: usize },

	#[error("expected a completion notice of {expected} bytes, got {got}")]
	ShortNotice { expected: usize, got: usize },

	#[error("unknown completion notice role {0}")]
	BadNoticeRole(u8),

	#[error("peer closed the connection instead of acknowledging")]
	MissingAck,
}

/// Write `payload` prefixed by its length.
pub async fn send_frame(
	w: &mut (impl AsyncWrite + Unpin),
	payload: &[u8],
) -> Result<(), ProtocolError> {
	let len = u32::try_from(payload.len()).map_err(|_overflow| ProtocolError::FrameTooLarge {
		len: payload.len(),
	})?;

	w.write_all(&len.to_be_bytes()).await?;
	w.write_all(payload).await?;
	w.flush().await?;
	return Ok(());
}

/// Read one length-prefixed frame.
///
/// Returns `None` on a clean end-of-stream at a frame boundary; an EOF
/// in the middle of a frame is an error.
pub async fn recv_frame(
	r: &mut (impl AsyncRead + Unpin),
) -> Result<Option<Vec<u8>>, ProtocolError> {
	let mut len_buf = [0u8; 4];
	match r.read_exact(&mut len_buf).await {
		Ok(_) => {}
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(e.into()),
	}

	let len = u32::from_be_bytes(len_buf) as usize;
	if len > MAX_FRAME_LEN {
		return Err(ProtocolError::FrameTooLarge { len });
	}

	let mut buf = vec![0u8; len];
	r.read_exact(&mut buf).await?;
	return Ok(Some(buf));
}

/// Serialize `msg` and send it as one frame.
pub async fn send_message<T: Serialize>(
	w: &mut (impl AsyncWrite + Unpin),
	msg: &T,
) -> Result<(), ProtocolError> {
	let payload = serde_json::to_vec(msg)?;
	send_frame(w, &payload).await
}

/// Receive one frame and decode it. `None` on clean end-of-stream.
pub async fn recv_message<T: DeserializeOwned>(
	r: &mut (impl AsyncRead + Unpin),
) -> Result<Option<T>, ProtocolError> {
	let Some(payload) = recv_frame(r).await? else {
		return Ok(None);
	};
	return Ok(Some(serde_json::from_slice(&payload)?));
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn frames_round_trip() {
		let (mut a, mut b) = tokio::io::duplex(1024);

		send_frame(&mut a, b"hello").await.unwrap();
		send_frame(&mut a, b"").await.unwrap();
		drop(a);

		assert_eq!(recv_frame(&mut b).await.unwrap().unwrap(), b"hello");
		assert_eq!(recv_frame(&mut b).await.unwrap().unwrap(), b"");
		assert!(recv_frame(&mut b).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn truncated_frame_is_an_error() {
		let (mut a, mut b) = tokio::io::duplex(1024);

		// A length prefix promising more bytes than ever arrive.
		tokio::io::AsyncWriteExt::write_all(&mut a, &100u32.to_be_bytes())
			.await
			.unwrap();
		tokio::io::AsyncWriteExt::write_all(&mut a, b"abc").await.unwrap();
		drop(a);

		assert!(recv_frame(&mut b).await.is_err());
	}

	#[tokio::test]
	async fn oversized_length_is_rejected() {
		let (mut a, mut b) = tokio::io::duplex(1024);

		let bad = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
		tokio::io::AsyncWriteExt::write_all(&mut a, &bad).await.unwrap();

		assert!(matches!(
			recv_frame(&mut b).await,
			Err(ProtocolError::FrameTooLarge { .. })
		));
	}
}
