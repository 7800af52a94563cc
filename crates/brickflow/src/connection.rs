//! Message-oriented channel over a duplex byte stream.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{DecodeSnafu, EncodeSnafu, IoSnafu, TransportError};
use crate::wire::{self, Message};

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Any stream a [`Connection`] can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A framed, length-delimited message channel.
///
/// `send` writes exactly one frame and `receive` yields exactly one complete
/// message, so callers never observe partial messages.
pub struct Connection {
    framed: Framed<Box<dyn Transport>, LengthDelimitedCodec>,
    label: String,
}

impl Connection {
    /// Wrap `stream`, labelling the connection as `label` in logs and errors.
    pub fn new<S: Transport>(stream: S, label: impl Into<String>) -> Self {
        Self::with_max_frame_bytes(stream, label, DEFAULT_MAX_FRAME_BYTES)
    }

    /// Like [`Connection::new`] with a custom frame size limit.
    pub fn with_max_frame_bytes<S: Transport>(
        stream: S,
        label: impl Into<String>,
        max_frame_bytes: usize,
    ) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_frame_bytes)
            .new_codec();

        let stream: Box<dyn Transport> = Box::new(stream);
        Self {
            framed: Framed::new(stream, codec),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Relabel the connection once its owner is known.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    /// Send one message.
    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let payload = wire::encode(message).context(EncodeSnafu { label: &self.label })?;
        self.framed
            .send(payload)
            .await
            .context(IoSnafu { label: &self.label })
    }

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the stream between frames. A
    /// stream that ends mid-frame is an error.
    pub async fn receive(&mut self) -> Result<Option<Message>, TransportError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Err(source)) => Err(TransportError::Io {
                label: self.label.clone(),
                source,
            }),
            Some(Ok(frame)) => wire::decode(&frame)
                .map(Some)
                .context(DecodeSnafu { label: &self.label }),
        }
    }

    /// Flush pending frames and shut down the write half.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::<Bytes>::close(&mut self.framed)
            .await
            .context(IoSnafu { label: &self.label })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::LogLevel;
    use tokio::io::AsyncWriteExt;

    fn pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Connection::new(a, "a"), Connection::new(b, "b"))
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (mut a, mut b) = pair();

        a.send(&Message::Register {
            runner_id: "R-1".to_string(),
        })
        .await
        .unwrap();
        a.send(&Message::InputAddress {
            address: "127.0.0.1:7000".to_string(),
        })
        .await
        .unwrap();

        assert_eq!(
            b.receive().await.unwrap(),
            Some(Message::Register {
                runner_id: "R-1".to_string()
            })
        );
        assert_eq!(
            b.receive().await.unwrap(),
            Some(Message::InputAddress {
                address: "127.0.0.1:7000".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_graceful_close_is_end_of_stream() {
        let (mut a, mut b) = pair();
        a.send(&Message::Shutdown).await.unwrap();
        a.close().await.unwrap();
        drop(a);

        assert_eq!(b.receive().await.unwrap(), Some(Message::Shutdown));
        assert_eq!(b.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (mut raw, other) = tokio::io::duplex(1024);
        let mut conn = Connection::new(other, "truncated");

        // Announce 100 bytes, deliver 3, then hang up.
        raw.write_all(&100u32.to_be_bytes()).await.unwrap();
        raw.write_all(b"{\"k").await.unwrap();
        drop(raw);

        let err = conn.receive().await.unwrap_err();
        assert!(matches!(err, TransportError::Io { .. }));
    }

    #[tokio::test]
    async fn test_oversize_frame_is_rejected() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut sender = Connection::new(a, "sender");
        let mut receiver = Connection::with_max_frame_bytes(b, "receiver", 32);

        sender
            .send(&Message::Log {
                level: LogLevel::Info,
                message: "x".repeat(128),
            })
            .await
            .unwrap();

        let err = receiver.receive().await.unwrap_err();
        assert!(err.to_string().contains("receiver"));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_decode_error() {
        let (mut raw, other) = tokio::io::duplex(1024);
        let mut conn = Connection::new(other, "garbage");

        raw.write_all(&4u32.to_be_bytes()).await.unwrap();
        raw.write_all(b"nope").await.unwrap();

        let err = conn.receive().await.unwrap_err();
        assert!(matches!(err, TransportError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_send_after_peer_dropped_fails() {
        let (mut a, b) = pair();
        drop(b);

        let err = a.send(&Message::Shutdown).await.unwrap_err();
        assert!(matches!(err, TransportError::Io { .. }));
    }
}
