//! # Encrypted Frame Transport
//!
//! Glues the frame codec, the channel's current cryptor and the message registry
//! into a typed reader and writer over any async byte stream.
//!
//! The writer serializes concurrent senders through an async mutex so frames
//! never interleave. The reader is owned by exactly one task.

use crate::core::codec::FrameCodec;
use crate::core::message::{Envelope, Message};
use crate::core::registry::MessageRegistry;
use crate::error::{ProtocolError, Result};
use crate::utils::crypto::CryptorSlot;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::trace;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reading half: frames → decrypted bytes → envelopes.
pub struct FrameReader {
    inner: FramedRead<BoxedReader, FrameCodec>,
    registry: Arc<MessageRegistry>,
    cryptor: Arc<CryptorSlot>,
}

impl FrameReader {
    pub fn new(
        reader: BoxedReader,
        codec: FrameCodec,
        registry: Arc<MessageRegistry>,
        cryptor: Arc<CryptorSlot>,
    ) -> Self {
        Self {
            inner: FramedRead::new(reader, codec),
            registry,
            cryptor,
        }
    }

    /// Next raw ciphertext frame.
    ///
    /// # Errors
    /// `ConnectionClosed` on a clean EOF between frames, `TransportError` on EOF
    /// inside a frame, `OversizedPacket`/`InvalidHeader` on a bad length prefix.
    pub async fn next_frame(&mut self) -> Result<Bytes> {
        match self.inner.next().await {
            Some(frame) => frame,
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Read, decrypt and decode the next message.
    ///
    /// Returns the envelope and the encrypted frame length.
    pub async fn next_message(&mut self) -> Result<(Envelope, usize)> {
        let frame = self.next_frame().await?;
        let plain = self.cryptor.current().decode(&frame)?;
        let envelope = self.registry.deserialize(&plain)?;
        trace!(
            message_type = envelope.name(),
            frame_len = frame.len(),
            "Frame received"
        );
        Ok((envelope, frame.len()))
    }

    /// Read the next message and require it to be an `M`.
    ///
    /// # Errors
    /// `UnexpectedMessage` when a different registered type arrives.
    pub async fn expect<M: Message + Clone>(&mut self) -> Result<M> {
        let (envelope, _) = self.next_message().await?;
        envelope
            .into_message::<M>()
            .ok_or(ProtocolError::UnexpectedMessage)
    }
}

/// Writing half: messages → encrypted frames, one writer at a time.
///
/// Once shut down or released the stream half is dropped and every later
/// send fails with `ConnectionClosed`.
pub struct FrameWriter {
    inner: Mutex<Option<FramedWrite<BoxedWriter, FrameCodec>>>,
    registry: Arc<MessageRegistry>,
    cryptor: Arc<CryptorSlot>,
}

impl FrameWriter {
    pub fn new(
        writer: BoxedWriter,
        codec: FrameCodec,
        registry: Arc<MessageRegistry>,
        cryptor: Arc<CryptorSlot>,
    ) -> Self {
        Self {
            inner: Mutex::new(Some(FramedWrite::new(writer, codec))),
            registry,
            cryptor,
        }
    }

    /// Serialize, encrypt and write one message; returns the frame body length.
    ///
    /// # Errors
    /// `OversizedPacket` when the encrypted body exceeds the frame limit; nothing
    /// is written in that case.
    pub async fn send<M: Message>(&self, message: &M) -> Result<usize> {
        let plain = self.registry.serialize(message)?;
        let sealed = self.cryptor.current().encode(&plain)?;
        let len = sealed.len();

        let mut guard = self.inner.lock().await;
        let framed = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        framed.send(Bytes::from(sealed)).await?;
        trace!(message_type = M::name(), frame_len = len, "Frame sent");
        Ok(len)
    }

    /// Flush and shut down the write side of the stream, then drop it.
    pub async fn shutdown(&self) -> Result<()> {
        let framed = self.inner.lock().await.take();
        match framed {
            Some(mut framed) => SinkExt::<Bytes>::close(&mut framed).await,
            None => Ok(()),
        }
    }

    /// Drop the write half without flushing, unless a send holds it.
    ///
    /// Returns `false` when the writer is busy; it is still open then.
    pub fn release(&self) -> bool {
        match self.inner.try_lock() {
            Ok(mut guard) => {
                guard.take();
                true
            }
            Err(_) => false,
        }
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }
}

/// Split a bidirectional stream into a frame reader and writer sharing one
/// cryptor slot.
pub fn split<S>(
    stream: S,
    max_frame_size: usize,
    registry: Arc<MessageRegistry>,
    cryptor: Arc<CryptorSlot>,
) -> (FrameReader, FrameWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let codec = FrameCodec::new(max_frame_size);
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = FrameReader::new(
        Box::new(read_half),
        codec,
        Arc::clone(&registry),
        Arc::clone(&cryptor),
    );
    let writer = FrameWriter::new(Box::new(write_half), codec, registry, cryptor);
    (reader, writer)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::utils::crypto::AesCryptor;
    use serde::{Deserialize, Serialize};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        body: String,
    }
    impl Message for Note {}

    fn registry() -> Arc<MessageRegistry> {
        Arc::new(MessageRegistry::builder().register::<Note>().unwrap().build())
    }

    #[tokio::test]
    async fn test_frames_roundtrip_in_order() {
        let (a, b) = tokio::io::duplex(64);
        let registry = registry();
        let (_, writer) = split(a, 1024, Arc::clone(&registry), Arc::new(CryptorSlot::new()));
        let (mut reader, _) = split(b, 1024, registry, Arc::new(CryptorSlot::new()));

        tokio::spawn(async move {
            for i in 0..20 {
                writer
                    .send(&Note {
                        body: format!("note {i}"),
                    })
                    .await
                    .unwrap();
            }
        });

        for i in 0..20 {
            let note: Note = reader.expect().await.unwrap();
            assert_eq!(note.body, format!("note {i}"));
        }
    }

    #[tokio::test]
    async fn test_encrypted_frames_need_matching_cryptor() {
        let (a, b) = tokio::io::duplex(4096);
        let registry = registry();
        let key = AesCryptor::generate().unwrap();

        let send_slot = Arc::new(CryptorSlot::new());
        send_slot.advance(Arc::new(key.clone())).unwrap();
        let recv_slot = Arc::new(CryptorSlot::new());
        recv_slot.advance(Arc::new(key)).unwrap();

        let (_, writer) = split(a, 1024, Arc::clone(&registry), send_slot);
        let (mut reader, _) = split(b, 1024, registry, recv_slot);

        writer
            .send(&Note {
                body: "sealed".into(),
            })
            .await
            .unwrap();
        let note: Note = reader.expect().await.unwrap();
        assert_eq!(note.body, "sealed");
    }

    #[tokio::test]
    async fn test_clean_eof_is_connection_closed() {
        let (a, b) = tokio::io::duplex(64);
        let (mut reader, _) = split(b, 1024, registry(), Arc::new(CryptorSlot::new()));
        drop(a);
        assert!(matches!(
            reader.next_message().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_transport_error() {
        let (mut a, b) = tokio::io::duplex(64);
        let (mut reader, _) = split(b, 1024, registry(), Arc::new(CryptorSlot::new()));
        a.write_all(&10i32.to_le_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        assert!(matches!(
            reader.next_message().await,
            Err(ProtocolError::TransportError(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_releases_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        let (reader, writer) = split(a, 1024, registry(), Arc::new(CryptorSlot::new()));
        drop(reader);

        writer.shutdown().await.unwrap();
        assert!(!writer.is_open().await);
        assert!(matches!(
            writer.send(&Note { body: "late".into() }).await,
            Err(ProtocolError::ConnectionClosed)
        ));

        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_drops_write_half() {
        let (a, mut b) = tokio::io::duplex(64);
        let (reader, writer) = split(a, 1024, registry(), Arc::new(CryptorSlot::new()));
        drop(reader);

        assert!(writer.release());
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_oversized_send_writes_nothing() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let registry = registry();
        let (_, writer) = split(a, 1024, Arc::clone(&registry), Arc::new(CryptorSlot::new()));
        let (mut reader, _) = split(b, 1024, registry, Arc::new(CryptorSlot::new()));

        let big = Note {
            body: "x".repeat(4096),
        };
        assert!(matches!(
            writer.send(&big).await,
            Err(ProtocolError::OversizedPacket(_))
        ));
        writer.send(&Note { body: "ok".into() }).await.unwrap();
        let note: Note = reader.expect().await.unwrap();
        assert_eq!(note.body, "ok");
    }
}
