// PDU framing over a ByteStream

use std::io;

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use super::wrapper::{MessageWrapper, WrapError};
use super::ByteStream;
use crate::asn1::{self, Asn1};
use crate::error::{DecodeError, LdapError, Result};

/// Upper bound on one buffered PDU unless configured otherwise.
pub const DEFAULT_MAX_PDU_SIZE: usize = 16 * 1024 * 1024;

/// Turns a stream of bytes into complete top-level BER values.
///
/// `raw` holds bytes as read from the wire; `plain` holds unwrapped BER
/// waiting to be decoded. Without a wrapper everything goes straight to
/// `plain`.
pub struct MessageQueue {
    raw: BytesMut,
    plain: BytesMut,
    wrapper: Option<Box<dyn MessageWrapper>>,
    max_pdu_size: usize,
    /// A failed peek after a decoded PDU, reported by the next read.
    pending_error: Option<LdapError>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            raw: BytesMut::with_capacity(4096),
            plain: BytesMut::with_capacity(4096),
            wrapper: None,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            pending_error: None,
        }
    }

    /// PDUs that would need more than `size` buffered bytes are malformed.
    pub fn set_max_pdu_size(&mut self, size: usize) {
        self.max_pdu_size = size;
    }

    pub fn set_wrapper(&mut self, wrapper: Box<dyn MessageWrapper>) {
        self.wrapper = Some(wrapper);
    }

    pub fn clear_wrapper(&mut self) {
        self.wrapper = None;
    }

    pub fn has_wrapper(&self) -> bool {
        self.wrapper.is_some()
    }

    /// Drop any buffered bytes, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.raw.clear();
        self.plain.clear();
        self.pending_error = None;
    }

    pub fn buffered(&self) -> usize {
        self.raw.len() + self.plain.len()
    }

    /// Read until one complete value can be decoded.
    pub async fn next_value(&mut self, stream: &mut dyn ByteStream) -> Result<Asn1> {
        loop {
            if !self.plain.is_empty() {
                match asn1::decode(&self.plain) {
                    Ok((mut value, consumed)) => {
                        value.take_trailing_data();
                        self.plain.advance(consumed);
                        if self.plain.is_empty() && self.raw.is_empty() {
                            if let Err(e) = self.peek(stream).await {
                                debug!("peek after PDU failed: {}", e);
                                self.pending_error = Some(e);
                            }
                        }
                        return Ok(value);
                    }
                    Err(DecodeError::PartialData) => {
                        trace!("partial PDU, {} bytes buffered", self.plain.len());
                    }
                    Err(e) => {
                        debug!("malformed PDU: {}", e);
                        return Err(e.into());
                    }
                }
            }

            if let Some(e) = self.pending_error.take() {
                return Err(e);
            }
            if self.buffered() > self.max_pdu_size {
                return Err(DecodeError::malformed(format!(
                    "PDU exceeds {} bytes",
                    self.max_pdu_size
                ))
                .into());
            }

            let chunk = stream.read(true).await.map_err(read_error)?;
            if chunk.is_empty() {
                return Err(LdapError::ConnectionClosed);
            }
            self.ingest(&chunk)?;
        }
    }

    /// Encode, wrap and write one value.
    pub async fn send(&mut self, stream: &mut dyn ByteStream, value: &Asn1) -> Result<()> {
        self.send_bytes(stream, &asn1::encode(value)).await
    }

    pub async fn send_bytes(&mut self, stream: &mut dyn ByteStream, plain: &[u8]) -> Result<()> {
        let wire = match self.wrapper.as_mut() {
            Some(w) => w.wrap(plain).map_err(|e| LdapError::Wrap(e.to_string()))?,
            None => plain.to_vec(),
        };
        stream.write(&wire).await.map_err(read_error)
    }

    /// Pull whatever is already available without waiting.
    async fn peek(&mut self, stream: &mut dyn ByteStream) -> Result<()> {
        let chunk = stream.read(false).await.map_err(read_error)?;
        if !chunk.is_empty() {
            self.ingest(&chunk)?;
        }
        Ok(())
    }

    fn ingest(&mut self, chunk: &[u8]) -> Result<()> {
        let Some(wrapper) = self.wrapper.as_mut() else {
            self.plain.extend_from_slice(chunk);
            return Ok(());
        };
        self.raw.extend_from_slice(chunk);
        while !self.raw.is_empty() {
            match wrapper.unwrap(&self.raw) {
                Ok(unwrapped) => {
                    if unwrapped.consumed == 0 {
                        break;
                    }
                    self.raw.advance(unwrapped.consumed);
                    self.plain.extend_from_slice(&unwrapped.data);
                }
                Err(WrapError::Partial) => break,
                Err(WrapError::Failed(message)) => return Err(LdapError::Wrap(message)),
            }
        }
        Ok(())
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn read_error(e: io::Error) -> LdapError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => LdapError::Timeout,
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => LdapError::ConnectionClosed,
        _ => LdapError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockStream;
    use crate::transport::wrapper::tests::XorLayer;
    use crate::transport::wrapper::SaslBufferWrapper;

    fn pdu(id: i64) -> Vec<u8> {
        asn1::encode(&Asn1::sequence(vec![Asn1::integer(id), Asn1::null().application(2)]))
    }

    #[tokio::test]
    async fn test_reassembles_fragmented_pdu() {
        let bytes = pdu(7);
        let mut stream = MockStream::new(bytes.iter().map(|b| vec![*b]));
        let mut queue = MessageQueue::new();
        let value = queue.next_value(&mut stream).await.unwrap();
        assert_eq!(value.child(0).and_then(Asn1::as_integer), Some(7));
        assert_eq!(queue.buffered(), 0);
    }

    #[tokio::test]
    async fn test_keeps_trailing_bytes_for_next_pdu() {
        let mut chunk = pdu(1);
        chunk.extend_from_slice(&pdu(2));
        let second = pdu(3);
        chunk.extend_from_slice(&second[..3]);
        let mut stream = MockStream::new(vec![chunk, second[3..].to_vec()]);
        let mut queue = MessageQueue::new();
        for expected in 1..=3 {
            let value = queue.next_value(&mut stream).await.unwrap();
            assert_eq!(value.child(0).and_then(Asn1::as_integer), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_peek_pulls_available_bytes() {
        let mut stream = MockStream::new(vec![pdu(1), pdu(2)]);
        stream.eager_peek = true;
        let mut queue = MessageQueue::new();
        queue.next_value(&mut stream).await.unwrap();
        assert_eq!(queue.buffered(), pdu(2).len());
    }

    #[tokio::test]
    async fn test_malformed_is_fatal() {
        let mut stream = MockStream::new(vec![vec![0x30, 0xFF, 0x00]]);
        let mut queue = MessageQueue::new();
        let err = queue.next_value(&mut stream).await.unwrap_err();
        assert!(matches!(err, LdapError::Decode(DecodeError::Malformed(_))));
        assert!(err.is_connection_fatal());

        let mut stream = MockStream::new(vec![vec![0x30, 0x80, 0x00, 0x00]]);
        let err = MessageQueue::new().next_value(&mut stream).await.unwrap_err();
        assert!(matches!(err, LdapError::Decode(DecodeError::IndefiniteLength)));
    }

    #[tokio::test]
    async fn test_oversized_pdu_is_malformed() {
        let bytes = asn1::encode(&Asn1::octet_string(vec![0u8; 4096]));
        let chunks: Vec<Vec<u8>> = bytes.chunks(512).map(<[u8]>::to_vec).collect();
        let mut queue = MessageQueue::new();
        queue.set_max_pdu_size(1024);
        let err = queue.next_value(&mut MockStream::new(chunks.clone())).await.unwrap_err();
        assert!(matches!(err, LdapError::Decode(DecodeError::Malformed(_))));

        let mut queue = MessageQueue::new();
        queue.set_max_pdu_size(8192);
        assert!(queue.next_value(&mut MockStream::new(chunks)).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_peek_keeps_decoded_pdu() {
        let mut stream = MockStream::new(vec![pdu(1)]);
        stream.push_error(io::ErrorKind::PermissionDenied);
        stream.eager_peek = true;
        let mut queue = MessageQueue::new();
        let value = queue.next_value(&mut stream).await.unwrap();
        assert_eq!(value.child(0).and_then(Asn1::as_integer), Some(1));
        let err = queue.next_value(&mut stream).await.unwrap_err();
        assert!(matches!(err, LdapError::Io(_)));
    }

    #[tokio::test]
    async fn test_eof_and_timeout() {
        let bytes = pdu(1);
        let mut stream = MockStream::new(vec![bytes[..2].to_vec()]);
        let err = MessageQueue::new().next_value(&mut stream).await.unwrap_err();
        assert!(matches!(err, LdapError::ConnectionClosed));

        let mut stream = MockStream::new(vec![]);
        stream.push_error(io::ErrorKind::TimedOut);
        let err = MessageQueue::new().next_value(&mut stream).await.unwrap_err();
        assert!(matches!(err, LdapError::Timeout));
    }

    #[tokio::test]
    async fn test_wrapped_frames_split_across_reads() {
        let mut writer = SaslBufferWrapper::new(XorLayer(0x33));
        let mut wire = writer.wrap(&pdu(1)).unwrap();
        wire.extend_from_slice(&writer.wrap(&pdu(2)).unwrap());
        let (a, b) = wire.split_at(5);
        let mut stream = MockStream::new(vec![a.to_vec(), b.to_vec()]);

        let mut queue = MessageQueue::new();
        queue.set_wrapper(Box::new(SaslBufferWrapper::new(XorLayer(0x33))));
        for expected in 1..=2 {
            let value = queue.next_value(&mut stream).await.unwrap();
            assert_eq!(value.child(0).and_then(Asn1::as_integer), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_send_wraps_output() {
        let mut stream = MockStream::default();
        let mut queue = MessageQueue::new();
        queue.set_wrapper(Box::new(SaslBufferWrapper::new(XorLayer(0))));
        queue.send(&mut stream, &Asn1::null()).await.unwrap();
        assert_eq!(stream.writes(), vec![vec![0, 0, 0, 2, 0x05, 0x00]]);
    }
}
