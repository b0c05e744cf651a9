// Server side of the framing layer: requests in, responses out

use std::sync::Arc;

use tracing::debug;

use super::queue::MessageQueue;
use super::wrapper::MessageWrapper;
use super::{ByteStream, TlsUpgrade};
use crate::asn1::{tag, Asn1, TagClass};
use crate::error::{LdapError, ProtocolError, Result};
use crate::protocol::{LdapMessage, OperationRegistry, ToAsn1};

/// One decoded inbound PDU.
#[derive(Debug)]
pub enum Inbound {
    Request(LdapMessage),
    /// Valid BER that is not a valid request. `message_id` and `op_tag` are
    /// recovered when the envelope got that far, so the caller can answer.
    Invalid {
        message_id: Option<i32>,
        op_tag: Option<u32>,
        error: ProtocolError,
    },
}

/// Owns the accepted connection for its whole lifetime; never reconnects.
pub struct ServerQueue {
    stream: Box<dyn ByteStream>,
    queue: MessageQueue,
    registry: Arc<OperationRegistry>,
}

impl ServerQueue {
    pub fn new(stream: Box<dyn ByteStream>, registry: Arc<OperationRegistry>) -> Self {
        Self {
            stream,
            queue: MessageQueue::new(),
            registry,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.stream.is_secure()
    }

    pub fn set_wrapper(&mut self, wrapper: Box<dyn MessageWrapper>) {
        self.queue.set_wrapper(wrapper);
    }

    pub fn set_max_pdu_size(&mut self, size: usize) {
        self.queue.set_max_pdu_size(size);
    }

    pub async fn read(&mut self) -> Result<Inbound> {
        let value = self.queue.next_value(self.stream.as_mut()).await?;
        Ok(self.decode(&value))
    }

    fn decode(&self, value: &Asn1) -> Inbound {
        match LdapMessage::from_asn1_with(value, &self.registry) {
            Ok(message) if message.op.is_request() => Inbound::Request(message),
            Ok(message) => Inbound::Invalid {
                message_id: Some(message.message_id),
                op_tag: Some(message.op.tag()),
                error: ProtocolError::new(format!("{} is not a request", message.op.name())),
            },
            Err(error) => {
                debug!("undecodable request: {}", error);
                let message_id = value
                    .child(0)
                    .filter(|id| id.is_universal(tag::INTEGER))
                    .and_then(Asn1::as_integer)
                    .and_then(|id| i32::try_from(id).ok())
                    .filter(|id| *id >= 0);
                let op_tag = value
                    .child(1)
                    .filter(|op| op.class == TagClass::Application)
                    .map(|op| op.tag);
                Inbound::Invalid {
                    message_id,
                    op_tag,
                    error,
                }
            }
        }
    }

    pub async fn send(&mut self, message: &LdapMessage) -> Result<()> {
        let value = message.to_asn1()?;
        self.queue.send(self.stream.as_mut(), &value).await
    }

    /// Upgrade the connection after a StartTLS response has been written.
    pub async fn start_tls(&mut self, upgrade: &TlsUpgrade) -> Result<()> {
        if self.queue.buffered() > 0 {
            return Err(LdapError::Tls("data received before TLS handshake".into()));
        }
        self.stream.start_tls(upgrade).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.stream.close().await.map_err(LdapError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn1;
    use crate::protocol::{BindRequest, BindResponse, LdapResult, ProtocolOp};
    use crate::transport::mock::MockStream;

    type Written = Arc<std::sync::Mutex<Vec<Vec<u8>>>>;

    fn queue_for(chunks: Vec<Vec<u8>>) -> (ServerQueue, Written) {
        let stream = MockStream::new(chunks);
        let written = stream.written.clone();
        (ServerQueue::new(Box::new(stream), Arc::new(OperationRegistry::new())), written)
    }

    #[tokio::test]
    async fn test_reads_requests_and_writes_responses() {
        let request = LdapMessage::new(1, ProtocolOp::BindRequest(BindRequest::anonymous()));
        let (mut queue, written) = queue_for(vec![request.encode().unwrap()]);
        match queue.read().await.unwrap() {
            Inbound::Request(message) => assert_eq!(message, request),
            other => panic!("unexpected {:?}", other),
        }
        let response = LdapMessage::new(1, ProtocolOp::BindResponse(BindResponse::new(LdapResult::success())));
        queue.send(&response).await.unwrap();
        assert_eq!(written.lock().unwrap().clone(), vec![response.encode().unwrap()]);
        assert!(matches!(queue.read().await, Err(LdapError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_response_from_client_is_invalid() {
        let response = LdapMessage::new(4, ProtocolOp::DeleteResponse(LdapResult::success()));
        let (mut queue, _) = queue_for(vec![response.encode().unwrap()]);
        match queue.read().await.unwrap() {
            Inbound::Invalid { message_id, op_tag, .. } => {
                assert_eq!(message_id, Some(4));
                assert_eq!(op_tag, Some(11));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_grammar_error_keeps_message_id() {
        // SearchRequest [APPLICATION 3] with no children
        let bad = asn1::encode(&Asn1::sequence(vec![Asn1::integer(9), Asn1::sequence(vec![]).application(3)]));
        let (mut queue, _) = queue_for(vec![bad]);
        match queue.read().await.unwrap() {
            Inbound::Invalid { message_id, op_tag, error } => {
                assert_eq!(message_id, Some(9));
                assert_eq!(op_tag, Some(3));
                assert!(!error.message.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
