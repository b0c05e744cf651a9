// Client side of the framing layer: lazy connection, responses by message ID

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::queue::MessageQueue;
use super::wrapper::MessageWrapper;
use super::{ByteStream, TlsUpgrade};
use crate::error::{LdapError, Result};
use crate::protocol::extended::NOTICE_OF_DISCONNECTION_OID;
use crate::protocol::{LdapMessage, OperationRegistry, ProtocolOp, ToAsn1};
use crate::result_code::ResultCode;

/// Opens a new connection when the queue needs one.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ByteStream>>;

    /// How to secure the most recent connection with StartTLS.
    fn tls_upgrade(&self) -> Option<TlsUpgrade> {
        None
    }
}

enum ConnectionState {
    Disconnected,
    Connected(Box<dyn ByteStream>),
}

/// Messages that arrived while the caller was waiting for a different ID
/// are held per ID in arrival order; `arrival` keeps the overall order for
/// [`ClientQueue::receive`].
pub struct ClientQueue {
    connector: Arc<dyn Connector>,
    state: ConnectionState,
    queue: MessageQueue,
    registry: Arc<OperationRegistry>,
    held: HashMap<i32, VecDeque<LdapMessage>>,
    arrival: VecDeque<i32>,
    reconnect: bool,
}

impl ClientQueue {
    pub fn new(connector: Arc<dyn Connector>, registry: Arc<OperationRegistry>) -> Self {
        Self {
            connector,
            state: ConnectionState::Disconnected,
            queue: MessageQueue::new(),
            registry,
            held: HashMap::new(),
            arrival: VecDeque::new(),
            reconnect: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected(_)) && !self.reconnect
    }

    pub fn is_secure(&self) -> bool {
        match &self.state {
            ConnectionState::Connected(stream) => stream.is_secure(),
            ConnectionState::Disconnected => false,
        }
    }

    /// The next use opens a fresh connection.
    pub fn mark_reconnect(&mut self) {
        self.reconnect = true;
    }

    pub fn needs_reconnect(&self) -> bool {
        self.reconnect
    }

    pub fn set_wrapper(&mut self, wrapper: Box<dyn MessageWrapper>) {
        self.queue.set_wrapper(wrapper);
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.reconnect {
            self.disconnect().await;
        }
        if let ConnectionState::Disconnected = self.state {
            debug!("opening connection");
            let stream = self.connector.connect().await?;
            self.state = ConnectionState::Connected(stream);
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let ConnectionState::Connected(mut stream) =
            std::mem::replace(&mut self.state, ConnectionState::Disconnected)
        {
            if let Err(e) = stream.close().await {
                debug!("error closing connection: {}", e);
            }
        }
        self.queue.reset();
        self.queue.clear_wrapper();
        self.held.clear();
        self.arrival.clear();
        self.reconnect = false;
    }

    pub async fn send(&mut self, message: &LdapMessage) -> Result<()> {
        self.ensure_connected().await?;
        let value = message.to_asn1()?;
        let ConnectionState::Connected(stream) = &mut self.state else {
            return Err(LdapError::ConnectionClosed);
        };
        let result = self.queue.send(stream.as_mut(), &value).await;
        self.after(result)
    }

    /// The next message in arrival order.
    pub async fn receive(&mut self) -> Result<LdapMessage> {
        if let Some(id) = self.arrival.pop_front() {
            if let Some(message) = self.held.get_mut(&id).and_then(VecDeque::pop_front) {
                self.prune(id);
                return Ok(message);
            }
        }
        let message = self.read_one().await?;
        self.check_unsolicited(message)
    }

    /// The next message carrying `message_id`, holding on to any others.
    pub async fn receive_id(&mut self, message_id: i32) -> Result<LdapMessage> {
        if let Some(message) = self.held.get_mut(&message_id).and_then(VecDeque::pop_front) {
            if let Some(pos) = self.arrival.iter().position(|id| *id == message_id) {
                self.arrival.remove(pos);
            }
            self.prune(message_id);
            return Ok(message);
        }
        loop {
            let message = self.read_one().await?;
            if message.message_id == message_id {
                return Ok(message);
            }
            let message = self.check_unsolicited(message)?;
            debug!("holding message {} while waiting for {}", message.message_id, message_id);
            self.arrival.push_back(message.message_id);
            self.held.entry(message.message_id).or_default().push_back(message);
        }
    }

    /// Drop everything held for an ID, e.g. after abandoning it.
    pub fn discard(&mut self, message_id: i32) {
        self.held.remove(&message_id);
        self.arrival.retain(|id| *id != message_id);
    }

    pub async fn start_tls(&mut self, upgrade: &TlsUpgrade) -> Result<()> {
        self.ensure_connected().await?;
        if self.queue.buffered() > 0 {
            return Err(LdapError::Tls("data received before TLS handshake".into()));
        }
        let ConnectionState::Connected(stream) = &mut self.state else {
            return Err(LdapError::ConnectionClosed);
        };
        let result = stream.start_tls(upgrade).await;
        self.after(result)
    }

    pub async fn close(&mut self) {
        self.disconnect().await;
    }

    async fn read_one(&mut self) -> Result<LdapMessage> {
        self.ensure_connected().await?;
        let ConnectionState::Connected(stream) = &mut self.state else {
            return Err(LdapError::ConnectionClosed);
        };
        let value = self.queue.next_value(stream.as_mut()).await;
        let value = self.after(value)?;
        let message = LdapMessage::from_asn1_with(&value, &self.registry)?;
        if message.op.is_request() {
            return Err(crate::error::ProtocolError::new(format!(
                "server sent a request ({})",
                message.op.name()
            ))
            .into());
        }
        Ok(message)
    }

    /// Message ID 0 is reserved for unsolicited notifications.
    fn check_unsolicited(&mut self, message: LdapMessage) -> Result<LdapMessage> {
        if message.message_id != 0 {
            return Ok(message);
        }
        let (oid, code, text) = match &message.op {
            ProtocolOp::ExtendedResponse(r) => (
                r.name.clone().unwrap_or_default(),
                r.result.code,
                r.result.diagnostic_message.clone(),
            ),
            other => (
                String::new(),
                other.result().map_or(ResultCode::PROTOCOL_ERROR, |r| r.code),
                format!("unsolicited {}", other.name()),
            ),
        };
        if oid == NOTICE_OF_DISCONNECTION_OID {
            warn!("server sent notice of disconnection: {} ({})", text, code);
            self.mark_reconnect();
        }
        Err(LdapError::Unsolicited {
            oid,
            code,
            message: text,
        })
    }

    fn prune(&mut self, message_id: i32) {
        if self.held.get(&message_id).is_some_and(VecDeque::is_empty) {
            self.held.remove(&message_id);
        }
    }

    fn after<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                debug!("connection failed: {}", e);
                self.mark_reconnect();
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::extended::notice_of_disconnection;
    use crate::protocol::{LdapResult, SearchResultEntry};
    use crate::transport::mock::MockStream;
    use std::sync::Mutex;

    /// Hands out scripted streams, one per connect.
    struct ScriptedConnector {
        streams: Mutex<VecDeque<MockStream>>,
        connects: Mutex<usize>,
    }

    impl ScriptedConnector {
        fn new(streams: Vec<MockStream>) -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(streams.into()),
                connects: Mutex::new(0),
            })
        }

        fn connects(&self) -> usize {
            *self.connects.lock().unwrap()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn ByteStream>> {
            *self.connects.lock().unwrap() += 1;
            let stream = self.streams.lock().unwrap().pop_front().ok_or(LdapError::ConnectionClosed)?;
            Ok(Box::new(stream))
        }
    }

    fn done(id: i32) -> Vec<u8> {
        LdapMessage::new(id, ProtocolOp::SearchResultDone(LdapResult::success()))
            .encode()
            .unwrap()
    }

    fn entry(id: i32, dn: &str) -> Vec<u8> {
        let entry = SearchResultEntry {
            entry: crate::protocol::Entry::new(dn),
        };
        LdapMessage::new(id, ProtocolOp::SearchResultEntry(entry)).encode().unwrap()
    }

    fn client(connector: Arc<ScriptedConnector>) -> ClientQueue {
        ClientQueue::new(connector, Arc::new(OperationRegistry::new()))
    }

    #[tokio::test]
    async fn test_connects_lazily() {
        let connector = ScriptedConnector::new(vec![MockStream::new(vec![done(1)])]);
        let mut queue = client(connector.clone());
        assert_eq!(connector.connects(), 0);
        assert!(!queue.is_connected());
        let message = queue.receive_id(1).await.unwrap();
        assert_eq!(message.message_id, 1);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_messages_are_held() {
        let stream = MockStream::new(vec![entry(2, "cn=a"), done(3), entry(2, "cn=b"), done(1)]);
        let mut queue = client(ScriptedConnector::new(vec![stream]));

        assert_eq!(queue.receive_id(1).await.unwrap().message_id, 1);
        match queue.receive_id(2).await.unwrap().op {
            ProtocolOp::SearchResultEntry(e) => assert_eq!(e.entry.dn, "cn=a"),
            other => panic!("unexpected {:?}", other),
        }
        // arrival order for the rest: 3 then the second entry for 2
        assert_eq!(queue.receive().await.unwrap().message_id, 3);
        match queue.receive().await.unwrap().op {
            ProtocolOp::SearchResultEntry(e) => assert_eq!(e.entry.dn, "cn=b"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notice_of_disconnection_marks_reconnect() {
        let notice = LdapMessage::new(
            0,
            ProtocolOp::ExtendedResponse(notice_of_disconnection(ResultCode::UNAVAILABLE, "shutting down")),
        );
        let connector = ScriptedConnector::new(vec![
            MockStream::new(vec![notice.encode().unwrap()]),
            MockStream::new(vec![done(1)]),
        ]);
        let mut queue = client(connector.clone());

        match queue.receive_id(1).await {
            Err(LdapError::Unsolicited { oid, code, .. }) => {
                assert_eq!(oid, NOTICE_OF_DISCONNECTION_OID);
                assert_eq!(code, ResultCode::UNAVAILABLE);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(queue.needs_reconnect());
        assert_eq!(queue.receive_id(1).await.unwrap().message_id, 1);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_then_reconnect_on_next_use() {
        let connector = ScriptedConnector::new(vec![
            MockStream::new(vec![vec![0x30, 0xFF]]),
            MockStream::new(vec![done(5)]),
        ]);
        let mut queue = client(connector.clone());
        assert!(queue.receive().await.is_err());
        assert!(queue.needs_reconnect());
        assert_eq!(connector.connects(), 1);
        assert_eq!(queue.receive().await.unwrap().message_id, 5);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_send_writes_encoded_message() {
        let stream = MockStream::new(vec![]);
        let written = stream.written.clone();
        let mut queue = client(ScriptedConnector::new(vec![stream]));
        let message = LdapMessage::new(1, ProtocolOp::UnbindRequest);
        queue.send(&message).await.unwrap();
        assert_eq!(written.lock().unwrap().clone(), vec![message.encode().unwrap()]);
    }
}
