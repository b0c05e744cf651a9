//! Async LDAP client over a [`ClientQueue`].
//!
//! The connection is opened on first use and re-opened on the next use after
//! a fatal error, a notice of disconnection, or a cancelled operation.

pub mod paging;
pub mod sync;
pub mod vlv;

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ClientOptions;
use crate::error::{LdapError, ProtocolError, Result};
use crate::protocol::extended::{
    start_tls_request, whoami_request, CancelRequest, PasswordModifyRequest, PasswordModifyResponse,
};
use crate::protocol::{
    AbandonRequest, AddRequest, BindRequest, BindResponse, Change, CompareRequest, Control, DeleteRequest, Entry,
    ExtendedRequest, ExtendedResponse, LdapMessage, LdapResult, ModifyDnRequest, ModifyRequest, OperationRegistry,
    ProtocolOp, SearchRequest, TypedControl,
};
use crate::result_code::ResultCode;
use crate::transport::{ClientQueue, Connector, TcpConnector};

pub use paging::Paging;
pub use sync::{SyncHandler, SyncPhase, SyncProgress, SyncRepl, SyncSession, SyncStage};
pub use vlv::Vlv;

/// Everything a search returned.
#[derive(Debug, Clone)]
pub struct SearchResults {
    pub entries: Vec<Entry>,
    pub references: Vec<String>,
    pub result: LdapResult,
    /// Controls on the SearchResultDone.
    pub controls: Vec<Control>,
}

impl SearchResults {
    pub fn control<T: TypedControl>(&self) -> Option<Result<T, ProtocolError>> {
        self.controls
            .iter()
            .find(|c| c.oid == T::OID)
            .map(|c| c.decode_as::<T>())
    }
}

/// Pass success-like results, turn the rest into errors.
fn check(message: LdapMessage) -> Result<LdapMessage> {
    if let Some(result) = message.op.result() {
        result.clone().into_outcome()?;
    }
    Ok(message)
}

fn unexpected(expected: &str, message: &LdapMessage) -> LdapError {
    ProtocolError::new(format!("expected {}, got {}", expected, message.op.name())).into()
}

pub struct LdapClient {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    queue: ClientQueue,
    next_id: i32,
}

impl LdapClient {
    /// Connects to `options.servers` in order, lazily.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(&options)?);
        Ok(Self::with_connector(options, connector))
    }

    pub fn with_connector(options: ClientOptions, connector: Arc<dyn Connector>) -> Self {
        Self::with_registry(options, connector, Arc::new(OperationRegistry::new()))
    }

    pub fn with_registry(options: ClientOptions, connector: Arc<dyn Connector>, registry: Arc<OperationRegistry>) -> Self {
        let queue = ClientQueue::new(Arc::clone(&connector), registry);
        Self {
            options,
            connector,
            queue,
            next_id: 1,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.queue.is_connected()
    }

    pub fn is_secure(&self) -> bool {
        self.queue.is_secure()
    }

    /// Message IDs run 1..=i32::MAX and wrap back to 1.
    fn next_message_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = if id == i32::MAX { 1 } else { id + 1 };
        id
    }

    /// Send a request without waiting; returns its message ID.
    pub async fn send(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<i32> {
        let id = self.next_message_id();
        let message = LdapMessage::new(id, op).with_controls(controls);
        debug!("sending {}", message);
        self.queue.send(&message).await?;
        Ok(id)
    }

    /// Send a request and wait for its single response.
    pub async fn send_and_receive(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<LdapMessage> {
        let id = self.send(op, controls).await?;
        let response = self.queue.receive_id(id).await?;
        check(response)
    }

    async fn bind(&mut self, request: BindRequest) -> Result<BindResponse> {
        let response = self.send_and_receive(ProtocolOp::BindRequest(request), Vec::new()).await?;
        match response.op {
            ProtocolOp::BindResponse(r) => Ok(r),
            _ => Err(unexpected("a bind response", &response)),
        }
    }

    pub async fn bind_simple(&mut self, dn: &str, password: &str) -> Result<BindResponse> {
        let mut request = BindRequest::simple(dn, password);
        request.version = self.options.version;
        let response = self.bind(request).await?;
        info!("bound as {}", dn);
        Ok(response)
    }

    pub async fn bind_anonymous(&mut self) -> Result<BindResponse> {
        let mut request = BindRequest::anonymous();
        request.version = self.options.version;
        self.bind(request).await
    }

    /// RFC 4616 PLAIN; `authzid` is usually left empty.
    pub async fn bind_sasl_plain(&mut self, username: &str, password: &str, authzid: Option<&str>) -> Result<BindResponse> {
        let mut credentials = authzid.unwrap_or_default().as_bytes().to_vec();
        credentials.push(0);
        credentials.extend_from_slice(username.as_bytes());
        credentials.push(0);
        credentials.extend_from_slice(password.as_bytes());
        let mut request = BindRequest::sasl("PLAIN", Some(credentials));
        request.version = self.options.version;
        self.bind(request).await
    }

    /// Run a search and collect everything it returns.
    pub async fn search(&mut self, request: SearchRequest, controls: Vec<Control>) -> Result<SearchResults> {
        let mut entries = Vec::new();
        let mut references = Vec::new();
        let done = self
            .search_with(request, controls, |message| {
                match &message.op {
                    ProtocolOp::SearchResultEntry(e) => entries.push(e.entry.clone()),
                    ProtocolOp::SearchResultReference(r) => references.extend(r.uris.iter().cloned()),
                    _ => {}
                }
                Ok(())
            })
            .await?;
        let ProtocolOp::SearchResultDone(result) = done.op else {
            return Err(ProtocolError::new("search ended without a result").into());
        };
        Ok(SearchResults {
            entries,
            references,
            result,
            controls: done.controls,
        })
    }

    /// Run a search, handing every entry, reference and intermediate
    /// response to `on_message`. Returning [`LdapError::CancelRequest`] from
    /// the callback stops the search; the connection is replaced on next use.
    pub async fn search_with<F>(&mut self, request: SearchRequest, controls: Vec<Control>, mut on_message: F) -> Result<LdapMessage>
    where
        F: FnMut(&LdapMessage) -> Result<()>,
    {
        let id = self.send(ProtocolOp::SearchRequest(request), controls).await?;
        loop {
            let message = self.queue.receive_id(id).await?;
            match &message.op {
                ProtocolOp::SearchResultDone(_) => return check(message),
                ProtocolOp::SearchResultEntry(_)
                | ProtocolOp::SearchResultReference(_)
                | ProtocolOp::IntermediateResponse(_) => {
                    if let Err(e) = on_message(&message) {
                        if matches!(e, LdapError::CancelRequest | LdapError::CancelSync) {
                            debug!("search {} cancelled by caller", id);
                            self.queue.discard(id);
                            self.queue.mark_reconnect();
                        }
                        return Err(e);
                    }
                }
                _ => return Err(unexpected("a search response", &message)),
            }
        }
    }

    pub async fn add(&mut self, entry: Entry) -> Result<LdapResult> {
        let response = self.send_and_receive(ProtocolOp::AddRequest(AddRequest { entry }), Vec::new()).await?;
        match response.op {
            ProtocolOp::AddResponse(r) => Ok(r),
            _ => Err(unexpected("an add response", &response)),
        }
    }

    pub async fn delete(&mut self, dn: &str) -> Result<LdapResult> {
        let request = DeleteRequest { dn: dn.to_string() };
        let response = self.send_and_receive(ProtocolOp::DeleteRequest(request), Vec::new()).await?;
        match response.op {
            ProtocolOp::DeleteResponse(r) => Ok(r),
            _ => Err(unexpected("a delete response", &response)),
        }
    }

    pub async fn modify(&mut self, dn: &str, changes: Vec<Change>) -> Result<LdapResult> {
        let request = ModifyRequest {
            dn: dn.to_string(),
            changes,
        };
        let response = self.send_and_receive(ProtocolOp::ModifyRequest(request), Vec::new()).await?;
        match response.op {
            ProtocolOp::ModifyResponse(r) => Ok(r),
            _ => Err(unexpected("a modify response", &response)),
        }
    }

    pub async fn modify_dn(
        &mut self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Result<LdapResult> {
        let request = ModifyDnRequest {
            dn: dn.to_string(),
            new_rdn: new_rdn.to_string(),
            delete_old_rdn,
            new_superior: new_superior.map(str::to_string),
        };
        let response = self.send_and_receive(ProtocolOp::ModifyDnRequest(request), Vec::new()).await?;
        match response.op {
            ProtocolOp::ModifyDnResponse(r) => Ok(r),
            _ => Err(unexpected("a modify DN response", &response)),
        }
    }

    /// `true` for compareTrue, `false` for compareFalse.
    pub async fn compare(&mut self, dn: &str, attribute: &str, value: impl Into<Vec<u8>>) -> Result<bool> {
        let request = CompareRequest {
            dn: dn.to_string(),
            attribute: attribute.to_string(),
            value: value.into(),
        };
        let response = self.send_and_receive(ProtocolOp::CompareRequest(request), Vec::new()).await?;
        match &response.op {
            ProtocolOp::CompareResponse(r) if r.code == ResultCode::COMPARE_TRUE => Ok(true),
            ProtocolOp::CompareResponse(r) if r.code == ResultCode::COMPARE_FALSE => Ok(false),
            ProtocolOp::CompareResponse(r) => {
                Err(ProtocolError::new(format!("unexpected compare result {}", r.code)).into())
            }
            _ => Err(unexpected("a compare response", &response)),
        }
    }

    pub async fn extended(&mut self, request: ExtendedRequest, controls: Vec<Control>) -> Result<ExtendedResponse> {
        let response = self.send_and_receive(ProtocolOp::ExtendedRequest(request), controls).await?;
        match response.op {
            ProtocolOp::ExtendedResponse(r) => Ok(r),
            _ => Err(unexpected("an extended response", &response)),
        }
    }

    /// The authorization identity the server associates with this connection.
    pub async fn whoami(&mut self) -> Result<String> {
        let response = self.extended(whoami_request(), Vec::new()).await?;
        let value = response.value.unwrap_or_default();
        String::from_utf8(value).map_err(|_| ProtocolError::new("Who Am I response is not UTF-8").into())
    }

    pub async fn password_modify(&mut self, request: PasswordModifyRequest) -> Result<PasswordModifyResponse> {
        let response = self.extended(request.to_request(), Vec::new()).await?;
        Ok(PasswordModifyResponse::from_response(&response)?)
    }

    /// RFC 3909 cancel. The cancelled operation's own response is dropped.
    pub async fn cancel(&mut self, message_id: i32) -> Result<()> {
        let request = CancelRequest { message_id }.to_request();
        let id = self.send(ProtocolOp::ExtendedRequest(request), Vec::new()).await?;
        let response = self.queue.receive_id(id).await?;
        self.queue.discard(message_id);
        match &response.op {
            ProtocolOp::ExtendedResponse(r) if r.result.code == ResultCode::CANCELED => Ok(()),
            ProtocolOp::ExtendedResponse(r) => r.result.clone().into_outcome().map(|_| ()),
            _ => Err(unexpected("an extended response", &response)),
        }
    }

    /// Abandon has no response; anything still arriving for the ID is dropped.
    pub async fn abandon(&mut self, message_id: i32) -> Result<()> {
        self.send(ProtocolOp::AbandonRequest(AbandonRequest { message_id }), Vec::new())
            .await?;
        self.queue.discard(message_id);
        Ok(())
    }

    pub async fn start_tls(&mut self) -> Result<()> {
        if self.queue.is_secure() {
            return Err(LdapError::Tls("connection is already secured".into()));
        }
        self.extended(start_tls_request(), Vec::new()).await?;
        let upgrade = self
            .connector
            .tls_upgrade()
            .ok_or_else(|| LdapError::Tls("connector cannot upgrade to TLS".into()))?;
        self.queue.start_tls(&upgrade).await?;
        info!("StartTLS negotiated");
        Ok(())
    }

    pub async fn unbind(&mut self) -> Result<()> {
        let result = self.send(ProtocolOp::UnbindRequest, Vec::new()).await;
        self.queue.close().await;
        result.map(|_| ())
    }

    pub async fn close(&mut self) {
        self.queue.close().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{Filter, SearchResultEntry, SearchResultReference, SearchScope};
    use crate::transport::mock::MockStream;
    use crate::transport::OnceConnector;
    use std::sync::Mutex;

    pub(crate) type Written = Arc<Mutex<Vec<Vec<u8>>>>;

    pub(crate) fn encode(id: i32, op: ProtocolOp) -> Vec<u8> {
        LdapMessage::new(id, op).encode().unwrap()
    }

    /// A client whose connection replays `responses` and records writes.
    pub(crate) fn scripted(responses: Vec<Vec<u8>>) -> (LdapClient, Written) {
        let stream = MockStream::new(responses);
        let written = stream.written.clone();
        let client = LdapClient::with_connector(ClientOptions::default(), OnceConnector::new(Box::new(stream)));
        (client, written)
    }

    pub(crate) fn sent(written: &Written) -> Vec<LdapMessage> {
        written
            .lock()
            .unwrap()
            .iter()
            .map(|b| LdapMessage::decode(b).unwrap())
            .collect()
    }

    #[test]
    fn test_message_ids_wrap_past_max() {
        let (mut client, _) = scripted(vec![]);
        assert_eq!(client.next_message_id(), 1);
        client.next_id = i32::MAX;
        assert_eq!(client.next_message_id(), i32::MAX);
        assert_eq!(client.next_message_id(), 1);
    }

    #[tokio::test]
    async fn test_bind_simple() {
        let (mut client, written) = scripted(vec![encode(
            1,
            ProtocolOp::BindResponse(BindResponse::new(LdapResult::success())),
        )]);
        client.bind_simple("cn=admin,dc=example,dc=com", "secret").await.unwrap();
        let sent = sent(&written);
        match &sent[0].op {
            ProtocolOp::BindRequest(r) => {
                assert_eq!(r.name, "cn=admin,dc=example,dc=com");
                assert!(r.is_simple());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bind_failure_is_operation_error() {
        let (mut client, _) = scripted(vec![encode(
            1,
            ProtocolOp::BindResponse(BindResponse::new(LdapResult::new(ResultCode::INVALID_CREDENTIALS, "bad"))),
        )]);
        match client.bind_simple("cn=admin", "wrong").await {
            Err(LdapError::Operation(e)) => {
                assert_eq!(e.code, ResultCode::INVALID_CREDENTIALS);
                assert_eq!(e.message, "bad");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_search_collects_entries_and_references() {
        let (mut client, _) = scripted(vec![
            encode(
                1,
                ProtocolOp::SearchResultEntry(SearchResultEntry {
                    entry: Entry::new("cn=a,dc=example"),
                }),
            ),
            encode(
                1,
                ProtocolOp::SearchResultReference(SearchResultReference {
                    uris: vec!["ldap://other/dc=example".into()],
                }),
            ),
            encode(1, ProtocolOp::SearchResultDone(LdapResult::success())),
        ]);
        let request = SearchRequest::new("dc=example", SearchScope::WholeSubtree, Filter::any_object());
        let results = client.search(request, vec![]).await.unwrap();
        assert_eq!(results.entries.len(), 1);
        assert_eq!(results.references, vec!["ldap://other/dc=example".to_string()]);
    }

    #[tokio::test]
    async fn test_search_cancel_marks_reconnect() {
        let (mut client, _) = scripted(vec![encode(
            1,
            ProtocolOp::SearchResultEntry(SearchResultEntry {
                entry: Entry::new("cn=a"),
            }),
        )]);
        let request = SearchRequest::new("dc=example", SearchScope::WholeSubtree, Filter::any_object());
        let result = client
            .search_with(request, vec![], |_| Err(LdapError::CancelRequest))
            .await;
        assert!(matches!(result, Err(LdapError::CancelRequest)));
        assert!(client.queue.needs_reconnect());
    }

    #[tokio::test]
    async fn test_referral_result() {
        let (mut client, _) = scripted(vec![encode(
            1,
            ProtocolOp::DeleteResponse(
                LdapResult::new(ResultCode::REFERRAL, "").with_referrals(vec!["ldap://b/".into()]),
            ),
        )]);
        match client.delete("cn=x").await {
            Err(LdapError::Referral(r)) => assert_eq!(r.referrals, vec!["ldap://b/".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compare() {
        let (mut client, _) = scripted(vec![
            encode(1, ProtocolOp::CompareResponse(LdapResult::new(ResultCode::COMPARE_TRUE, ""))),
            encode(2, ProtocolOp::CompareResponse(LdapResult::new(ResultCode::COMPARE_FALSE, ""))),
        ]);
        assert!(client.compare("cn=a", "sn", "x").await.unwrap());
        assert!(!client.compare("cn=a", "sn", "y").await.unwrap());
    }

    #[tokio::test]
    async fn test_whoami() {
        let (mut client, _) = scripted(vec![encode(
            1,
            ProtocolOp::ExtendedResponse(crate::protocol::extended::whoami_response("dn:cn=admin")),
        )]);
        assert_eq!(client.whoami().await.unwrap(), "dn:cn=admin");
    }

    #[tokio::test]
    async fn test_cancel_accepts_canceled() {
        let (mut client, written) = scripted(vec![encode(
            1,
            ProtocolOp::ExtendedResponse(ExtendedResponse::new(LdapResult::new(ResultCode::CANCELED, ""))),
        )]);
        client.cancel(9).await.unwrap();
        match &sent(&written)[0].op {
            ProtocolOp::ExtendedRequest(r) => {
                assert_eq!(CancelRequest::from_request(r).unwrap().message_id, 9)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsolicited_notice() {
        let notice = crate::protocol::extended::notice_of_disconnection(ResultCode::UNAVAILABLE, "shutting down");
        let (mut client, _) = scripted(vec![encode(0, ProtocolOp::ExtendedResponse(notice))]);
        let result = client.add(Entry::new("cn=a")).await;
        match result {
            Err(LdapError::Unsolicited { code, .. }) => assert_eq!(code, ResultCode::UNAVAILABLE),
            other => panic!("unexpected {:?}", other),
        }
        assert!(client.queue.needs_reconnect());
    }

    #[tokio::test]
    async fn test_sasl_plain_credentials() {
        let (mut client, written) = scripted(vec![encode(
            1,
            ProtocolOp::BindResponse(BindResponse::new(LdapResult::success())),
        )]);
        client.bind_sasl_plain("jdoe", "pw", None).await.unwrap();
        match &sent(&written)[0].op {
            ProtocolOp::BindRequest(r) => {
                assert_eq!(r.sasl_mechanism(), Some("PLAIN"));
                assert_eq!(
                    r.authentication,
                    crate::protocol::BindAuthentication::Sasl {
                        mechanism: "PLAIN".into(),
                        credentials: Some(b"\0jdoe\0pw".to_vec())
                    }
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
