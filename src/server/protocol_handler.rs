// Per-connection request dispatch

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::bind;
use super::history::RequestHistory;
use super::paging::PagingRequest;
use super::token::{RequestContext, Token};
use super::ServerContext;
use crate::error::{LdapError, OperationError, ProtocolError, Result};
use crate::protocol::control::{PagingControl, MANAGE_DSA_IT_OID, PAGING_OID};
use crate::protocol::extended::{
    notice_of_disconnection, whoami_response, CANCEL_OID, START_TLS_OID, WHOAMI_OID,
};
use crate::protocol::{
    op_tag, BindRequest, BindResponse, Entry, ExtendedResponse, LdapMessage, LdapResult, ProtocolOp,
    SearchRequest, SearchResultEntry, TypedControl,
};
use crate::result_code::ResultCode;
use crate::transport::{ByteStream, Inbound, ServerQueue, TlsUpgrade};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// The response carrying `result` for a request with the given tag.
/// Unbind, abandon and unknown requests get none.
fn error_response(request_tag: u32, result: LdapResult) -> Option<ProtocolOp> {
    Some(match request_tag {
        op_tag::BIND_REQUEST => ProtocolOp::BindResponse(BindResponse::new(result)),
        op_tag::SEARCH_REQUEST => ProtocolOp::SearchResultDone(result),
        op_tag::MODIFY_REQUEST => ProtocolOp::ModifyResponse(result),
        op_tag::ADD_REQUEST => ProtocolOp::AddResponse(result),
        op_tag::DELETE_REQUEST => ProtocolOp::DeleteResponse(result),
        op_tag::MODIFY_DN_REQUEST => ProtocolOp::ModifyDnResponse(result),
        op_tag::COMPARE_REQUEST => ProtocolOp::CompareResponse(result),
        op_tag::EXTENDED_REQUEST => ProtocolOp::ExtendedResponse(ExtendedResponse::new(result)),
        _ => return None,
    })
}

/// Keep only the requested attributes. `*` and `+` select everything,
/// `1.1` selects nothing.
fn select_attributes(mut entry: Entry, requested: &[String]) -> Entry {
    if requested.is_empty() || requested.iter().any(|a| a == "*" || a == "+") {
        return entry;
    }
    entry
        .attributes
        .retain(|attr| requested.iter().any(|r| r.eq_ignore_ascii_case(&attr.name)));
    entry
}

/// Serves one client connection until it unbinds, fails, or disconnects.
pub struct ServerProtocolHandler {
    ctx: Arc<ServerContext>,
    queue: ServerQueue,
    token: Token,
    history: RequestHistory,
    peer: String,
}

impl ServerProtocolHandler {
    pub fn new(ctx: Arc<ServerContext>, stream: Box<dyn ByteStream>, peer: impl Into<String>) -> Self {
        let mut queue = ServerQueue::new(stream, Arc::clone(&ctx.registry));
        queue.set_max_pdu_size(ctx.options.max_pdu_size);
        let history = RequestHistory::new(
            Duration::from_secs(ctx.options.paging_ttl_sec),
            ctx.options.max_paged_searches,
        );
        Self {
            ctx,
            queue,
            token: Token::anonymous(),
            history,
            peer: peer.into(),
        }
    }

    pub async fn run(mut self) {
        let metrics = Arc::clone(&self.ctx.metrics);
        metrics.inc_connections();
        debug!("Handling client connection from {}", self.peer);

        loop {
            let inbound = match self.queue.read().await {
                Ok(inbound) => inbound,
                Err(LdapError::ConnectionClosed) => {
                    debug!("Client {} disconnected", self.peer);
                    break;
                }
                Err(LdapError::Timeout) => {
                    debug!("Client {} idle too long", self.peer);
                    self.disconnect(ResultCode::UNAVAILABLE, "Idle timeout exceeded.").await;
                    break;
                }
                Err(LdapError::Decode(e)) => {
                    metrics.inc_parse_error();
                    warn!("Malformed data from {}: {}", self.peer, e);
                    self.disconnect(ResultCode::PROTOCOL_ERROR, "Malformed message.").await;
                    break;
                }
                Err(e) => {
                    warn!("Read error from {}: {}", self.peer, e);
                    break;
                }
            };

            let flow = match inbound {
                Inbound::Request(message) => self.dispatch(message).await,
                Inbound::Invalid {
                    message_id,
                    op_tag,
                    error,
                } => self.reject(message_id, op_tag, error).await,
            };
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(e) => {
                    warn!("Error handling client {}: {}", self.peer, e);
                    break;
                }
            }
        }

        if let Err(e) = self.queue.close().await {
            debug!("Error closing connection to {}: {}", self.peer, e);
        }
        metrics.dec_active_connections();
    }

    async fn dispatch(&mut self, message: LdapMessage) -> Result<Flow> {
        let op = message.op.name();
        let started = Instant::now();
        self.ctx.metrics.inc_request(op);
        debug!("{} from {}", message, self.peer);

        if let Err(e) = self.history.add_id(message.message_id) {
            warn!("Protocol violation from {}: {}", self.peer, e);
            self.disconnect(ResultCode::PROTOCOL_ERROR, &e.message).await;
            return Ok(Flow::Close);
        }

        let flow = match self.handle(&message).await {
            Ok(flow) => Ok(flow),
            Err(LdapError::Operation(e)) => self.send_error(&message, LdapResult::new(e.code, e.message)).await,
            Err(LdapError::Protocol(e)) => {
                self.send_error(&message, LdapResult::new(ResultCode::PROTOCOL_ERROR, e.message))
                    .await
            }
            Err(LdapError::Referral(r)) => {
                self.send_error(
                    &message,
                    LdapResult::new(ResultCode::REFERRAL, r.message).with_referrals(r.referrals),
                )
                .await
            }
            Err(e) => Err(e),
        };
        self.ctx.metrics.observe_duration(op, started.elapsed());
        flow
    }

    async fn handle(&mut self, message: &LdapMessage) -> Result<Flow> {
        match &message.op {
            ProtocolOp::UnbindRequest => {
                debug!("Client {} unbound", self.peer);
                return Ok(Flow::Close);
            }
            // Operations complete synchronously, so there is never anything to abandon.
            ProtocolOp::AbandonRequest(a) => {
                debug!("Client {} abandoned message {}", self.peer, a.message_id);
                return Ok(Flow::Continue);
            }
            _ => {}
        }

        if let Some(oid) = self.unsupported_critical(message) {
            return Err(OperationError::new(
                ResultCode::UNAVAILABLE_CRITICAL_EXTENSION,
                format!("The critical control {} is not supported.", oid),
            )
            .into());
        }

        let id = message.message_id;
        match &message.op {
            ProtocolOp::BindRequest(request) => self.bind(id, request).await,
            ProtocolOp::ExtendedRequest(request) if request.name == START_TLS_OID => self.start_tls(id).await,
            ProtocolOp::ExtendedRequest(request) if request.name == WHOAMI_OID => {
                let response = whoami_response(&self.token.authz_id());
                self.send(id, ProtocolOp::ExtendedResponse(response)).await
            }
            ProtocolOp::ExtendedRequest(request) if request.name == CANCEL_OID => Err(OperationError::new(
                ResultCode::CANNOT_CANCEL,
                "Operations complete before a cancel can be processed.",
            )
            .into()),
            ProtocolOp::SearchRequest(request) if request.is_root_dse() => self.root_dse(message, request).await,
            _ => {
                self.require_authentication()?;
                self.handle_operation(message).await
            }
        }
    }

    async fn handle_operation(&mut self, message: &LdapMessage) -> Result<Flow> {
        let handler = Arc::clone(&self.ctx.handler);
        let ctx = self.request_context(message);
        let id = message.message_id;
        match &message.op {
            ProtocolOp::AddRequest(request) => {
                handler.add(&ctx, request).await?;
                self.send(id, ProtocolOp::AddResponse(LdapResult::success())).await
            }
            ProtocolOp::DeleteRequest(request) => {
                handler.delete(&ctx, request).await?;
                self.send(id, ProtocolOp::DeleteResponse(LdapResult::success())).await
            }
            ProtocolOp::ModifyRequest(request) => {
                handler.modify(&ctx, request).await?;
                self.send(id, ProtocolOp::ModifyResponse(LdapResult::success())).await
            }
            ProtocolOp::ModifyDnRequest(request) => {
                handler.modify_dn(&ctx, request).await?;
                self.send(id, ProtocolOp::ModifyDnResponse(LdapResult::success())).await
            }
            ProtocolOp::CompareRequest(request) => {
                let code = if handler.compare(&ctx, request).await? {
                    ResultCode::COMPARE_TRUE
                } else {
                    ResultCode::COMPARE_FALSE
                };
                self.send(id, ProtocolOp::CompareResponse(LdapResult::new(code, ""))).await
            }
            ProtocolOp::ExtendedRequest(request) => {
                let response = handler.extended(&ctx, request).await?;
                self.send(id, ProtocolOp::ExtendedResponse(response)).await
            }
            ProtocolOp::SearchRequest(request) => {
                let paging = message.control::<PagingControl>().transpose()?;
                match (paging, self.ctx.paging.is_some()) {
                    (Some(control), true) => self.paged_search(message, request, control, ctx).await,
                    _ => self.search(id, request, ctx).await,
                }
            }
            other => Err(OperationError::new(
                ResultCode::PROTOCOL_ERROR,
                format!("The {} operation is not supported.", other.name()),
            )
            .into()),
        }
    }

    async fn bind(&mut self, id: i32, request: &BindRequest) -> Result<Flow> {
        let ctx = Arc::clone(&self.ctx);
        let result: Result<Token> = if request.is_anonymous() && !ctx.options.allow_anonymous {
            Err(OperationError::new(ResultCode::INAPPROPRIATE_AUTHENTICATION, "Anonymous binds are not allowed.").into())
        } else {
            match bind::select(&ctx.binds, request) {
                Ok(strategy) => strategy.bind(id, request, &mut self.queue).await,
                Err(e) => Err(e.into()),
            }
        };
        match result {
            Ok(token) => {
                info!(
                    "Client {} bound as {}",
                    self.peer,
                    token.username().unwrap_or("anonymous")
                );
                self.token = token;
                Ok(Flow::Continue)
            }
            Err(e) => {
                // A failed bind leaves the connection anonymous.
                self.token = Token::anonymous();
                if matches!(e, LdapError::Operation(_)) {
                    ctx.metrics.inc_bind_failure();
                }
                Err(e)
            }
        }
    }

    async fn start_tls(&mut self, id: i32) -> Result<Flow> {
        let Some(acceptor) = self.ctx.tls.clone() else {
            return Err(OperationError::new(ResultCode::PROTOCOL_ERROR, "StartTLS is not supported.").into());
        };
        if self.queue.is_secure() {
            return Err(OperationError::new(ResultCode::OPERATIONS_ERROR, "TLS is already active.").into());
        }
        let mut response = ExtendedResponse::new(LdapResult::success());
        response.name = Some(START_TLS_OID.to_string());
        self.send(id, ProtocolOp::ExtendedResponse(response)).await?;
        self.queue.start_tls(&TlsUpgrade::Server(acceptor)).await?;
        info!("TLS established with {}", self.peer);
        Ok(Flow::Continue)
    }

    async fn root_dse(&mut self, message: &LdapMessage, request: &SearchRequest) -> Result<Flow> {
        let ctx = self.request_context(message);
        let mut entry = self.default_root_dse();
        if let Some(handler) = self.ctx.root_dse.clone() {
            entry = handler.root_dse(&ctx, request, entry).await?;
        }
        let entry = if request.attributes.iter().any(|a| a == "1.1") {
            Entry::new(entry.dn)
        } else {
            select_attributes(entry, &request.attributes)
        };
        let id = message.message_id;
        self.send(id, ProtocolOp::SearchResultEntry(SearchResultEntry { entry })).await?;
        self.send(id, ProtocolOp::SearchResultDone(LdapResult::success())).await
    }

    fn default_root_dse(&self) -> Entry {
        let options = &self.ctx.options;
        let mut extensions = vec![WHOAMI_OID.to_string(), CANCEL_OID.to_string()];
        if self.ctx.tls.is_some() {
            extensions.push(START_TLS_OID.to_string());
        }
        let mut controls = vec![MANAGE_DSA_IT_OID.to_string()];
        if self.ctx.paging.is_some() {
            controls.push(PAGING_OID.to_string());
        }
        controls.extend(self.ctx.handler.supported_controls());

        let mut entry = Entry::new("")
            .with_attribute("objectClass", ["top"])
            .with_attribute("supportedLDAPVersion", ["3"])
            .with_attribute("supportedExtension", extensions)
            .with_attribute("supportedControl", controls)
            .with_attribute("supportedSASLMechanisms", [bind::SASL_PLAIN]);
        if !options.naming_contexts.is_empty() {
            entry = entry.with_attribute("namingContexts", options.naming_contexts.clone());
        }
        if let Some(name) = &options.vendor_name {
            entry = entry.with_attribute("vendorName", [name.as_str()]);
        }
        if let Some(version) = &options.vendor_version {
            entry = entry.with_attribute("vendorVersion", [version.as_str()]);
        }
        entry
    }

    async fn search(&mut self, id: i32, request: &SearchRequest, ctx: RequestContext) -> Result<Flow> {
        let mut entries = self.ctx.handler.search(&ctx, request).await?;
        let mut result = LdapResult::success();
        let limit = usize::try_from(request.size_limit).unwrap_or(0);
        if limit > 0 && entries.len() > limit {
            entries.truncate(limit);
            result = LdapResult::new(ResultCode::SIZE_LIMIT_EXCEEDED, "");
        }
        for entry in entries {
            self.send(id, ProtocolOp::SearchResultEntry(SearchResultEntry { entry })).await?;
        }
        self.send(id, ProtocolOp::SearchResultDone(result)).await
    }

    async fn paged_search(
        &mut self,
        message: &LdapMessage,
        search: &SearchRequest,
        control: PagingControl,
        ctx: RequestContext,
    ) -> Result<Flow> {
        let Some(pager) = self.ctx.paging.clone() else {
            return self.search(message.message_id, search, ctx).await;
        };
        let id = message.message_id;

        let mut request = if control.cookie.is_empty() {
            if control.size == 0 {
                debug!("Client {} asked for an empty first page", self.peer);
                return self.send_done_with_cookie(id, 0, Vec::new()).await;
            }
            self.history.paging().ensure_capacity()?;
            PagingRequest::new(control.clone(), search.clone(), message.controls.clone())
        } else {
            self.history.paging().take(&control.cookie).ok_or_else(|| {
                OperationError::new(ResultCode::PROTOCOL_ERROR, "The supplied paging cookie is invalid.")
            })?
        };
        if !request.matches(search) {
            return Err(OperationError::new(
                ResultCode::PROTOCOL_ERROR,
                "The search does not match the paged search the cookie belongs to.",
            )
            .into());
        }
        request.advance(control);

        if request.is_abandon() {
            debug!("Client {} abandoned a paged search", self.peer);
            pager.remove(&ctx, &request).await;
            return self.send_done_with_cookie(id, 0, Vec::new()).await;
        }

        let response = match pager.page(&ctx, &request).await {
            Ok(response) => response,
            Err(e) => {
                pager.remove(&ctx, &request).await;
                return Err(e.into());
            }
        };
        let returned = response.entries.len();
        for entry in response.entries {
            self.send(id, ProtocolOp::SearchResultEntry(SearchResultEntry { entry })).await?;
        }

        let cookie = if response.complete {
            pager.remove(&ctx, &request).await;
            Vec::new()
        } else {
            request.finish_page(returned);
            let cookie = request.next_cookie().to_vec();
            self.history.paging().add(request)?;
            cookie
        };
        self.send_done_with_cookie(id, response.size_estimate, cookie).await
    }

    async fn send_done_with_cookie(&mut self, id: i32, size: i32, cookie: Vec<u8>) -> Result<Flow> {
        let control = PagingControl::new(size, cookie).to_control(false)?;
        let done = LdapMessage::new(id, ProtocolOp::SearchResultDone(LdapResult::success())).with_control(control);
        self.queue.send(&done).await?;
        Ok(Flow::Continue)
    }

    async fn reject(&mut self, message_id: Option<i32>, op_tag: Option<u32>, error: ProtocolError) -> Result<Flow> {
        self.ctx.metrics.inc_parse_error();
        warn!("Invalid request from {}: {}", self.peer, error);
        let response = op_tag.and_then(|tag| {
            error_response(tag, LdapResult::new(ResultCode::PROTOCOL_ERROR, error.message.clone()))
        });
        match (message_id.filter(|id| *id != 0), response) {
            (Some(id), Some(op)) => self.send(id, op).await,
            _ => {
                self.disconnect(ResultCode::PROTOCOL_ERROR, &error.message).await;
                Ok(Flow::Close)
            }
        }
    }

    fn require_authentication(&self) -> Result<(), OperationError> {
        if self.ctx.options.require_authentication && self.token.is_anonymous() {
            return Err(OperationError::new(
                ResultCode::INSUFFICIENT_ACCESS_RIGHTS,
                "Authentication is required for this operation.",
            ));
        }
        Ok(())
    }

    /// OID of the first critical control the server cannot honour.
    fn unsupported_critical(&self, message: &LdapMessage) -> Option<String> {
        let handled = self.ctx.handler.supported_controls();
        message
            .controls
            .iter()
            .filter(|c| c.critical)
            .find(|c| {
                let supported = match c.oid.as_str() {
                    MANAGE_DSA_IT_OID => true,
                    PAGING_OID => {
                        matches!(message.op, ProtocolOp::SearchRequest(_)) && self.ctx.paging.is_some()
                    }
                    oid => handled.iter().any(|h| h == oid),
                };
                !supported
            })
            .map(|c| c.oid.clone())
    }

    fn request_context(&self, message: &LdapMessage) -> RequestContext {
        RequestContext::new(self.token.clone(), message.controls.clone())
    }

    async fn send(&mut self, id: i32, op: ProtocolOp) -> Result<Flow> {
        self.queue.send(&LdapMessage::new(id, op)).await?;
        Ok(Flow::Continue)
    }

    /// Answer a failed request. A request with no response type of its own
    /// cannot be answered, so the client is disconnected instead.
    async fn send_error(&mut self, request: &LdapMessage, result: LdapResult) -> Result<Flow> {
        self.ctx.metrics.inc_error(request.op.name());
        debug!(
            "{} from {} failed: {} {}",
            request, self.peer, result.code, result.diagnostic_message
        );
        let code = result.code;
        let diagnostic = result.diagnostic_message.clone();
        match error_response(request.op.tag(), result) {
            Some(op) => {
                self.queue.send(&LdapMessage::new(request.message_id, op)).await?;
                Ok(Flow::Continue)
            }
            None => {
                warn!("Cannot answer {} from {}; disconnecting", request.op.name(), self.peer);
                self.disconnect(code, &diagnostic).await;
                Ok(Flow::Close)
            }
        }
    }

    /// Best effort: the connection is closed right after.
    async fn disconnect(&mut self, code: ResultCode, message: &str) {
        let notice = LdapMessage::new(0, ProtocolOp::ExtendedResponse(notice_of_disconnection(code, message)));
        if let Err(e) = self.queue.send(&notice).await {
            debug!("Could not send notice of disconnection to {}: {}", self.peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn1::Asn1;
    use crate::config::{ServerOptions, UserConfig};
    use crate::protocol::control::Control;
    use crate::protocol::registry::{CustomOp, Operation, OperationKind};
    use crate::protocol::{FromAsn1, OperationRegistry, ToAsn1};
    use crate::protocol::{
        AbandonRequest, AddRequest, DeleteRequest, Filter, SearchScope,
    };
    use crate::server::handler::{HandlerResult, RequestHandler, SearchPagingHandler, StaticAuthorizer};
    use crate::transport::mock::MockStream;
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Written = Arc<Mutex<Vec<Vec<u8>>>>;

    struct People;

    #[async_trait]
    impl RequestHandler for People {
        async fn search(&self, _ctx: &RequestContext, _request: &SearchRequest) -> HandlerResult<Vec<Entry>> {
            Ok((1..=5)
                .map(|i| Entry::new(format!("uid=user{},ou=people,dc=example,dc=com", i)).with_attribute("uid", [format!("user{}", i)]))
                .collect())
        }

        async fn add(&self, _ctx: &RequestContext, request: &AddRequest) -> HandlerResult<()> {
            if request.entry.dn.starts_with("cn=exists") {
                return Err(OperationError::new(ResultCode::ENTRY_ALREADY_EXISTS, "Entry exists."));
            }
            Ok(())
        }
    }

    fn context(options: ServerOptions) -> ServerContext {
        let users = vec![UserConfig {
            dn: "cn=admin,dc=example,dc=com".into(),
            password: "secret".into(),
            username: None,
        }];
        let handler: Arc<dyn RequestHandler> = Arc::new(People);
        ServerContext::new(options, Arc::new(StaticAuthorizer::new(&users)))
            .with_paging(Arc::new(SearchPagingHandler::new(Arc::clone(&handler))))
            .with_handler(handler)
    }

    async fn exchange(ctx: ServerContext, requests: Vec<LdapMessage>) -> Vec<LdapMessage> {
        let chunks: Vec<Vec<u8>> = requests.iter().map(|m| m.encode().unwrap()).collect();
        let stream = MockStream::new(chunks);
        let written: Written = stream.written.clone();
        ServerProtocolHandler::new(Arc::new(ctx), Box::new(stream), "test").run().await;
        let bytes: Vec<Vec<u8>> = written.lock().unwrap().clone();
        bytes.iter().map(|b| LdapMessage::decode(b).unwrap()).collect()
    }

    fn search(base: &str) -> SearchRequest {
        SearchRequest::new(base, SearchScope::WholeSubtree, Filter::present("uid"))
    }

    fn result_code(message: &LdapMessage) -> ResultCode {
        message.op.result().unwrap().code
    }

    #[tokio::test]
    async fn test_bind_then_whoami() {
        let responses = exchange(
            context(ServerOptions::default()),
            vec![
                LdapMessage::new(1, ProtocolOp::BindRequest(BindRequest::simple("cn=admin,dc=example,dc=com", "secret"))),
                LdapMessage::new(2, ProtocolOp::ExtendedRequest(crate::protocol::extended::whoami_request())),
            ],
        )
        .await;
        assert_eq!(responses.len(), 2);
        assert_eq!(result_code(&responses[0]), ResultCode::SUCCESS);
        match &responses[1].op {
            ProtocolOp::ExtendedResponse(r) => {
                assert_eq!(r.value.as_deref(), Some(&b"dn:cn=admin,dc=example,dc=com"[..]))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_bind_answers_invalid_credentials() {
        let responses = exchange(
            context(ServerOptions::default()),
            vec![LdapMessage::new(1, ProtocolOp::BindRequest(BindRequest::simple("cn=admin,dc=example,dc=com", "nope")))],
        )
        .await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].message_id, 1);
        assert_eq!(result_code(&responses[0]), ResultCode::INVALID_CREDENTIALS);
    }

    #[tokio::test]
    async fn test_require_authentication() {
        let options = ServerOptions {
            require_authentication: true,
            ..Default::default()
        };
        let responses = exchange(
            context(options),
            vec![
                LdapMessage::new(1, ProtocolOp::SearchRequest(search("dc=example,dc=com"))),
                LdapMessage::new(2, ProtocolOp::SearchRequest(SearchRequest::new("", SearchScope::BaseObject, Filter::any_object()))),
            ],
        )
        .await;
        assert_eq!(result_code(&responses[0]), ResultCode::INSUFFICIENT_ACCESS_RIGHTS);
        // the Root DSE stays readable
        assert!(matches!(responses[1].op, ProtocolOp::SearchResultEntry(_)));
        assert_eq!(result_code(&responses[2]), ResultCode::SUCCESS);
    }

    #[tokio::test]
    async fn test_root_dse_attribute_selection() {
        let options = ServerOptions {
            naming_contexts: vec!["dc=example,dc=com".into()],
            ..Default::default()
        };
        let request = SearchRequest::new("", SearchScope::BaseObject, Filter::any_object())
            .with_attributes(["namingContexts", "supportedControl"]);
        let responses = exchange(context(options), vec![LdapMessage::new(1, ProtocolOp::SearchRequest(request))]).await;
        let ProtocolOp::SearchResultEntry(result) = &responses[0].op else {
            panic!("expected an entry, got {:?}", responses[0].op);
        };
        assert_eq!(result.entry.attributes.len(), 2);
        assert_eq!(result.entry.first_value("namingContexts"), Some("dc=example,dc=com"));
        assert!(result.entry.get("supportedControl").unwrap().has_value(PAGING_OID.as_bytes()));
    }

    #[tokio::test]
    async fn test_duplicate_message_id_disconnects() {
        let responses = exchange(
            context(ServerOptions::default()),
            vec![
                LdapMessage::new(1, ProtocolOp::DeleteRequest(DeleteRequest { dn: "cn=x".into() })),
                LdapMessage::new(1, ProtocolOp::DeleteRequest(DeleteRequest { dn: "cn=y".into() })),
            ],
        )
        .await;
        assert_eq!(responses.len(), 2);
        assert_eq!(result_code(&responses[0]), ResultCode::UNWILLING_TO_PERFORM);
        assert_eq!(responses[1].message_id, 0);
        match &responses[1].op {
            ProtocolOp::ExtendedResponse(r) => {
                assert_eq!(r.name.as_deref(), Some(crate::protocol::extended::NOTICE_OF_DISCONNECTION_OID));
                assert_eq!(r.result.code, ResultCode::PROTOCOL_ERROR);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_errors_become_results() {
        let add = |dn: &str| {
            ProtocolOp::AddRequest(AddRequest {
                entry: Entry::new(dn).with_attribute("objectClass", ["person"]),
            })
        };
        let responses = exchange(
            context(ServerOptions::default()),
            vec![
                LdapMessage::new(1, add("cn=new,dc=example,dc=com")),
                LdapMessage::new(2, add("cn=exists,dc=example,dc=com")),
            ],
        )
        .await;
        assert!(matches!(responses[0].op, ProtocolOp::AddResponse(ref r) if r.code == ResultCode::SUCCESS));
        assert!(matches!(responses[1].op, ProtocolOp::AddResponse(ref r) if r.code == ResultCode::ENTRY_ALREADY_EXISTS));
    }

    #[tokio::test]
    async fn test_unsupported_critical_control() {
        let sorting = Control::new(crate::protocol::control::SORTING_OID, true, None);
        let request = LdapMessage::new(3, ProtocolOp::SearchRequest(search("dc=example,dc=com"))).with_control(sorting);
        let responses = exchange(context(ServerOptions::default()), vec![request]).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(result_code(&responses[0]), ResultCode::UNAVAILABLE_CRITICAL_EXTENSION);
    }

    #[tokio::test]
    async fn test_cancel_and_abandon() {
        let cancel = crate::protocol::extended::CancelRequest { message_id: 1 }.to_request();
        let responses = exchange(
            context(ServerOptions::default()),
            vec![
                LdapMessage::new(2, ProtocolOp::AbandonRequest(AbandonRequest { message_id: 1 })),
                LdapMessage::new(3, ProtocolOp::ExtendedRequest(cancel)),
            ],
        )
        .await;
        // abandon is never answered
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].message_id, 3);
        assert_eq!(result_code(&responses[0]), ResultCode::CANNOT_CANCEL);
    }

    #[tokio::test]
    async fn test_size_limit() {
        let request = search("dc=example,dc=com").with_size_limit(2);
        let responses = exchange(context(ServerOptions::default()), vec![LdapMessage::new(1, ProtocolOp::SearchRequest(request))]).await;
        assert_eq!(responses.len(), 3);
        assert_eq!(result_code(&responses[2]), ResultCode::SIZE_LIMIT_EXCEEDED);
    }

    #[tokio::test]
    async fn test_paged_search_first_page_and_bad_cookie() {
        let first = LdapMessage::new(1, ProtocolOp::SearchRequest(search("dc=example,dc=com")))
            .with_control(PagingControl::new(2, vec![]).to_control(true).unwrap());
        let bad = LdapMessage::new(2, ProtocolOp::SearchRequest(search("dc=example,dc=com")))
            .with_control(PagingControl::new(2, b"bogus".to_vec()).to_control(true).unwrap());
        let responses = exchange(context(ServerOptions::default()), vec![first, bad]).await;
        assert_eq!(responses.len(), 4);
        assert!(matches!(responses[0].op, ProtocolOp::SearchResultEntry(_)));
        assert!(matches!(responses[1].op, ProtocolOp::SearchResultEntry(_)));
        let paging = responses[2].control::<PagingControl>().unwrap().unwrap();
        assert_eq!(paging.size, 5);
        assert!(!paging.cookie.is_empty());
        assert_eq!(responses[3].message_id, 2);
        assert_eq!(result_code(&responses[3]), ResultCode::PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn test_paged_search_limit_per_connection() {
        let options = ServerOptions {
            max_paged_searches: 2,
            ..Default::default()
        };
        let requests = (1..=3)
            .map(|id| {
                LdapMessage::new(id, ProtocolOp::SearchRequest(search("dc=example,dc=com")))
                    .with_control(PagingControl::new(2, vec![]).to_control(false).unwrap())
            })
            .collect();
        let responses = exchange(context(options), requests).await;
        let done: Vec<&LdapMessage> = responses
            .iter()
            .filter(|m| matches!(m.op, ProtocolOp::SearchResultDone(_)))
            .collect();
        assert_eq!(done.len(), 3);
        assert_eq!(result_code(done[0]), ResultCode::SUCCESS);
        assert_eq!(result_code(done[1]), ResultCode::SUCCESS);
        assert_eq!(done[2].message_id, 3);
        assert_eq!(result_code(done[2]), ResultCode::ADMIN_LIMIT_EXCEEDED);
    }

    #[tokio::test]
    async fn test_empty_first_page_ends_paging() {
        let request = LdapMessage::new(1, ProtocolOp::SearchRequest(search("dc=example,dc=com")))
            .with_control(PagingControl::new(0, vec![]).to_control(true).unwrap());
        let responses = exchange(context(ServerOptions::default()), vec![request]).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(result_code(&responses[0]), ResultCode::SUCCESS);
        let paging = responses[0].control::<PagingControl>().unwrap().unwrap();
        assert!(paging.cookie.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_answered_with_protocol_error() {
        use crate::asn1;
        let bad = asn1::encode(&Asn1::sequence(vec![Asn1::integer(4), Asn1::sequence(vec![]).application(op_tag::SEARCH_REQUEST)]));
        let stream = MockStream::new(vec![bad]);
        let written: Written = stream.written.clone();
        ServerProtocolHandler::new(Arc::new(context(ServerOptions::default())), Box::new(stream), "test")
            .run()
            .await;
        let writes = written.lock().unwrap().clone();
        let response = LdapMessage::decode(&writes[0]).unwrap();
        assert_eq!(response.message_id, 4);
        assert!(matches!(response.op, ProtocolOp::SearchResultDone(ref r) if r.code == ResultCode::PROTOCOL_ERROR));
    }

    #[tokio::test]
    async fn test_anonymous_bind_refused_when_disabled() {
        let options = ServerOptions {
            allow_anonymous: false,
            ..Default::default()
        };
        let responses = exchange(context(options), vec![LdapMessage::new(1, ProtocolOp::BindRequest(BindRequest::anonymous()))]).await;
        assert_eq!(result_code(&responses[0]), ResultCode::INAPPROPRIATE_AUTHENTICATION);
    }

    /// A registered request type the server has no handler for.
    #[derive(Debug)]
    struct Ping;

    impl FromAsn1 for Ping {
        fn from_asn1(_asn1: &Asn1) -> Result<Self, ProtocolError> {
            Ok(Ping)
        }
    }

    impl ToAsn1 for Ping {
        fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
            Ok(Asn1::null().application(30))
        }
    }

    impl Operation for Ping {
        const TAG: u32 = 30;
        const KIND: OperationKind = OperationKind::Request;
    }

    #[tokio::test]
    async fn test_unroutable_custom_request_disconnects() {
        let mut registry = OperationRegistry::new();
        registry.register::<Ping>().unwrap();
        let ctx = context(ServerOptions::default()).with_registry(Arc::new(registry));
        let ping = LdapMessage::new(1, ProtocolOp::Custom(CustomOp::new(Ping)));
        let whoami = LdapMessage::new(2, ProtocolOp::ExtendedRequest(crate::protocol::extended::whoami_request()));
        let responses = exchange(ctx, vec![ping, whoami]).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].message_id, 0);
        assert!(matches!(
            responses[0].op,
            ProtocolOp::ExtendedResponse(ref r) if r.result.code == ResultCode::PROTOCOL_ERROR
        ));
    }

    #[test]
    fn test_error_response_mapping() {
        assert!(error_response(op_tag::UNBIND_REQUEST, LdapResult::success()).is_none());
        assert!(error_response(op_tag::ABANDON_REQUEST, LdapResult::success()).is_none());
        assert!(matches!(
            error_response(op_tag::COMPARE_REQUEST, LdapResult::success()),
            Some(ProtocolOp::CompareResponse(_))
        ));
    }
}
