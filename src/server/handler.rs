//! Collaborators the server dispatches to.
//!
//! The protocol layer owns framing, binds, paging state and the Root DSE
//! defaults; everything that touches directory data goes through these
//! traits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::paging::{PagingRequest, PagingResponse};
use super::token::RequestContext;
use crate::config::UserConfig;
use crate::error::OperationError;
use crate::protocol::{
    AddRequest, CompareRequest, DeleteRequest, Entry, ExtendedRequest, ExtendedResponse, ModifyDnRequest,
    ModifyRequest, SearchRequest,
};
use crate::result_code::ResultCode;

pub type HandlerResult<T> = Result<T, OperationError>;

fn unwilling(operation: &str) -> OperationError {
    OperationError::new(
        ResultCode::UNWILLING_TO_PERFORM,
        format!("The {} operation is not supported.", operation),
    )
}

/// Per-operation callbacks. Every method defaults to `unwillingToPerform`.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn add(&self, _ctx: &RequestContext, _request: &AddRequest) -> HandlerResult<()> {
        Err(unwilling("add"))
    }

    async fn delete(&self, _ctx: &RequestContext, _request: &DeleteRequest) -> HandlerResult<()> {
        Err(unwilling("delete"))
    }

    async fn modify(&self, _ctx: &RequestContext, _request: &ModifyRequest) -> HandlerResult<()> {
        Err(unwilling("modify"))
    }

    async fn modify_dn(&self, _ctx: &RequestContext, _request: &ModifyDnRequest) -> HandlerResult<()> {
        Err(unwilling("modify DN"))
    }

    /// `true` answers compareTrue, `false` compareFalse.
    async fn compare(&self, _ctx: &RequestContext, _request: &CompareRequest) -> HandlerResult<bool> {
        Err(unwilling("compare"))
    }

    async fn search(&self, _ctx: &RequestContext, _request: &SearchRequest) -> HandlerResult<Vec<Entry>> {
        Err(unwilling("search"))
    }

    /// Extended operations the server does not answer itself.
    async fn extended(&self, _ctx: &RequestContext, request: &ExtendedRequest) -> HandlerResult<ExtendedResponse> {
        Err(OperationError::new(
            ResultCode::PROTOCOL_ERROR,
            format!("The extended operation {} is not supported.", request.name),
        ))
    }

    /// Controls this handler honours when a client marks them critical.
    fn supported_controls(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Answers every directory operation with `unwillingToPerform`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericRequestHandler;

impl RequestHandler for GenericRequestHandler {}

#[async_trait]
pub trait PagingHandler: Send + Sync {
    async fn page(&self, ctx: &RequestContext, request: &PagingRequest) -> HandlerResult<PagingResponse>;

    /// The client abandoned the search or it completed.
    async fn remove(&self, _ctx: &RequestContext, _request: &PagingRequest) {}
}

/// Pages over a [`RequestHandler`]'s search results, re-running the search
/// for each page and slicing at the request's offset.
pub struct SearchPagingHandler {
    handler: Arc<dyn RequestHandler>,
}

impl SearchPagingHandler {
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl PagingHandler for SearchPagingHandler {
    async fn page(&self, ctx: &RequestContext, request: &PagingRequest) -> HandlerResult<PagingResponse> {
        let entries = self.handler.search(ctx, &request.search).await?;
        let total = entries.len();
        let size = usize::try_from(request.control.size).unwrap_or(0);
        let page: Vec<Entry> = entries.into_iter().skip(request.offset).take(size).collect();
        let estimate = i32::try_from(total).unwrap_or(i32::MAX);
        if request.offset + page.len() >= total {
            Ok(PagingResponse::last(page).with_size_estimate(estimate))
        } else {
            Ok(PagingResponse::page(page).with_size_estimate(estimate))
        }
    }
}

/// Adjusts the Root DSE the server built from its own configuration.
#[async_trait]
pub trait RootDseHandler: Send + Sync {
    async fn root_dse(&self, ctx: &RequestContext, request: &SearchRequest, entry: Entry) -> HandlerResult<Entry>;
}

/// Credential check for simple and SASL PLAIN binds.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn bind(&self, username: &str, password: &[u8]) -> bool;
}

/// Accounts from the `users` section of the configuration. A user matches
/// on its DN (case-insensitive) or its SASL username.
#[derive(Default)]
pub struct StaticAuthorizer {
    passwords: HashMap<String, String>,
}

impl StaticAuthorizer {
    pub fn new(users: &[UserConfig]) -> Self {
        let mut passwords = HashMap::new();
        for user in users {
            passwords.insert(user.dn.to_ascii_lowercase(), user.password.clone());
            if let Some(name) = &user.username {
                passwords.insert(name.clone(), user.password.clone());
            }
        }
        Self { passwords }
    }

    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn bind(&self, username: &str, password: &[u8]) -> bool {
        let stored = self
            .passwords
            .get(username)
            .or_else(|| self.passwords.get(&username.to_ascii_lowercase()));
        matches!(stored, Some(p) if !password.is_empty() && p.as_bytes() == password)
    }
}
