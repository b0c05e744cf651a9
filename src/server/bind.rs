//! Server-side bind strategies.
//!
//! A strategy writes the success response itself and hands back the new
//! [`Token`]. On failure it returns an [`OperationError`] without writing
//! anything; the caller answers the client.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::handler::Authorizer;
use super::token::Token;
use crate::error::{LdapError, OperationError, Result};
use crate::protocol::{BindAuthentication, BindRequest, BindResponse, LdapMessage, LdapResult, ProtocolOp, LDAP_VERSION};
use crate::result_code::ResultCode;
use crate::transport::ServerQueue;

pub const SASL_PLAIN: &str = "PLAIN";

#[async_trait]
pub trait Bind: Send + Sync {
    fn supports(&self, request: &BindRequest) -> bool;

    async fn bind(&self, message_id: i32, request: &BindRequest, queue: &mut ServerQueue) -> Result<Token>;
}

fn validate_version(request: &BindRequest) -> Result<(), OperationError> {
    if request.version != LDAP_VERSION {
        return Err(OperationError::new(
            ResultCode::PROTOCOL_ERROR,
            format!("Only LDAP version {} is supported.", LDAP_VERSION),
        ));
    }
    Ok(())
}

async fn send_success(message_id: i32, queue: &mut ServerQueue) -> Result<()> {
    let response = LdapMessage::new(
        message_id,
        ProtocolOp::BindResponse(BindResponse::new(LdapResult::success())),
    );
    queue.send(&response).await
}

fn invalid_credentials() -> LdapError {
    OperationError::new(ResultCode::INVALID_CREDENTIALS, "Invalid credentials.").into()
}

/// Simple bind with an empty password. The name is kept but not checked.
#[derive(Debug, Default)]
pub struct AnonymousBind;

#[async_trait]
impl Bind for AnonymousBind {
    fn supports(&self, request: &BindRequest) -> bool {
        request.is_anonymous()
    }

    async fn bind(&self, message_id: i32, request: &BindRequest, queue: &mut ServerQueue) -> Result<Token> {
        validate_version(request)?;
        send_success(message_id, queue).await?;
        Ok(Token::Anonymous {
            username: Some(request.name.clone()).filter(|n| !n.is_empty()),
            version: request.version,
        })
    }
}

pub struct SimpleBind {
    authorizer: Arc<dyn Authorizer>,
}

impl SimpleBind {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self { authorizer }
    }
}

#[async_trait]
impl Bind for SimpleBind {
    fn supports(&self, request: &BindRequest) -> bool {
        request.is_simple()
    }

    async fn bind(&self, message_id: i32, request: &BindRequest, queue: &mut ServerQueue) -> Result<Token> {
        validate_version(request)?;
        let BindAuthentication::Simple(password) = &request.authentication else {
            return Err(OperationError::new(ResultCode::PROTOCOL_ERROR, "Expected a simple bind.").into());
        };
        if !self.authorizer.bind(&request.name, password).await {
            debug!("simple bind rejected for {}", request.name);
            return Err(invalid_credentials());
        }
        send_success(message_id, queue).await?;
        Ok(Token::Bind {
            username: request.name.clone(),
            password: password.clone(),
            version: request.version,
        })
    }
}

/// RFC 4616 `[authzid] NUL authcid NUL passwd`.
fn parse_plain(credentials: &[u8]) -> Option<(String, Vec<u8>)> {
    let mut parts = credentials.split(|b| *b == 0);
    let _authzid = parts.next()?;
    let authcid = std::str::from_utf8(parts.next()?).ok()?;
    let password = parts.next()?;
    if parts.next().is_some() || authcid.is_empty() {
        return None;
    }
    Some((authcid.to_string(), password.to_vec()))
}

pub struct SaslPlainBind {
    authorizer: Arc<dyn Authorizer>,
}

impl SaslPlainBind {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self { authorizer }
    }
}

#[async_trait]
impl Bind for SaslPlainBind {
    fn supports(&self, request: &BindRequest) -> bool {
        request.sasl_mechanism() == Some(SASL_PLAIN)
    }

    async fn bind(&self, message_id: i32, request: &BindRequest, queue: &mut ServerQueue) -> Result<Token> {
        validate_version(request)?;
        let credentials = match &request.authentication {
            BindAuthentication::Sasl {
                credentials: Some(c), ..
            } => c,
            _ => {
                return Err(OperationError::new(
                    ResultCode::PROTOCOL_ERROR,
                    "SASL PLAIN requires credentials.",
                )
                .into())
            }
        };
        let (username, password) = parse_plain(credentials).ok_or_else(|| {
            OperationError::new(ResultCode::PROTOCOL_ERROR, "Malformed SASL PLAIN credentials.")
        })?;
        if !self.authorizer.bind(&username, &password).await {
            debug!("SASL PLAIN bind rejected for {}", username);
            return Err(invalid_credentials());
        }
        send_success(message_id, queue).await?;
        Ok(Token::Bind {
            username,
            password,
            version: request.version,
        })
    }
}

/// The first strategy that supports the request.
pub fn select<'a>(strategies: &'a [Box<dyn Bind>], request: &BindRequest) -> Result<&'a dyn Bind, OperationError> {
    strategies
        .iter()
        .find(|s| s.supports(request))
        .map(|s| s.as_ref())
        .ok_or_else(|| {
            let mechanism = request.sasl_mechanism().unwrap_or("simple");
            OperationError::new(
                ResultCode::PROTOCOL_ERROR,
                format!("Unsupported authentication mechanism: {}", mechanism),
            )
        })
}
