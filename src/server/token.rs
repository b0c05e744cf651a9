// Authentication state of a server connection

use std::fmt;

use crate::protocol::{Control, LDAP_VERSION};

/// Produced by a bind strategy; lives until the connection closes or the
/// next bind replaces it.
#[derive(Clone, PartialEq, Eq)]
pub enum Token {
    /// The name, if any, is not authenticated.
    Anonymous { username: Option<String>, version: i64 },
    Bind {
        username: String,
        password: Vec<u8>,
        version: i64,
    },
}

impl Token {
    pub fn anonymous() -> Self {
        Token::Anonymous {
            username: None,
            version: LDAP_VERSION,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Token::Anonymous { .. })
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Token::Anonymous { username, .. } => username.as_deref(),
            Token::Bind { username, .. } => Some(username),
        }
    }

    pub fn version(&self) -> i64 {
        match self {
            Token::Anonymous { version, .. } | Token::Bind { version, .. } => *version,
        }
    }

    /// RFC 4532 authorization identity: `dn:<name>` when bound, empty otherwise.
    pub fn authz_id(&self) -> String {
        match self {
            Token::Bind { username, .. } if username.contains('=') => format!("dn:{}", username),
            Token::Bind { username, .. } => format!("u:{}", username),
            Token::Anonymous { .. } => String::new(),
        }
    }
}

impl Default for Token {
    fn default() -> Self {
        Token::anonymous()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Anonymous { username, version } => f
                .debug_struct("Anonymous")
                .field("username", username)
                .field("version", version)
                .finish(),
            Token::Bind { username, version, .. } => f
                .debug_struct("Bind")
                .field("username", username)
                .field("password", &"<redacted>")
                .field("version", version)
                .finish(),
        }
    }
}

/// What a request handler sees besides the request itself.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub token: Token,
    pub controls: Vec<Control>,
}

impl RequestContext {
    pub fn new(token: Token, controls: Vec<Control>) -> Self {
        Self { token, controls }
    }

    pub fn control(&self, oid: &str) -> Option<&Control> {
        self.controls.iter().find(|c| c.oid == oid)
    }
}
