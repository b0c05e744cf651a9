// Well-known extended operations and unsolicited notifications

use super::request::ExtendedRequest;
use super::response::{ExtendedResponse, LdapResult};
use super::{children, int32, octets, string, StringKind};
use crate::asn1::{self, Asn1, TagClass};
use crate::error::ProtocolError;
use crate::result_code::ResultCode;

pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
pub const PASSWORD_MODIFY_OID: &str = "1.3.6.1.4.1.4203.1.11.1";
pub const CANCEL_OID: &str = "1.3.6.1.1.8";
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

pub fn start_tls_request() -> ExtendedRequest {
    ExtendedRequest::new(START_TLS_OID, None)
}

pub fn whoami_request() -> ExtendedRequest {
    ExtendedRequest::new(WHOAMI_OID, None)
}

/// Authorization identity answer to a Who Am I request (`dn:...`, `u:...`,
/// or empty for anonymous).
pub fn whoami_response(authz_id: &str) -> ExtendedResponse {
    let mut response = ExtendedResponse::new(LdapResult::success());
    response.value = Some(authz_id.as_bytes().to_vec());
    response
}

/// The unsolicited notice a server sends (with message ID 0) before it drops
/// the connection.
pub fn notice_of_disconnection(code: ResultCode, message: impl Into<String>) -> ExtendedResponse {
    let mut response = ExtendedResponse::new(LdapResult::new(code, message));
    response.name = Some(NOTICE_OF_DISCONNECTION_OID.to_string());
    response
}

/// `PasswdModifyRequestValue ::= SEQUENCE { userIdentity [0], oldPasswd [1], newPasswd [2] }`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PasswordModifyRequest {
    pub user_identity: Option<String>,
    pub old_password: Option<Vec<u8>>,
    pub new_password: Option<Vec<u8>>,
}

impl PasswordModifyRequest {
    pub fn to_request(&self) -> ExtendedRequest {
        let mut parts = Vec::new();
        if let Some(user) = &self.user_identity {
            parts.push(Asn1::string(user).context(0));
        }
        if let Some(old) = &self.old_password {
            parts.push(Asn1::octet_string(old.clone()).context(1));
        }
        if let Some(new) = &self.new_password {
            parts.push(Asn1::octet_string(new.clone()).context(2));
        }
        ExtendedRequest::new(PASSWORD_MODIFY_OID, Some(asn1::encode(&Asn1::sequence(parts))))
    }

    pub fn from_request(request: &ExtendedRequest) -> Result<Self, ProtocolError> {
        let mut decoded = PasswordModifyRequest::default();
        let Some(value) = request.value.as_deref() else {
            return Ok(decoded);
        };
        for part in children(&asn1::decode_nested(value)?, "password modify request")? {
            match (part.class, part.tag) {
                (TagClass::Context, 0) if decoded.user_identity.is_none() => {
                    decoded.user_identity = Some(string(&part, StringKind::LdapString, "userIdentity")?)
                }
                (TagClass::Context, 1) if decoded.old_password.is_none() => {
                    decoded.old_password = Some(octets(&part, "oldPasswd")?)
                }
                (TagClass::Context, 2) if decoded.new_password.is_none() => {
                    decoded.new_password = Some(octets(&part, "newPasswd")?)
                }
                _ => return Err(ProtocolError::new("unexpected element in password modify request")),
            }
        }
        Ok(decoded)
    }
}

/// `PasswdModifyResponseValue ::= SEQUENCE { genPasswd [0] OPTIONAL }`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PasswordModifyResponse {
    pub generated_password: Option<Vec<u8>>,
}

impl PasswordModifyResponse {
    pub fn to_response(&self, result: LdapResult) -> ExtendedResponse {
        let mut response = ExtendedResponse::new(result);
        if let Some(generated) = &self.generated_password {
            response.value = Some(asn1::encode(&Asn1::sequence(vec![
                Asn1::octet_string(generated.clone()).context(0),
            ])));
        }
        response
    }

    pub fn from_response(response: &ExtendedResponse) -> Result<Self, ProtocolError> {
        let Some(value) = response.value.as_deref() else {
            return Ok(PasswordModifyResponse::default());
        };
        let parts = children(&asn1::decode_nested(value)?, "password modify response")?;
        match parts.as_slice() {
            [] => Ok(PasswordModifyResponse::default()),
            [gen] if gen.is(TagClass::Context, 0) => Ok(PasswordModifyResponse {
                generated_password: Some(octets(gen, "genPasswd")?),
            }),
            _ => Err(ProtocolError::new("unexpected element in password modify response")),
        }
    }
}

/// `cancelRequestValue ::= SEQUENCE { cancelID MessageID }` (RFC 3909)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    pub message_id: i32,
}

impl CancelRequest {
    pub fn to_request(&self) -> ExtendedRequest {
        ExtendedRequest::new(
            CANCEL_OID,
            Some(asn1::encode(&Asn1::sequence(vec![Asn1::integer(self.message_id as i64)]))),
        )
    }

    pub fn from_request(request: &ExtendedRequest) -> Result<Self, ProtocolError> {
        let value = request
            .value
            .as_deref()
            .ok_or_else(|| ProtocolError::new("cancel request without a value"))?;
        let parts = children(&asn1::decode_nested(value)?, "cancel request")?;
        match parts.as_slice() {
            [id] => Ok(CancelRequest {
                message_id: int32(id, "cancelID")?,
            }),
            _ => Err(ProtocolError::new("cancel request must hold exactly one message ID")),
        }
    }
}
