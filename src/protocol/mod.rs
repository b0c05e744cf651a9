//! LDAPv3 message model (RFC 4511) on top of the Asn1 tree.
//!
//! Every operation, control and payload implements [`FromAsn1`] and
//! [`ToAsn1`]; the registries in [`registry`] and [`control`] pick the right
//! implementation for a decoded tag or OID.

pub mod control;
pub mod entry;
pub mod extended;
pub mod filter;
pub mod message;
pub mod registry;
pub mod request;
pub mod response;
pub mod sync_info;

use crate::asn1::{self, tag, Asn1, TagClass};
use crate::error::ProtocolError;

pub use control::{Control, ControlRegistry, KnownControl, TypedControl};
pub use entry::{Attribute, Change, Entry, ModifyOperation};
pub use filter::Filter;
pub use message::{LdapMessage, ProtocolOp};
pub use registry::OperationRegistry;
pub use request::*;
pub use response::*;
pub use sync_info::SyncInfo;

pub const LDAP_VERSION: i64 = 3;

/// Application tag numbers of the protocolOp CHOICE.
pub mod op_tag {
    pub const BIND_REQUEST: u32 = 0;
    pub const BIND_RESPONSE: u32 = 1;
    pub const UNBIND_REQUEST: u32 = 2;
    pub const SEARCH_REQUEST: u32 = 3;
    pub const SEARCH_RESULT_ENTRY: u32 = 4;
    pub const SEARCH_RESULT_DONE: u32 = 5;
    pub const MODIFY_REQUEST: u32 = 6;
    pub const MODIFY_RESPONSE: u32 = 7;
    pub const ADD_REQUEST: u32 = 8;
    pub const ADD_RESPONSE: u32 = 9;
    pub const DELETE_REQUEST: u32 = 10;
    pub const DELETE_RESPONSE: u32 = 11;
    pub const MODIFY_DN_REQUEST: u32 = 12;
    pub const MODIFY_DN_RESPONSE: u32 = 13;
    pub const COMPARE_REQUEST: u32 = 14;
    pub const COMPARE_RESPONSE: u32 = 15;
    pub const ABANDON_REQUEST: u32 = 16;
    pub const SEARCH_RESULT_REFERENCE: u32 = 19;
    pub const EXTENDED_REQUEST: u32 = 23;
    pub const EXTENDED_RESPONSE: u32 = 24;
    pub const INTERMEDIATE_RESPONSE: u32 = 25;
}

/// Build a typed value from its Asn1 form.
pub trait FromAsn1: Sized {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError>;
}

/// Produce the Asn1 form of a typed value.
pub trait ToAsn1 {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError>;
}

/// Semantic flavour of an LDAP OCTET STRING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringKind {
    LdapString,
    Dn,
    Oid,
}

impl StringKind {
    pub fn validate(self, value: &str) -> bool {
        match self {
            StringKind::LdapString | StringKind::Dn => true,
            StringKind::Oid => is_numeric_oid(value) || is_descriptor(value),
        }
    }
}

fn is_numeric_oid(value: &str) -> bool {
    !value.is_empty()
        && value
            .split('.')
            .all(|arc| !arc.is_empty() && arc.bytes().all(|b| b.is_ascii_digit()))
}

fn is_descriptor(value: &str) -> bool {
    let mut bytes = value.bytes();
    matches!(bytes.next(), Some(b) if b.is_ascii_alphabetic())
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// Children of a SEQUENCE/SET, completing an implicitly tagged one if needed.
pub(crate) fn children(asn1: &Asn1, what: &str) -> Result<Vec<Asn1>, ProtocolError> {
    if let Some(c) = asn1.as_constructed() {
        return Ok(c.children().to_vec());
    }
    if asn1.is_incomplete() && asn1.constructed {
        let completed = asn1::complete(asn1, tag::SEQUENCE)?;
        return Ok(completed.children().to_vec());
    }
    Err(ProtocolError::new(format!("{} must be a constructed value", what)))
}

pub(crate) fn octets(asn1: &Asn1, what: &str) -> Result<Vec<u8>, ProtocolError> {
    if asn1.constructed {
        return Err(ProtocolError::new(format!("{} must be an octet string", what)));
    }
    asn1.as_bytes()
        .map(|b| b.to_vec())
        .ok_or_else(|| ProtocolError::new(format!("{} must be an octet string", what)))
}

pub(crate) fn string(asn1: &Asn1, kind: StringKind, what: &str) -> Result<String, ProtocolError> {
    let bytes = octets(asn1, what)?;
    let value = String::from_utf8(bytes)
        .map_err(|_| ProtocolError::new(format!("{} is not valid UTF-8", what)))?;
    if !kind.validate(&value) {
        return Err(ProtocolError::new(format!("{} is not a valid {:?}: {}", what, kind, value)));
    }
    Ok(value)
}

pub(crate) fn integer(asn1: &Asn1, what: &str) -> Result<i64, ProtocolError> {
    if let Some(i) = asn1.as_integer() {
        return Ok(i);
    }
    if asn1.is_incomplete() && !asn1.constructed {
        if let Some(i) = asn1::complete(asn1, tag::INTEGER)?.as_integer() {
            return Ok(i);
        }
    }
    Err(ProtocolError::new(format!("{} must be an integer", what)))
}

pub(crate) fn int32(asn1: &Asn1, what: &str) -> Result<i32, ProtocolError> {
    let value = integer(asn1, what)?;
    i32::try_from(value).map_err(|_| ProtocolError::new(format!("{} out of range: {}", what, value)))
}

pub(crate) fn enumerated(asn1: &Asn1, what: &str) -> Result<i64, ProtocolError> {
    if let Some(i) = asn1.as_enumerated() {
        return Ok(i);
    }
    if asn1.is_incomplete() && !asn1.constructed {
        if let Some(i) = asn1::complete(asn1, tag::ENUMERATED)?.as_enumerated() {
            return Ok(i);
        }
    }
    Err(ProtocolError::new(format!("{} must be an enumerated value", what)))
}

pub(crate) fn boolean(asn1: &Asn1, what: &str) -> Result<bool, ProtocolError> {
    if let Some(b) = asn1.as_bool() {
        return Ok(b);
    }
    if asn1.is_incomplete() && !asn1.constructed {
        if let Some(b) = asn1::complete(asn1, tag::BOOLEAN)?.as_bool() {
            return Ok(b);
        }
    }
    Err(ProtocolError::new(format!("{} must be a boolean", what)))
}

pub(crate) fn expect_application(asn1: &Asn1, tag: u32, what: &str) -> Result<(), ProtocolError> {
    if asn1.is(TagClass::Application, tag) {
        Ok(())
    } else {
        Err(ProtocolError::new(format!(
            "{} must be tagged [APPLICATION {}], got {:?} [{}]",
            what, tag, asn1.class, asn1.tag
        )))
    }
}

pub(crate) fn child<'a>(children: &'a [Asn1], index: usize, what: &str) -> Result<&'a Asn1, ProtocolError> {
    children
        .get(index)
        .ok_or_else(|| ProtocolError::new(format!("missing {}", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_validation() {
        assert!(StringKind::Oid.validate("1.3.6.1.4.1.4203.1.11.3"));
        assert!(StringKind::Oid.validate("cn"));
        assert!(!StringKind::Oid.validate("1..3"));
        assert!(!StringKind::Oid.validate(""));
        assert!(!StringKind::Oid.validate("-bad"));
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let value = Asn1::octet_string(vec![0xC3, 0x28]);
        assert!(string(&value, StringKind::Dn, "dn").is_err());
    }

    #[test]
    fn test_tagged_integer_is_completed() {
        let value = asn1::decode(&asn1::encode(&Asn1::integer(-5).context(2))).unwrap().0;
        assert_eq!(integer(&value, "x").unwrap(), -5);
        assert!(boolean(&Asn1::integer(1), "flag").is_err());
    }
}
