// LDAPMessage envelope: message ID, protocol operation, controls

use std::fmt;

use super::control::{Control, TypedControl};
use super::registry::{CustomOp, OperationKind, OperationRegistry};
use super::sync_info::SyncInfo;
use super::{children, integer, op_tag, FromAsn1, ToAsn1};
use super::{
    AbandonRequest, AddRequest, BindRequest, BindResponse, CompareRequest, DeleteRequest, ExtendedRequest,
    ExtendedResponse, IntermediateResponse, LdapResult, ModifyDnRequest, ModifyRequest, SearchRequest,
    SearchResultEntry, SearchResultReference, UnbindRequest,
};
use crate::asn1::{self, tag, Asn1, TagClass};
use crate::error::ProtocolError;

const CONTROLS_TAG: u32 = 0;

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(SearchResultReference),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DeleteRequest(DeleteRequest),
    DeleteResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(AbandonRequest),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
    /// An operation decoded by a type registered at runtime.
    Custom(CustomOp),
}

impl ProtocolOp {
    pub fn tag(&self) -> u32 {
        match self {
            ProtocolOp::BindRequest(_) => op_tag::BIND_REQUEST,
            ProtocolOp::BindResponse(_) => op_tag::BIND_RESPONSE,
            ProtocolOp::UnbindRequest => op_tag::UNBIND_REQUEST,
            ProtocolOp::SearchRequest(_) => op_tag::SEARCH_REQUEST,
            ProtocolOp::SearchResultEntry(_) => op_tag::SEARCH_RESULT_ENTRY,
            ProtocolOp::SearchResultReference(_) => op_tag::SEARCH_RESULT_REFERENCE,
            ProtocolOp::SearchResultDone(_) => op_tag::SEARCH_RESULT_DONE,
            ProtocolOp::ModifyRequest(_) => op_tag::MODIFY_REQUEST,
            ProtocolOp::ModifyResponse(_) => op_tag::MODIFY_RESPONSE,
            ProtocolOp::AddRequest(_) => op_tag::ADD_REQUEST,
            ProtocolOp::AddResponse(_) => op_tag::ADD_RESPONSE,
            ProtocolOp::DeleteRequest(_) => op_tag::DELETE_REQUEST,
            ProtocolOp::DeleteResponse(_) => op_tag::DELETE_RESPONSE,
            ProtocolOp::ModifyDnRequest(_) => op_tag::MODIFY_DN_REQUEST,
            ProtocolOp::ModifyDnResponse(_) => op_tag::MODIFY_DN_RESPONSE,
            ProtocolOp::CompareRequest(_) => op_tag::COMPARE_REQUEST,
            ProtocolOp::CompareResponse(_) => op_tag::COMPARE_RESPONSE,
            ProtocolOp::AbandonRequest(_) => op_tag::ABANDON_REQUEST,
            ProtocolOp::ExtendedRequest(_) => op_tag::EXTENDED_REQUEST,
            ProtocolOp::ExtendedResponse(_) => op_tag::EXTENDED_RESPONSE,
            ProtocolOp::IntermediateResponse(_) => op_tag::INTERMEDIATE_RESPONSE,
            ProtocolOp::Custom(op) => op.tag,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            ProtocolOp::BindRequest(_)
            | ProtocolOp::UnbindRequest
            | ProtocolOp::SearchRequest(_)
            | ProtocolOp::ModifyRequest(_)
            | ProtocolOp::AddRequest(_)
            | ProtocolOp::DeleteRequest(_)
            | ProtocolOp::ModifyDnRequest(_)
            | ProtocolOp::CompareRequest(_)
            | ProtocolOp::AbandonRequest(_)
            | ProtocolOp::ExtendedRequest(_) => OperationKind::Request,
            ProtocolOp::Custom(op) => op.kind,
            _ => OperationKind::Response,
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind() == OperationKind::Request
    }

    pub fn is_response(&self) -> bool {
        self.kind() == OperationKind::Response
    }

    /// Operation name used in logs and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "bind",
            ProtocolOp::BindResponse(_) => "bind_response",
            ProtocolOp::UnbindRequest => "unbind",
            ProtocolOp::SearchRequest(_) => "search",
            ProtocolOp::SearchResultEntry(_) => "search_entry",
            ProtocolOp::SearchResultReference(_) => "search_reference",
            ProtocolOp::SearchResultDone(_) => "search_done",
            ProtocolOp::ModifyRequest(_) => "modify",
            ProtocolOp::ModifyResponse(_) => "modify_response",
            ProtocolOp::AddRequest(_) => "add",
            ProtocolOp::AddResponse(_) => "add_response",
            ProtocolOp::DeleteRequest(_) => "delete",
            ProtocolOp::DeleteResponse(_) => "delete_response",
            ProtocolOp::ModifyDnRequest(_) => "modify_dn",
            ProtocolOp::ModifyDnResponse(_) => "modify_dn_response",
            ProtocolOp::CompareRequest(_) => "compare",
            ProtocolOp::CompareResponse(_) => "compare_response",
            ProtocolOp::AbandonRequest(_) => "abandon",
            ProtocolOp::ExtendedRequest(_) => "extended",
            ProtocolOp::ExtendedResponse(_) => "extended_response",
            ProtocolOp::IntermediateResponse(_) => "intermediate",
            ProtocolOp::Custom(_) => "custom",
        }
    }

    /// The LDAPResult of a response that carries one.
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::BindResponse(r) => Some(&r.result),
            ProtocolOp::ExtendedResponse(r) => Some(&r.result),
            ProtocolOp::SearchResultDone(r)
            | ProtocolOp::ModifyResponse(r)
            | ProtocolOp::AddResponse(r)
            | ProtocolOp::DeleteResponse(r)
            | ProtocolOp::ModifyDnResponse(r)
            | ProtocolOp::CompareResponse(r) => Some(r),
            _ => None,
        }
    }
}

impl ToAsn1 for ProtocolOp {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        match self {
            ProtocolOp::BindRequest(op) => op.to_asn1(),
            ProtocolOp::BindResponse(op) => op.to_asn1(),
            ProtocolOp::UnbindRequest => UnbindRequest.to_asn1(),
            ProtocolOp::SearchRequest(op) => op.to_asn1(),
            ProtocolOp::SearchResultEntry(op) => op.to_asn1(),
            ProtocolOp::SearchResultReference(op) => op.to_asn1(),
            ProtocolOp::ModifyRequest(op) => op.to_asn1(),
            ProtocolOp::AddRequest(op) => op.to_asn1(),
            ProtocolOp::DeleteRequest(op) => op.to_asn1(),
            ProtocolOp::ModifyDnRequest(op) => op.to_asn1(),
            ProtocolOp::CompareRequest(op) => op.to_asn1(),
            ProtocolOp::AbandonRequest(op) => op.to_asn1(),
            ProtocolOp::ExtendedRequest(op) => op.to_asn1(),
            ProtocolOp::ExtendedResponse(op) => op.to_asn1(),
            ProtocolOp::IntermediateResponse(op) => op.to_asn1(),
            ProtocolOp::Custom(op) => op.to_asn1(),
            ProtocolOp::SearchResultDone(r)
            | ProtocolOp::ModifyResponse(r)
            | ProtocolOp::AddResponse(r)
            | ProtocolOp::DeleteResponse(r)
            | ProtocolOp::ModifyDnResponse(r)
            | ProtocolOp::CompareResponse(r) => Ok(r.to_tagged(self.tag())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub op: ProtocolOp,
    pub controls: Vec<Control>,
}

impl LdapMessage {
    pub fn new(message_id: i32, op: ProtocolOp) -> Self {
        Self {
            message_id,
            op,
            controls: Vec::new(),
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    pub fn with_control(mut self, control: Control) -> Self {
        self.controls.push(control);
        self
    }

    pub fn find_control(&self, oid: &str) -> Option<&Control> {
        self.controls.iter().find(|c| c.oid == oid)
    }

    /// The first control with `T`'s OID, decoded.
    pub fn control<T: TypedControl>(&self) -> Option<Result<T, ProtocolError>> {
        self.find_control(T::OID).map(|c| c.decode_as::<T>())
    }

    /// Sync info carried by an intermediate response, if that is what this is.
    pub fn sync_info(&self) -> Result<Option<SyncInfo>, ProtocolError> {
        match &self.op {
            ProtocolOp::IntermediateResponse(r) => SyncInfo::from_intermediate(r),
            _ => Ok(None),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(asn1::encode(&self.to_asn1()?))
    }

    /// Build a message from a decoded top-level value, resolving the
    /// operation through `registry`.
    pub fn from_asn1_with(asn1: &Asn1, registry: &OperationRegistry) -> Result<Self, ProtocolError> {
        if !asn1.is_universal(tag::SEQUENCE) {
            return Err(ProtocolError::new(format!(
                "LDAP message must be a SEQUENCE, got {:?} [{}]",
                asn1.class, asn1.tag
            )));
        }
        let parts = asn1.children();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(ProtocolError::new(format!(
                "LDAP message must have 2 or 3 elements, got {}",
                parts.len()
            )));
        }
        if !parts[0].is_universal(tag::INTEGER) {
            return Err(ProtocolError::new("message ID must be an integer"));
        }
        let id = integer(&parts[0], "message ID")?;
        let message_id = i32::try_from(id)
            .ok()
            .filter(|id| *id >= 0)
            .ok_or_else(|| ProtocolError::new(format!("message ID out of range: {}", id)))?;

        let op = registry.get_operation(&parts[1])?;

        let controls = match parts.get(2) {
            Some(c) if c.is(TagClass::Context, CONTROLS_TAG) && c.constructed => children(c, "controls")?
                .iter()
                .map(Control::from_asn1)
                .collect::<Result<Vec<_>, _>>()?,
            Some(c) => {
                return Err(ProtocolError::new(format!(
                    "unexpected element {:?} [{}] after protocol operation",
                    c.class, c.tag
                )))
            }
            None => Vec::new(),
        };

        Ok(LdapMessage {
            message_id,
            op,
            controls,
        })
    }

    /// Decode one complete message from bytes using the standard operations.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let asn1 = asn1::decode_nested(bytes)?;
        Self::from_asn1_with(&asn1, &OperationRegistry::new())
    }
}

impl ToAsn1 for LdapMessage {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        let mut parts = vec![Asn1::integer(self.message_id as i64), self.op.to_asn1()?];
        if !self.controls.is_empty() {
            parts.push(
                Asn1::sequence_of(
                    self.controls
                        .iter()
                        .map(ToAsn1::to_asn1)
                        .collect::<Result<Vec<_>, _>>()?,
                )
                .context(CONTROLS_TAG),
            );
        }
        Ok(Asn1::sequence(parts))
    }
}

impl fmt::Display for LdapMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.message_id, self.op.name())?;
        if !self.controls.is_empty() {
            write!(f, " ({} controls)", self.controls.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::control::{PagingControl, PAGING_OID};
    use crate::protocol::{Filter, SearchScope};
    use crate::result_code::ResultCode;

    fn reencode(message: &LdapMessage) -> LdapMessage {
        LdapMessage::decode(&message.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_bind_message_bytes() {
        let message = LdapMessage::new(1, ProtocolOp::BindRequest(BindRequest::simple("", "")));
        assert_eq!(
            message.encode().unwrap(),
            vec![0x30, 0x0C, 0x02, 0x01, 0x01, 0x60, 0x07, 0x02, 0x01, 0x03, 0x04, 0x00, 0x80, 0x00]
        );
        assert_eq!(reencode(&message), message);
    }

    #[test]
    fn test_search_with_controls_roundtrip() {
        let search = SearchRequest::new("dc=example,dc=com", SearchScope::SingleLevel, Filter::any_object());
        let message = LdapMessage::new(5, ProtocolOp::SearchRequest(search))
            .with_control(PagingControl::new(50, vec![]).to_control(true).unwrap());
        let decoded = reencode(&message);
        assert_eq!(decoded, message);
        let paging = decoded.control::<PagingControl>().unwrap().unwrap();
        assert_eq!(paging.size, 50);
        assert!(decoded.find_control(PAGING_OID).unwrap().critical);
    }

    #[test]
    fn test_response_variants_roundtrip() {
        let ops = vec![
            ProtocolOp::SearchResultDone(LdapResult::success()),
            ProtocolOp::ModifyResponse(LdapResult::new(ResultCode::NO_SUCH_OBJECT, "gone")),
            ProtocolOp::AddResponse(LdapResult::success().with_matched_dn("dc=example,dc=com")),
            ProtocolOp::DeleteResponse(LdapResult::success()),
            ProtocolOp::ModifyDnResponse(LdapResult::success()),
            ProtocolOp::CompareResponse(LdapResult::new(ResultCode::COMPARE_TRUE, "")),
            ProtocolOp::UnbindRequest,
        ];
        for op in ops {
            let message = LdapMessage::new(9, op);
            assert_eq!(reencode(&message), message);
        }
    }

    #[test]
    fn test_unmapped_tag_is_protocol_error() {
        let asn1 = Asn1::sequence(vec![Asn1::integer(1), Asn1::sequence(vec![]).application(30)]);
        let err = LdapMessage::from_asn1_with(&asn1, &OperationRegistry::new()).unwrap_err();
        assert!(err.message.contains("30"), "{}", err.message);
    }

    #[test]
    fn test_envelope_grammar_errors() {
        let registry = OperationRegistry::new();
        let not_seq = Asn1::integer(1);
        assert!(LdapMessage::from_asn1_with(&not_seq, &registry).is_err());
        let negative = Asn1::sequence(vec![Asn1::integer(-1), UnbindRequest.to_asn1().unwrap()]);
        assert!(LdapMessage::from_asn1_with(&negative, &registry).is_err());
        let bad_controls = Asn1::sequence(vec![
            Asn1::integer(1),
            UnbindRequest.to_asn1().unwrap(),
            Asn1::string("x").context(1),
        ]);
        assert!(LdapMessage::from_asn1_with(&bad_controls, &registry).is_err());
    }

    #[test]
    fn test_request_response_classification() {
        assert!(ProtocolOp::UnbindRequest.is_request());
        assert!(ProtocolOp::SearchResultDone(LdapResult::success()).is_response());
        assert_eq!(
            ProtocolOp::CompareResponse(LdapResult::success()).result().map(|r| r.code),
            Some(ResultCode::SUCCESS)
        );
        assert!(ProtocolOp::UnbindRequest.result().is_none());
    }
}
