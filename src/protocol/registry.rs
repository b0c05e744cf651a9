// Application tag to operation decoder table

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::message::ProtocolOp;
use super::{op_tag, FromAsn1, ToAsn1};
use super::{
    AbandonRequest, AddRequest, BindRequest, BindResponse, CompareRequest, DeleteRequest, ExtendedRequest,
    ExtendedResponse, IntermediateResponse, LdapResult, ModifyDnRequest, ModifyRequest, SearchRequest,
    SearchResultEntry, SearchResultReference, UnbindRequest,
};
use crate::asn1::{self, Asn1, TagClass};
use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Request,
    Response,
}

/// An operation type that is not part of the standard protocolOp CHOICE.
///
/// `TAG` is the application tag it is carried under.
pub trait Operation: FromAsn1 + ToAsn1 + fmt::Debug + Send + Sync + 'static {
    const TAG: u32;
    const KIND: OperationKind;
}

trait ErasedOperation: fmt::Debug + Send + Sync {
    fn encode(&self) -> Result<Asn1, ProtocolError>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Operation> ErasedOperation for T {
    fn encode(&self) -> Result<Asn1, ProtocolError> {
        self.to_asn1()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A decoded registered operation.
#[derive(Debug, Clone)]
pub struct CustomOp {
    pub tag: u32,
    pub kind: OperationKind,
    value: Arc<dyn ErasedOperation>,
}

impl CustomOp {
    pub fn new<T: Operation>(value: T) -> Self {
        Self {
            tag: T::TAG,
            kind: T::KIND,
            value: Arc::new(value),
        }
    }

    pub fn downcast_ref<T: Operation>(&self) -> Option<&T> {
        self.value.as_any().downcast_ref::<T>()
    }
}

impl ToAsn1 for CustomOp {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        self.value.encode()
    }
}

impl PartialEq for CustomOp {
    fn eq(&self, other: &Self) -> bool {
        if self.tag != other.tag || self.kind != other.kind {
            return false;
        }
        match (self.to_asn1(), other.to_asn1()) {
            (Ok(a), Ok(b)) => asn1::encode(&a) == asn1::encode(&b),
            _ => false,
        }
    }
}

type OperationDecoder = fn(&Asn1) -> Result<ProtocolOp, ProtocolError>;

fn decode_custom<T: Operation>(asn1: &Asn1) -> Result<ProtocolOp, ProtocolError> {
    Ok(ProtocolOp::Custom(CustomOp::new(T::from_asn1(asn1)?)))
}

/// Maps protocolOp application tags to decoders.
///
/// Built once (per server, client or test) and handed to the framing layer;
/// there is no process-wide table.
#[derive(Clone)]
pub struct OperationRegistry {
    decoders: HashMap<u32, (OperationKind, OperationDecoder)>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        use OperationKind::{Request, Response};

        let mut decoders: HashMap<u32, (OperationKind, OperationDecoder)> = HashMap::new();
        decoders.insert(op_tag::BIND_REQUEST, (Request, |a| {
            Ok(ProtocolOp::BindRequest(BindRequest::from_asn1(a)?))
        }));
        decoders.insert(op_tag::BIND_RESPONSE, (Response, |a| {
            Ok(ProtocolOp::BindResponse(BindResponse::from_asn1(a)?))
        }));
        decoders.insert(op_tag::UNBIND_REQUEST, (Request, |a| {
            UnbindRequest::from_asn1(a)?;
            Ok(ProtocolOp::UnbindRequest)
        }));
        decoders.insert(op_tag::SEARCH_REQUEST, (Request, |a| {
            Ok(ProtocolOp::SearchRequest(SearchRequest::from_asn1(a)?))
        }));
        decoders.insert(op_tag::SEARCH_RESULT_ENTRY, (Response, |a| {
            Ok(ProtocolOp::SearchResultEntry(SearchResultEntry::from_asn1(a)?))
        }));
        decoders.insert(op_tag::SEARCH_RESULT_DONE, (Response, |a| {
            Ok(ProtocolOp::SearchResultDone(LdapResult::from_tagged(a, "SearchResultDone")?))
        }));
        decoders.insert(op_tag::SEARCH_RESULT_REFERENCE, (Response, |a| {
            Ok(ProtocolOp::SearchResultReference(SearchResultReference::from_asn1(a)?))
        }));
        decoders.insert(op_tag::MODIFY_REQUEST, (Request, |a| {
            Ok(ProtocolOp::ModifyRequest(ModifyRequest::from_asn1(a)?))
        }));
        decoders.insert(op_tag::MODIFY_RESPONSE, (Response, |a| {
            Ok(ProtocolOp::ModifyResponse(LdapResult::from_tagged(a, "ModifyResponse")?))
        }));
        decoders.insert(op_tag::ADD_REQUEST, (Request, |a| {
            Ok(ProtocolOp::AddRequest(AddRequest::from_asn1(a)?))
        }));
        decoders.insert(op_tag::ADD_RESPONSE, (Response, |a| {
            Ok(ProtocolOp::AddResponse(LdapResult::from_tagged(a, "AddResponse")?))
        }));
        decoders.insert(op_tag::DELETE_REQUEST, (Request, |a| {
            Ok(ProtocolOp::DeleteRequest(DeleteRequest::from_asn1(a)?))
        }));
        decoders.insert(op_tag::DELETE_RESPONSE, (Response, |a| {
            Ok(ProtocolOp::DeleteResponse(LdapResult::from_tagged(a, "DelResponse")?))
        }));
        decoders.insert(op_tag::MODIFY_DN_REQUEST, (Request, |a| {
            Ok(ProtocolOp::ModifyDnRequest(ModifyDnRequest::from_asn1(a)?))
        }));
        decoders.insert(op_tag::MODIFY_DN_RESPONSE, (Response, |a| {
            Ok(ProtocolOp::ModifyDnResponse(LdapResult::from_tagged(a, "ModifyDNResponse")?))
        }));
        decoders.insert(op_tag::COMPARE_REQUEST, (Request, |a| {
            Ok(ProtocolOp::CompareRequest(CompareRequest::from_asn1(a)?))
        }));
        decoders.insert(op_tag::COMPARE_RESPONSE, (Response, |a| {
            Ok(ProtocolOp::CompareResponse(LdapResult::from_tagged(a, "CompareResponse")?))
        }));
        decoders.insert(op_tag::ABANDON_REQUEST, (Request, |a| {
            Ok(ProtocolOp::AbandonRequest(AbandonRequest::from_asn1(a)?))
        }));
        decoders.insert(op_tag::EXTENDED_REQUEST, (Request, |a| {
            Ok(ProtocolOp::ExtendedRequest(ExtendedRequest::from_asn1(a)?))
        }));
        decoders.insert(op_tag::EXTENDED_RESPONSE, (Response, |a| {
            Ok(ProtocolOp::ExtendedResponse(ExtendedResponse::from_asn1(a)?))
        }));
        decoders.insert(op_tag::INTERMEDIATE_RESPONSE, (Response, |a| {
            Ok(ProtocolOp::IntermediateResponse(IntermediateResponse::from_asn1(a)?))
        }));
        Self { decoders }
    }

    /// Register a custom operation type under `T::TAG`.
    ///
    /// The `Operation` bound is the decode/encode contract; on top of it the
    /// tag must not already be mapped.
    pub fn register<T: Operation>(&mut self) -> Result<(), ProtocolError> {
        if self.decoders.contains_key(&T::TAG) {
            return Err(ProtocolError::new(format!(
                "application tag {} is already mapped to an operation",
                T::TAG
            )));
        }
        self.decoders.insert(T::TAG, (T::KIND, decode_custom::<T>));
        Ok(())
    }

    pub fn is_registered(&self, tag: u32) -> bool {
        self.decoders.contains_key(&tag)
    }

    pub fn kind_of(&self, tag: u32) -> Option<OperationKind> {
        self.decoders.get(&tag).map(|(kind, _)| *kind)
    }

    pub fn get_operation(&self, asn1: &Asn1) -> Result<ProtocolOp, ProtocolError> {
        if asn1.class != TagClass::Application {
            return Err(ProtocolError::new(format!(
                "protocol operation must be application tagged, got {:?} [{}]",
                asn1.class, asn1.tag
            )));
        }
        match self.decoders.get(&asn1.tag) {
            Some((_, decoder)) => decoder(asn1),
            None => Err(ProtocolError::new(format!(
                "no operation is mapped to application tag {}",
                asn1.tag
            ))),
        }
    }

    /// Like [`get_operation`](Self::get_operation) but the tag must map to a request.
    pub fn get_request(&self, asn1: &Asn1) -> Result<ProtocolOp, ProtocolError> {
        self.get_of_kind(asn1, OperationKind::Request)
    }

    /// Like [`get_operation`](Self::get_operation) but the tag must map to a response.
    pub fn get_response(&self, asn1: &Asn1) -> Result<ProtocolOp, ProtocolError> {
        self.get_of_kind(asn1, OperationKind::Response)
    }

    fn get_of_kind(&self, asn1: &Asn1, kind: OperationKind) -> Result<ProtocolOp, ProtocolError> {
        match self.kind_of(asn1.tag) {
            Some(k) if k != kind && asn1.class == TagClass::Application => Err(ProtocolError::new(format!(
                "application tag {} is not a {:?}",
                asn1.tag, kind
            ))),
            _ => self.get_operation(asn1),
        }
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
