//! LDAP controls.
//!
//! A [`Control`] is the generic wire form. Typed controls implement
//! [`TypedControl`] and decode the nested BER value on demand; a
//! [`ControlRegistry`] maps OIDs to those decoders.

mod paging;
mod sorting;
mod sync;
mod vlv;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{boolean, children, octets, string, FromAsn1, StringKind, ToAsn1};
use crate::asn1::{self, tag, Asn1};
use crate::error::ProtocolError;

pub use paging::{PagingControl, PAGING_OID};
pub use sorting::{SortKey, SortingControl, SortingResponseControl, SORTING_OID, SORTING_RESPONSE_OID};
pub use sync::{
    SyncDoneControl, SyncMode, SyncRequestControl, SyncState, SyncStateControl, SYNC_DONE_OID,
    SYNC_REQUEST_OID, SYNC_STATE_OID,
};
pub use vlv::{VlvControl, VlvResponseControl, VLV_OID, VLV_RESPONSE_OID};

pub const MANAGE_DSA_IT_OID: &str = "2.16.840.1.113730.3.4.2";

/// `Control ::= SEQUENCE { controlType, criticality DEFAULT FALSE, controlValue OPTIONAL }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(oid: impl Into<String>, critical: bool, value: Option<Vec<u8>>) -> Self {
        Self {
            oid: oid.into(),
            critical,
            value,
        }
    }

    /// Decode the value as a typed control. The OID must match.
    pub fn decode_as<T: TypedControl>(&self) -> Result<T, ProtocolError> {
        if self.oid != T::OID {
            return Err(ProtocolError::new(format!(
                "control {} cannot be decoded as {}",
                self.oid,
                T::OID
            )));
        }
        T::from_value(self.value.as_deref())
    }

    pub fn is<T: TypedControl>(&self) -> bool {
        self.oid == T::OID
    }
}

impl ToAsn1 for Control {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        let mut parts = vec![Asn1::string(&self.oid)];
        if self.critical {
            parts.push(Asn1::boolean(true));
        }
        if let Some(value) = &self.value {
            parts.push(Asn1::octet_string(value.clone()));
        }
        Ok(Asn1::sequence(parts))
    }
}

impl FromAsn1 for Control {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "control")?;
        let oid = match parts.first() {
            Some(first) if first.is_universal(tag::OCTET_STRING) => {
                string(first, StringKind::Oid, "control type")?
            }
            Some(_) => return Err(ProtocolError::new("control type must be an octet string")),
            None => return Err(ProtocolError::new("control is missing its type")),
        };

        let mut critical = false;
        let mut value = None;
        for (i, part) in parts.iter().enumerate().skip(1) {
            if part.is_universal(tag::BOOLEAN) && i == 1 {
                critical = boolean(part, "criticality")?;
            } else if part.is_universal(tag::OCTET_STRING) && value.is_none() && i == parts.len() - 1 {
                value = Some(octets(part, "control value")?);
            } else {
                return Err(ProtocolError::new(format!(
                    "unexpected element in control {}",
                    oid
                )));
            }
        }
        Ok(Control { oid, critical, value })
    }
}

/// A control with a known OID and a structured value.
pub trait TypedControl: Sized + Send + Sync + 'static {
    const OID: &'static str;

    /// Decode from the raw control value (the content of the OCTET STRING).
    fn from_value(value: Option<&[u8]>) -> Result<Self, ProtocolError>;

    /// Encode the raw control value.
    fn to_value(&self) -> Result<Option<Vec<u8>>, ProtocolError>;

    fn to_control(&self, critical: bool) -> Result<Control, ProtocolError> {
        Ok(Control::new(Self::OID, critical, self.to_value()?))
    }
}

/// Decode a control value that must be present and hold one BER value.
pub(crate) fn nested_value(value: Option<&[u8]>, what: &str) -> Result<Asn1, ProtocolError> {
    let bytes = value.ok_or_else(|| ProtocolError::new(format!("{} control has no value", what)))?;
    Ok(asn1::decode_nested(bytes)?)
}

/// RFC 3296 ManageDsaIT; carries no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ManageDsaItControl;

impl TypedControl for ManageDsaItControl {
    const OID: &'static str = MANAGE_DSA_IT_OID;

    fn from_value(value: Option<&[u8]>) -> Result<Self, ProtocolError> {
        if value.is_some() {
            return Err(ProtocolError::new("ManageDsaIT control must not have a value"));
        }
        Ok(ManageDsaItControl)
    }

    fn to_value(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        Ok(None)
    }
}

/// A control decoded by a type registered at runtime.
#[derive(Clone)]
pub struct CustomControl {
    pub oid: String,
    pub critical: bool,
    value: Arc<dyn Any + Send + Sync>,
}

impl CustomControl {
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for CustomControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomControl")
            .field("oid", &self.oid)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum KnownControl {
    Paging(PagingControl),
    Sorting(SortingControl),
    SortingResponse(SortingResponseControl),
    Vlv(VlvControl),
    VlvResponse(VlvResponseControl),
    SyncRequest(SyncRequestControl),
    SyncState(SyncStateControl),
    SyncDone(SyncDoneControl),
    ManageDsaIt,
    Custom(CustomControl),
    /// No decoder is registered for the OID.
    Generic(Control),
}

type ControlDecoder = fn(&Control) -> Result<KnownControl, ProtocolError>;

fn decode_custom<T: TypedControl>(control: &Control) -> Result<KnownControl, ProtocolError> {
    let value: T = control.decode_as()?;
    Ok(KnownControl::Custom(CustomControl {
        oid: control.oid.clone(),
        critical: control.critical,
        value: Arc::new(value),
    }))
}

/// OID to decoder table. Built once and passed to whoever decodes messages.
#[derive(Clone)]
pub struct ControlRegistry {
    decoders: HashMap<String, ControlDecoder>,
}

impl ControlRegistry {
    /// A registry with no decoders; every control resolves to `Generic`.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.insert(PAGING_OID, |c| Ok(KnownControl::Paging(c.decode_as()?)));
        registry.insert(SORTING_OID, |c| Ok(KnownControl::Sorting(c.decode_as()?)));
        registry.insert(SORTING_RESPONSE_OID, |c| Ok(KnownControl::SortingResponse(c.decode_as()?)));
        registry.insert(VLV_OID, |c| Ok(KnownControl::Vlv(c.decode_as()?)));
        registry.insert(VLV_RESPONSE_OID, |c| Ok(KnownControl::VlvResponse(c.decode_as()?)));
        registry.insert(SYNC_REQUEST_OID, |c| Ok(KnownControl::SyncRequest(c.decode_as()?)));
        registry.insert(SYNC_STATE_OID, |c| Ok(KnownControl::SyncState(c.decode_as()?)));
        registry.insert(SYNC_DONE_OID, |c| Ok(KnownControl::SyncDone(c.decode_as()?)));
        registry.insert(MANAGE_DSA_IT_OID, |c| {
            c.decode_as::<ManageDsaItControl>()?;
            Ok(KnownControl::ManageDsaIt)
        });
        registry
    }

    fn insert(&mut self, oid: &str, decoder: ControlDecoder) {
        self.decoders.insert(oid.to_string(), decoder);
    }

    /// Register a custom typed control; it resolves to `KnownControl::Custom`.
    pub fn register<T: TypedControl>(&mut self) {
        self.insert(T::OID, decode_custom::<T>);
    }

    pub fn is_registered(&self, oid: &str) -> bool {
        self.decoders.contains_key(oid)
    }

    pub fn resolve(&self, control: &Control) -> Result<KnownControl, ProtocolError> {
        match self.decoders.get(&control.oid) {
            Some(decoder) => decoder(control),
            None => Ok(KnownControl::Generic(control.clone())),
        }
    }

    /// Decode a `Control` SEQUENCE and resolve it by OID.
    pub fn get_control(&self, asn1: &Asn1) -> Result<KnownControl, ProtocolError> {
        self.resolve(&Control::from_asn1(asn1)?)
    }
}

impl Default for ControlRegistry {
    fn default() -> Self {
        Self::new()
    }
}
