//! ASN.1 value model used by the BER codec.
//!
//! Every node carries its tag (class, number, constructed flag) next to its
//! value. Sequence and Set share one child container; SequenceOf and SetOf
//! are the same container with a different constructor, since their wire
//! form is identical.

pub mod ber;
pub mod length;

pub use ber::{complete, decode, decode_nested, encode};

/// Universal tag numbers understood by the codec.
pub mod tag {
    pub const BOOLEAN: u32 = 1;
    pub const INTEGER: u32 = 2;
    pub const OCTET_STRING: u32 = 4;
    pub const NULL: u32 = 5;
    pub const ENUMERATED: u32 = 10;
    pub const SEQUENCE: u32 = 16;
    pub const SET: u32 = 17;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagClass {
    Universal,
    Application,
    Context,
    Private,
}

impl TagClass {
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => TagClass::Universal,
            1 => TagClass::Application,
            2 => TagClass::Context,
            _ => TagClass::Private,
        }
    }

    pub(crate) fn bits(self) -> u8 {
        match self {
            TagClass::Universal => 0,
            TagClass::Application => 1,
            TagClass::Context => 2,
            TagClass::Private => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructedKind {
    /// Order-significant.
    Sequence,
    /// Order-insignificant.
    Set,
}

/// Ordered children of a constructed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constructed {
    pub kind: ConstructedKind,
    children: Vec<Asn1>,
}

impl Constructed {
    pub fn new(kind: ConstructedKind, children: Vec<Asn1>) -> Self {
        Self { kind, children }
    }

    pub fn child(&self, index: usize) -> Option<&Asn1> {
        self.children.get(index)
    }

    /// Replaces the child at `index`, or appends when `index == count()`.
    pub fn set_child(&mut self, index: usize, value: Asn1) -> bool {
        if index < self.children.len() {
            self.children[index] = value;
            true
        } else if index == self.children.len() {
            self.children.push(value);
            true
        } else {
            false
        }
    }

    pub fn add_child(&mut self, value: Asn1) {
        self.children.push(value);
    }

    pub fn count(&self) -> usize {
        self.children.len()
    }

    pub fn children(&self) -> &[Asn1] {
        &self.children
    }

    pub fn into_children(self) -> Vec<Asn1> {
        self.children
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Enumerated(i64),
    Null,
    OctetString(Vec<u8>),
    Constructed(Constructed),
    /// Raw content octets whose type is only known to the caller.
    Incomplete(Vec<u8>),
}

/// One node of a decoded or to-be-encoded BER tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asn1 {
    pub class: TagClass,
    pub tag: u32,
    pub constructed: bool,
    pub value: Value,
    /// Bytes that followed this value in the decoded buffer (top level only).
    pub trailing_data: Option<Vec<u8>>,
}

impl Asn1 {
    fn universal_value(tag: u32, constructed: bool, value: Value) -> Self {
        Self {
            class: TagClass::Universal,
            tag,
            constructed,
            value,
            trailing_data: None,
        }
    }

    pub fn boolean(value: bool) -> Self {
        Self::universal_value(tag::BOOLEAN, false, Value::Boolean(value))
    }

    pub fn integer(value: i64) -> Self {
        Self::universal_value(tag::INTEGER, false, Value::Integer(value))
    }

    pub fn enumerated(value: i64) -> Self {
        Self::universal_value(tag::ENUMERATED, false, Value::Enumerated(value))
    }

    pub fn null() -> Self {
        Self::universal_value(tag::NULL, false, Value::Null)
    }

    pub fn octet_string(value: impl Into<Vec<u8>>) -> Self {
        Self::universal_value(tag::OCTET_STRING, false, Value::OctetString(value.into()))
    }

    pub fn string(value: &str) -> Self {
        Self::octet_string(value.as_bytes())
    }

    pub fn sequence(children: Vec<Asn1>) -> Self {
        Self::universal_value(
            tag::SEQUENCE,
            true,
            Value::Constructed(Constructed::new(ConstructedKind::Sequence, children)),
        )
    }

    pub fn sequence_of(children: Vec<Asn1>) -> Self {
        Self::sequence(children)
    }

    pub fn set(children: Vec<Asn1>) -> Self {
        Self::universal_value(
            tag::SET,
            true,
            Value::Constructed(Constructed::new(ConstructedKind::Set, children)),
        )
    }

    pub fn set_of(children: Vec<Asn1>) -> Self {
        Self::set(children)
    }

    pub fn incomplete(class: TagClass, tag: u32, constructed: bool, content: Vec<u8>) -> Self {
        Self {
            class,
            tag,
            constructed,
            value: Value::Incomplete(content),
            trailing_data: None,
        }
    }

    /// Implicit re-tag; the constructed flag and value are kept.
    pub fn tagged(mut self, class: TagClass, tag: u32) -> Self {
        self.class = class;
        self.tag = tag;
        self
    }

    pub fn context(self, tag: u32) -> Self {
        self.tagged(TagClass::Context, tag)
    }

    pub fn application(self, tag: u32) -> Self {
        self.tagged(TagClass::Application, tag)
    }

    pub fn private(self, tag: u32) -> Self {
        self.tagged(TagClass::Private, tag)
    }

    pub fn universal(self, tag: u32) -> Self {
        self.tagged(TagClass::Universal, tag)
    }

    /// `[tag] EXPLICIT inner`, used for tagged CHOICE members.
    pub fn explicit_context(tag: u32, inner: Asn1) -> Self {
        Self {
            class: TagClass::Context,
            tag,
            constructed: true,
            value: Value::Constructed(Constructed::new(ConstructedKind::Sequence, vec![inner])),
            trailing_data: None,
        }
    }

    pub fn is(&self, class: TagClass, tag: u32) -> bool {
        self.class == class && self.tag == tag
    }

    pub fn is_universal(&self, tag: u32) -> bool {
        self.is(TagClass::Universal, tag)
    }

    pub fn is_context(&self, tag: u32) -> bool {
        self.is(TagClass::Context, tag)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value {
            Value::Boolean(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.value {
            Value::Integer(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_enumerated(&self) -> Option<i64> {
        match self.value {
            Value::Enumerated(i) => Some(i),
            _ => None,
        }
    }

    /// Octet string content, or the raw content of a primitive incomplete value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            Value::OctetString(b) => Some(b),
            Value::Incomplete(b) if !self.constructed => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_constructed(&self) -> Option<&Constructed> {
        match &self.value {
            Value::Constructed(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_constructed_mut(&mut self) -> Option<&mut Constructed> {
        match &mut self.value {
            Value::Constructed(c) => Some(c),
            _ => None,
        }
    }

    /// Children of a constructed value; empty for primitives.
    pub fn children(&self) -> &[Asn1] {
        match &self.value {
            Value::Constructed(c) => c.children(),
            _ => &[],
        }
    }

    pub fn child(&self, index: usize) -> Option<&Asn1> {
        self.children().get(index)
    }

    pub fn count(&self) -> usize {
        self.children().len()
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self.value, Value::Incomplete(_))
    }

    pub fn take_trailing_data(&mut self) -> Option<Vec<u8>> {
        self.trailing_data.take()
    }
}
