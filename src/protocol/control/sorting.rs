// RFC 2891 server side sorting

use super::{nested_value, TypedControl};
use crate::asn1::{self, tag, Asn1, TagClass};
use crate::error::ProtocolError;
use crate::protocol::{boolean, children, enumerated, octets, string, StringKind};
use crate::result_code::ResultCode;

pub const SORTING_OID: &str = "1.2.840.113556.1.4.473";
pub const SORTING_RESPONSE_OID: &str = "1.2.840.113556.1.4.474";

const ORDERING_RULE_TAG: u32 = 0;
const REVERSE_ORDER_TAG: u32 = 1;
const RESPONSE_ATTRIBUTE_TAG: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub attribute: String,
    pub ordering_rule: Option<String>,
    pub reverse: bool,
}

impl SortKey {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ordering_rule: None,
            reverse: false,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn with_ordering_rule(mut self, rule: impl Into<String>) -> Self {
        self.ordering_rule = Some(rule.into());
        self
    }

    fn to_asn1(&self) -> Asn1 {
        let mut parts = vec![Asn1::string(&self.attribute)];
        if let Some(rule) = &self.ordering_rule {
            parts.push(Asn1::string(rule).context(ORDERING_RULE_TAG));
        }
        if self.reverse {
            parts.push(Asn1::boolean(true).context(REVERSE_ORDER_TAG));
        }
        Asn1::sequence(parts)
    }

    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "sort key")?;
        let attribute = match parts.first() {
            Some(first) if first.is_universal(tag::OCTET_STRING) => {
                string(first, StringKind::LdapString, "sort key attribute")?
            }
            _ => return Err(ProtocolError::new("sort key must start with an attribute octet string")),
        };
        if attribute.is_empty() {
            return Err(ProtocolError::new("sort key attribute must not be empty"));
        }

        let mut key = SortKey::new(attribute);
        let mut last_tag = None;
        for part in &parts[1..] {
            let ordered = last_tag.map_or(true, |t| part.tag > t);
            match (part.class, part.tag) {
                (TagClass::Context, ORDERING_RULE_TAG) if ordered => {
                    key.ordering_rule = Some(string(part, StringKind::Oid, "ordering rule")?);
                }
                (TagClass::Context, REVERSE_ORDER_TAG) if ordered => {
                    key.reverse = boolean(part, "reverse order")?;
                }
                _ => {
                    return Err(ProtocolError::new(format!(
                        "unrecognized element {:?} [{}] in sort key {}",
                        part.class, part.tag, key.attribute
                    )))
                }
            }
            last_tag = Some(part.tag);
        }
        Ok(key)
    }
}

/// `SortKeyList ::= SEQUENCE OF SEQUENCE { attributeType, orderingRule [0], reverseOrder [1] }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortingControl {
    pub keys: Vec<SortKey>,
}

impl SortingControl {
    pub fn new(keys: Vec<SortKey>) -> Self {
        Self { keys }
    }
}

impl TypedControl for SortingControl {
    const OID: &'static str = SORTING_OID;

    fn from_value(value: Option<&[u8]>) -> Result<Self, ProtocolError> {
        let keys = children(&nested_value(value, "sorting")?, "sort key list")?
            .iter()
            .map(SortKey::from_asn1)
            .collect::<Result<Vec<_>, _>>()?;
        if keys.is_empty() {
            return Err(ProtocolError::new("sort key list must not be empty"));
        }
        Ok(SortingControl { keys })
    }

    fn to_value(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.keys.is_empty() {
            return Err(ProtocolError::new("sorting control needs at least one key"));
        }
        Ok(Some(asn1::encode(&Asn1::sequence_of(
            self.keys.iter().map(SortKey::to_asn1).collect(),
        ))))
    }
}

/// `SortResult ::= SEQUENCE { sortResult ENUMERATED, attributeType [0] OPTIONAL }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortingResponseControl {
    pub result: ResultCode,
    pub attribute: Option<String>,
}

impl TypedControl for SortingResponseControl {
    const OID: &'static str = SORTING_RESPONSE_OID;

    fn from_value(value: Option<&[u8]>) -> Result<Self, ProtocolError> {
        let parts = children(&nested_value(value, "sorting response")?, "sort result")?;
        let result = match parts.first() {
            Some(first) if first.is_universal(tag::ENUMERATED) => enumerated(first, "sort result")?,
            _ => return Err(ProtocolError::new("sort result must start with an enumerated result")),
        };
        let attribute = match &parts[1..] {
            [] => None,
            [attr] if attr.is(TagClass::Context, RESPONSE_ATTRIBUTE_TAG) => {
                Some(String::from_utf8(octets(attr, "sort attribute")?).map_err(|_| {
                    ProtocolError::new("sort result attribute is not valid UTF-8")
                })?)
            }
            _ => return Err(ProtocolError::new("unexpected element in sort result")),
        };
        let code = i32::try_from(result)
            .map_err(|_| ProtocolError::new(format!("sort result out of range: {}", result)))?;
        Ok(SortingResponseControl {
            result: ResultCode::new(code),
            attribute,
        })
    }

    fn to_value(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut parts = vec![Asn1::enumerated(self.result.code() as i64)];
        if let Some(attr) = &self.attribute {
            parts.push(Asn1::string(attr).context(RESPONSE_ATTRIBUTE_TAG));
        }
        Ok(Some(asn1::encode(&Asn1::sequence(parts))))
    }
}
