// Virtual list view (draft-ietf-ldapext-ldapv3-vlv)

use super::{nested_value, TypedControl};
use crate::asn1::{self, tag, Asn1, TagClass};
use crate::error::ProtocolError;
use crate::protocol::{children, enumerated, int32, octets};
use crate::result_code::ResultCode;

pub const VLV_OID: &str = "2.16.840.1.113730.3.4.9";
pub const VLV_RESPONSE_OID: &str = "2.16.840.1.113730.3.4.10";

const BY_OFFSET_TAG: u32 = 0;
const GREATER_OR_EQUAL_TAG: u32 = 1;

/// ```text
/// VirtualListViewRequest ::= SEQUENCE {
///     beforeCount INTEGER, afterCount INTEGER,
///     target CHOICE {
///         byOffset [0] SEQUENCE { offset INTEGER, contentCount INTEGER },
///         greaterThanOrEqual [1] AssertionValue },
///     contextID OCTET STRING OPTIONAL }
/// ```
///
/// Exactly one target must be set: `offset` with `count`, or `filter`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VlvControl {
    pub before: i32,
    pub after: i32,
    pub offset: Option<i32>,
    pub count: Option<i32>,
    pub filter: Option<Vec<u8>>,
    pub context_id: Option<Vec<u8>>,
}

impl VlvControl {
    pub fn by_offset(before: i32, after: i32, offset: i32, count: i32) -> Self {
        Self {
            before,
            after,
            offset: Some(offset),
            count: Some(count),
            ..Default::default()
        }
    }

    pub fn by_assertion(before: i32, after: i32, value: impl Into<Vec<u8>>) -> Self {
        Self {
            before,
            after,
            filter: Some(value.into()),
            ..Default::default()
        }
    }

    fn target(&self) -> Result<Asn1, ProtocolError> {
        match (&self.filter, self.offset, self.count) {
            (Some(value), None, None) => Ok(Asn1::octet_string(value.clone()).context(GREATER_OR_EQUAL_TAG)),
            (None, Some(offset), Some(count)) => Ok(Asn1::sequence(vec![
                Asn1::integer(offset as i64),
                Asn1::integer(count as i64),
            ])
            .context(BY_OFFSET_TAG)),
            _ => Err(ProtocolError::new(
                "VLV control needs either an assertion value or an offset with a content count",
            )),
        }
    }
}

impl TypedControl for VlvControl {
    const OID: &'static str = VLV_OID;

    fn from_value(value: Option<&[u8]>) -> Result<Self, ProtocolError> {
        let parts = children(&nested_value(value, "VLV")?, "VLV request")?;
        if parts.len() < 3 || parts.len() > 4 {
            return Err(ProtocolError::new(format!(
                "VLV request must have 3 or 4 elements, got {}",
                parts.len()
            )));
        }
        let mut control = VlvControl {
            before: int32(&parts[0], "beforeCount")?,
            after: int32(&parts[1], "afterCount")?,
            ..Default::default()
        };
        let target = &parts[2];
        match (target.class, target.tag) {
            (TagClass::Context, BY_OFFSET_TAG) => {
                let offsets = children(target, "byOffset")?;
                if offsets.len() != 2 {
                    return Err(ProtocolError::new("byOffset must have 2 elements"));
                }
                control.offset = Some(int32(&offsets[0], "offset")?);
                control.count = Some(int32(&offsets[1], "contentCount")?);
            }
            (TagClass::Context, GREATER_OR_EQUAL_TAG) => {
                control.filter = Some(octets(target, "greaterThanOrEqual")?);
            }
            _ => return Err(ProtocolError::new("unknown VLV target choice")),
        }
        if let Some(context) = parts.get(3) {
            if !context.is_universal(tag::OCTET_STRING) {
                return Err(ProtocolError::new("VLV contextID must be an octet string"));
            }
            control.context_id = Some(octets(context, "contextID")?);
        }
        Ok(control)
    }

    fn to_value(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut parts = vec![
            Asn1::integer(self.before as i64),
            Asn1::integer(self.after as i64),
            self.target()?,
        ];
        if let Some(context) = &self.context_id {
            parts.push(Asn1::octet_string(context.clone()));
        }
        Ok(Some(asn1::encode(&Asn1::sequence(parts))))
    }
}

/// ```text
/// VirtualListViewResponse ::= SEQUENCE {
///     targetPosition INTEGER, contentCount INTEGER,
///     virtualListViewResult ENUMERATED, contextID OCTET STRING OPTIONAL }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvResponseControl {
    pub offset: i32,
    pub count: i32,
    pub result: ResultCode,
    pub context_id: Option<Vec<u8>>,
}

impl TypedControl for VlvResponseControl {
    const OID: &'static str = VLV_RESPONSE_OID;

    fn from_value(value: Option<&[u8]>) -> Result<Self, ProtocolError> {
        let parts = children(&nested_value(value, "VLV response")?, "VLV response")?;
        if parts.len() < 3 || parts.len() > 4 {
            return Err(ProtocolError::new(format!(
                "VLV response must have 3 or 4 elements, got {}",
                parts.len()
            )));
        }
        if !parts[0].is_universal(tag::INTEGER)
            || !parts[1].is_universal(tag::INTEGER)
            || !parts[2].is_universal(tag::ENUMERATED)
        {
            return Err(ProtocolError::new(
                "VLV response must start with targetPosition, contentCount and a result",
            ));
        }
        let result = enumerated(&parts[2], "virtualListViewResult")?;
        let code = i32::try_from(result)
            .map_err(|_| ProtocolError::new(format!("VLV result out of range: {}", result)))?;
        let context_id = match parts.get(3) {
            Some(c) if c.is_universal(tag::OCTET_STRING) => Some(octets(c, "contextID")?),
            Some(_) => return Err(ProtocolError::new("VLV contextID must be an octet string")),
            None => None,
        };
        Ok(VlvResponseControl {
            offset: int32(&parts[0], "targetPosition")?,
            count: int32(&parts[1], "contentCount")?,
            result: ResultCode::new(code),
            context_id,
        })
    }

    fn to_value(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut parts = vec![
            Asn1::integer(self.offset as i64),
            Asn1::integer(self.count as i64),
            Asn1::enumerated(self.result.code() as i64),
        ];
        if let Some(context) = &self.context_id {
            parts.push(Asn1::octet_string(context.clone()));
        }
        Ok(Some(asn1::encode(&Asn1::sequence(parts))))
    }
}
