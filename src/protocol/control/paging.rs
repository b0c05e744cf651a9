// RFC 2696 simple paged results

use super::{nested_value, TypedControl};
use crate::asn1::{self, Asn1};
use crate::error::ProtocolError;
use crate::protocol::{children, int32, octets};

pub const PAGING_OID: &str = "1.2.840.113556.1.4.319";

/// `realSearchControlValue ::= SEQUENCE { size INTEGER, cookie OCTET STRING }`
///
/// In a request `size` is the page size; in a response it is the server's
/// estimate of the total result count. An empty cookie ends the search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingControl {
    pub size: i32,
    pub cookie: Vec<u8>,
}

impl PagingControl {
    pub fn new(size: i32, cookie: Vec<u8>) -> Self {
        Self { size, cookie }
    }

    pub fn is_last_page(&self) -> bool {
        self.cookie.is_empty()
    }
}

impl TypedControl for PagingControl {
    const OID: &'static str = PAGING_OID;

    fn from_value(value: Option<&[u8]>) -> Result<Self, ProtocolError> {
        let parts = children(&nested_value(value, "paging")?, "paging control value")?;
        if parts.len() != 2 {
            return Err(ProtocolError::new(format!(
                "paging control value must have 2 elements, got {}",
                parts.len()
            )));
        }
        let size = int32(&parts[0], "paging size")?;
        if size < 0 {
            return Err(ProtocolError::new(format!("paging size must not be negative: {}", size)));
        }
        Ok(PagingControl {
            size,
            cookie: octets(&parts[1], "paging cookie")?,
        })
    }

    fn to_value(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        Ok(Some(asn1::encode(&Asn1::sequence(vec![
            Asn1::integer(self.size as i64),
            Asn1::octet_string(self.cookie.clone()),
        ]))))
    }
}
