// Directory data carried by requests and responses: attributes, entries, changes

use super::{child, children, enumerated, octets, string, FromAsn1, StringKind, ToAsn1};
use crate::asn1::Asn1;
use crate::error::ProtocolError;

/// An attribute description with its values (PartialAttribute / Attribute).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new<V: Into<Vec<u8>>>(name: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Values that are valid UTF-8.
    pub fn string_values(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter_map(|v| std::str::from_utf8(v).ok())
            .collect()
    }

    pub fn has_value(&self, value: &[u8]) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

impl ToAsn1 for Attribute {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        Ok(Asn1::sequence(vec![
            Asn1::string(&self.name),
            Asn1::set_of(self.values.iter().map(|v| Asn1::octet_string(v.clone())).collect()),
        ]))
    }
}

impl FromAsn1 for Attribute {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "attribute")?;
        if parts.len() != 2 {
            return Err(ProtocolError::new(format!(
                "attribute must have 2 elements, got {}",
                parts.len()
            )));
        }
        let name = string(&parts[0], StringKind::LdapString, "attribute description")?;
        let values = children(&parts[1], "attribute values")?
            .iter()
            .map(|v| octets(v, "attribute value"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Attribute { name, values })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute<V: Into<Vec<u8>>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.attributes.push(Attribute::new(name, values));
        self
    }

    /// Attribute lookup, case-insensitive on the description.
    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|a| a.values.first())
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub(crate) fn attributes_asn1(&self) -> Result<Asn1, ProtocolError> {
        Ok(Asn1::sequence_of(
            self.attributes
                .iter()
                .map(ToAsn1::to_asn1)
                .collect::<Result<Vec<_>, _>>()?,
        ))
    }

    /// Decode `SEQUENCE { dn, attributes SEQUENCE OF Attribute }` from its children.
    pub(crate) fn from_parts(parts: &[Asn1], what: &str) -> Result<Self, ProtocolError> {
        if parts.len() != 2 {
            return Err(ProtocolError::new(format!(
                "{} must have 2 elements, got {}",
                what,
                parts.len()
            )));
        }
        let dn = string(&parts[0], StringKind::Dn, "entry dn")?;
        let attributes = children(&parts[1], "attribute list")?
            .iter()
            .map(Attribute::from_asn1)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Entry { dn, attributes })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
    /// RFC 4525
    Increment = 3,
}

impl TryFrom<i64> for ModifyOperation {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(ModifyOperation::Add),
            1 => Ok(ModifyOperation::Delete),
            2 => Ok(ModifyOperation::Replace),
            3 => Ok(ModifyOperation::Increment),
            _ => Err(ProtocolError::new(format!("invalid modify operation: {}", value))),
        }
    }
}

/// One element of a ModifyRequest change list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub operation: ModifyOperation,
    pub attribute: Attribute,
}

impl Change {
    pub fn add<V: Into<Vec<u8>>>(name: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::new(ModifyOperation::Add, Attribute::new(name, values))
    }

    pub fn delete<V: Into<Vec<u8>>>(name: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::new(ModifyOperation::Delete, Attribute::new(name, values))
    }

    pub fn replace<V: Into<Vec<u8>>>(name: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::new(ModifyOperation::Replace, Attribute::new(name, values))
    }

    pub fn new(operation: ModifyOperation, attribute: Attribute) -> Self {
        Self { operation, attribute }
    }
}

impl ToAsn1 for Change {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        Ok(Asn1::sequence(vec![
            Asn1::enumerated(self.operation as i64),
            self.attribute.to_asn1()?,
        ]))
    }
}

impl FromAsn1 for Change {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "change")?;
        let operation = ModifyOperation::try_from(enumerated(child(&parts, 0, "modify operation")?, "modify operation")?)?;
        let attribute = Attribute::from_asn1(child(&parts, 1, "modification")?)?;
        Ok(Change { operation, attribute })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn1;

    #[test]
    fn test_attribute_roundtrip() {
        let attr = Attribute::new("objectClass", ["top", "person"]);
        let bytes = asn1::encode(&attr.to_asn1().unwrap());
        let decoded = Attribute::from_asn1(&asn1::decode(&bytes).unwrap().0).unwrap();
        assert_eq!(decoded, attr);
        assert_eq!(decoded.string_values(), vec!["top", "person"]);
    }

    #[test]
    fn test_attribute_requires_two_elements() {
        let bad = Asn1::sequence(vec![Asn1::string("cn")]);
        assert!(Attribute::from_asn1(&bad).is_err());
    }

    #[test]
    fn test_entry_lookup_is_case_insensitive() {
        let entry = Entry::new("cn=foo,dc=example,dc=com").with_attribute("mail", ["foo@example.com"]);
        assert_eq!(entry.first_value("MAIL"), Some("foo@example.com"));
        assert!(entry.get("cn").is_none());
    }

    #[test]
    fn test_change_decode_rejects_unknown_operation() {
        let bad = Asn1::sequence(vec![
            Asn1::enumerated(9),
            Attribute::new("cn", ["x"]).to_asn1().unwrap(),
        ]);
        assert!(Change::from_asn1(&bad).is_err());
        let good = Change::replace("cn", ["x"]);
        assert_eq!(Change::from_asn1(&good.to_asn1().unwrap()).unwrap(), good);
    }
}
