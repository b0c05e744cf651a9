// Request operations

use super::entry::{Change, Entry};
use super::filter::Filter;
use super::{
    boolean, child, children, enumerated, expect_application, int32, octets, op_tag, string, FromAsn1,
    StringKind, ToAsn1, LDAP_VERSION,
};
use crate::asn1::{Asn1, TagClass};
use crate::error::ProtocolError;

const SIMPLE_AUTH_TAG: u32 = 0;
const SASL_AUTH_TAG: u32 = 3;
const NEW_SUPERIOR_TAG: u32 = 0;
const EXTENDED_REQUEST_NAME_TAG: u32 = 0;
const EXTENDED_REQUEST_VALUE_TAG: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    /// Simple authentication; an empty password is an anonymous or
    /// unauthenticated bind.
    Simple(Vec<u8>),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i64,
    pub name: String,
    pub authentication: BindAuthentication,
}

impl BindRequest {
    pub fn anonymous() -> Self {
        Self::simple("", "")
    }

    pub fn simple(name: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            version: LDAP_VERSION,
            name: name.into(),
            authentication: BindAuthentication::Simple(password.into()),
        }
    }

    pub fn sasl(mechanism: impl Into<String>, credentials: Option<Vec<u8>>) -> Self {
        Self {
            version: LDAP_VERSION,
            name: String::new(),
            authentication: BindAuthentication::Sasl {
                mechanism: mechanism.into(),
                credentials,
            },
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(&self.authentication, BindAuthentication::Simple(p) if p.is_empty())
    }

    pub fn is_simple(&self) -> bool {
        matches!(&self.authentication, BindAuthentication::Simple(p) if !p.is_empty())
    }

    pub fn sasl_mechanism(&self) -> Option<&str> {
        match &self.authentication {
            BindAuthentication::Sasl { mechanism, .. } => Some(mechanism),
            BindAuthentication::Simple(_) => None,
        }
    }
}

impl ToAsn1 for BindRequest {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        let auth = match &self.authentication {
            BindAuthentication::Simple(password) => Asn1::octet_string(password.clone()).context(SIMPLE_AUTH_TAG),
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            } => {
                let mut parts = vec![Asn1::string(mechanism)];
                if let Some(creds) = credentials {
                    parts.push(Asn1::octet_string(creds.clone()));
                }
                Asn1::sequence(parts).context(SASL_AUTH_TAG)
            }
        };
        Ok(Asn1::sequence(vec![Asn1::integer(self.version), Asn1::string(&self.name), auth])
            .application(op_tag::BIND_REQUEST))
    }
}

impl FromAsn1 for BindRequest {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "bind request")?;
        if parts.len() != 3 {
            return Err(ProtocolError::new(format!(
                "bind request must have 3 elements, got {}",
                parts.len()
            )));
        }
        let version = super::integer(&parts[0], "bind version")?;
        let name = string(&parts[1], StringKind::Dn, "bind name")?;
        let auth = &parts[2];
        let authentication = match (auth.class, auth.tag) {
            (TagClass::Context, SIMPLE_AUTH_TAG) => {
                BindAuthentication::Simple(octets(auth, "simple password")?)
            }
            (TagClass::Context, SASL_AUTH_TAG) => {
                let sasl = children(auth, "SASL credentials")?;
                let mechanism = string(child(&sasl, 0, "SASL mechanism")?, StringKind::LdapString, "SASL mechanism")?;
                let credentials = match sasl.get(1) {
                    Some(c) => Some(octets(c, "SASL credentials")?),
                    None => None,
                };
                if sasl.len() > 2 {
                    return Err(ProtocolError::new("SASL credentials have too many elements"));
                }
                BindAuthentication::Sasl {
                    mechanism,
                    credentials,
                }
            }
            (class, tag) => {
                return Err(ProtocolError::new(format!(
                    "unsupported bind authentication choice {:?} [{}]",
                    class, tag
                )))
            }
        };
        Ok(BindRequest {
            version,
            name,
            authentication,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnbindRequest;

impl ToAsn1 for UnbindRequest {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        Ok(Asn1::null().application(op_tag::UNBIND_REQUEST))
    }
}

impl FromAsn1 for UnbindRequest {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        if asn1.constructed || asn1.as_bytes().map_or(false, |b| !b.is_empty()) {
            return Err(ProtocolError::new("unbind request must be an empty primitive"));
        }
        Ok(UnbindRequest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<i64> for SearchScope {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(ProtocolError::new(format!("invalid search scope: {}", value))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBaseObject = 2,
    Always = 3,
}

impl TryFrom<i64> for DerefAliases {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBaseObject),
            3 => Ok(DerefAliases::Always),
            _ => Err(ProtocolError::new(format!("invalid alias dereferencing: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(base_dn: impl Into<String>, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base_dn: base_dn.into(),
            scope,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes: Vec::new(),
        }
    }

    pub fn with_attributes<S: Into<String>>(mut self, attributes: impl IntoIterator<Item = S>) -> Self {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_size_limit(mut self, size_limit: i32) -> Self {
        self.size_limit = size_limit;
        self
    }

    /// A base-scoped read of the Root DSE.
    pub fn is_root_dse(&self) -> bool {
        self.base_dn.is_empty() && self.scope == SearchScope::BaseObject
    }
}

impl ToAsn1 for SearchRequest {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        Ok(Asn1::sequence(vec![
            Asn1::string(&self.base_dn),
            Asn1::enumerated(self.scope as i64),
            Asn1::enumerated(self.deref_aliases as i64),
            Asn1::integer(self.size_limit as i64),
            Asn1::integer(self.time_limit as i64),
            Asn1::boolean(self.types_only),
            self.filter.to_asn1()?,
            Asn1::sequence_of(self.attributes.iter().map(|a| Asn1::string(a)).collect()),
        ])
        .application(op_tag::SEARCH_REQUEST))
    }
}

impl FromAsn1 for SearchRequest {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "search request")?;
        if parts.len() != 8 {
            return Err(ProtocolError::new(format!(
                "search request must have 8 elements, got {}",
                parts.len()
            )));
        }
        let size_limit = int32(&parts[3], "size limit")?;
        let time_limit = int32(&parts[4], "time limit")?;
        if size_limit < 0 || time_limit < 0 {
            return Err(ProtocolError::new("search limits must not be negative"));
        }
        Ok(SearchRequest {
            base_dn: string(&parts[0], StringKind::Dn, "base object")?,
            scope: SearchScope::try_from(enumerated(&parts[1], "scope")?)?,
            deref_aliases: DerefAliases::try_from(enumerated(&parts[2], "deref aliases")?)?,
            size_limit,
            time_limit,
            types_only: boolean(&parts[5], "types only")?,
            filter: Filter::from_asn1(&parts[6])?,
            attributes: children(&parts[7], "attribute selection")?
                .iter()
                .map(|a| string(a, StringKind::LdapString, "attribute selector"))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub dn: String,
    pub changes: Vec<Change>,
}

impl ToAsn1 for ModifyRequest {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        Ok(Asn1::sequence(vec![
            Asn1::string(&self.dn),
            Asn1::sequence_of(
                self.changes
                    .iter()
                    .map(ToAsn1::to_asn1)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        ])
        .application(op_tag::MODIFY_REQUEST))
    }
}

impl FromAsn1 for ModifyRequest {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "modify request")?;
        if parts.len() != 2 {
            return Err(ProtocolError::new("modify request must have 2 elements"));
        }
        Ok(ModifyRequest {
            dn: string(&parts[0], StringKind::Dn, "modify object")?,
            changes: children(&parts[1], "modify changes")?
                .iter()
                .map(Change::from_asn1)
                .collect::<Result<Vec<_>, _>>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: Entry,
}

impl ToAsn1 for AddRequest {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        Ok(Asn1::sequence(vec![Asn1::string(&self.entry.dn), self.entry.attributes_asn1()?])
            .application(op_tag::ADD_REQUEST))
    }
}

impl FromAsn1 for AddRequest {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "add request")?;
        Ok(AddRequest {
            entry: Entry::from_parts(&parts, "add request")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub dn: String,
}

impl ToAsn1 for DeleteRequest {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        Ok(Asn1::string(&self.dn).application(op_tag::DELETE_REQUEST))
    }
}

impl FromAsn1 for DeleteRequest {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        Ok(DeleteRequest {
            dn: string(asn1, StringKind::Dn, "delete request")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub dn: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

impl ToAsn1 for ModifyDnRequest {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        let mut parts = vec![
            Asn1::string(&self.dn),
            Asn1::string(&self.new_rdn),
            Asn1::boolean(self.delete_old_rdn),
        ];
        if let Some(sup) = &self.new_superior {
            parts.push(Asn1::string(sup).context(NEW_SUPERIOR_TAG));
        }
        Ok(Asn1::sequence(parts).application(op_tag::MODIFY_DN_REQUEST))
    }
}

impl FromAsn1 for ModifyDnRequest {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "modify DN request")?;
        if parts.len() < 3 || parts.len() > 4 {
            return Err(ProtocolError::new(format!(
                "modify DN request must have 3 or 4 elements, got {}",
                parts.len()
            )));
        }
        let new_superior = match parts.get(3) {
            Some(p) if p.is(TagClass::Context, NEW_SUPERIOR_TAG) => {
                Some(string(p, StringKind::Dn, "new superior")?)
            }
            Some(p) => {
                return Err(ProtocolError::new(format!(
                    "unexpected modify DN element [{}]",
                    p.tag
                )))
            }
            None => None,
        };
        Ok(ModifyDnRequest {
            dn: string(&parts[0], StringKind::Dn, "entry")?,
            new_rdn: string(&parts[1], StringKind::Dn, "new RDN")?,
            delete_old_rdn: boolean(&parts[2], "delete old RDN")?,
            new_superior,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub dn: String,
    pub attribute: String,
    pub value: Vec<u8>,
}

impl ToAsn1 for CompareRequest {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        Ok(Asn1::sequence(vec![
            Asn1::string(&self.dn),
            Asn1::sequence(vec![Asn1::string(&self.attribute), Asn1::octet_string(self.value.clone())]),
        ])
        .application(op_tag::COMPARE_REQUEST))
    }
}

impl FromAsn1 for CompareRequest {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "compare request")?;
        if parts.len() != 2 {
            return Err(ProtocolError::new("compare request must have 2 elements"));
        }
        let ava = children(&parts[1], "attribute value assertion")?;
        if ava.len() != 2 {
            return Err(ProtocolError::new("attribute value assertion must have 2 elements"));
        }
        Ok(CompareRequest {
            dn: string(&parts[0], StringKind::Dn, "compare entry")?,
            attribute: string(&ava[0], StringKind::LdapString, "compare attribute")?,
            value: octets(&ava[1], "compare value")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbandonRequest {
    pub message_id: i32,
}

impl ToAsn1 for AbandonRequest {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        Ok(Asn1::integer(self.message_id as i64).application(op_tag::ABANDON_REQUEST))
    }
}

impl FromAsn1 for AbandonRequest {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        expect_application(asn1, op_tag::ABANDON_REQUEST, "abandon request")?;
        Ok(AbandonRequest {
            message_id: int32(asn1, "abandon message ID")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

impl ExtendedRequest {
    pub fn new(name: impl Into<String>, value: Option<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl ToAsn1 for ExtendedRequest {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        let mut parts = vec![Asn1::string(&self.name).context(EXTENDED_REQUEST_NAME_TAG)];
        if let Some(value) = &self.value {
            parts.push(Asn1::octet_string(value.clone()).context(EXTENDED_REQUEST_VALUE_TAG));
        }
        Ok(Asn1::sequence(parts).application(op_tag::EXTENDED_REQUEST))
    }
}

impl FromAsn1 for ExtendedRequest {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "extended request")?;
        let name_part = child(&parts, 0, "extended request name")?;
        if !name_part.is(TagClass::Context, EXTENDED_REQUEST_NAME_TAG) {
            return Err(ProtocolError::new("extended request name must be tagged [0]"));
        }
        let value = match parts.get(1) {
            Some(v) if v.is(TagClass::Context, EXTENDED_REQUEST_VALUE_TAG) => {
                Some(octets(v, "extended request value")?)
            }
            Some(_) => return Err(ProtocolError::new("extended request value must be tagged [1]")),
            None => None,
        };
        if parts.len() > 2 {
            return Err(ProtocolError::new("extended request has too many elements"));
        }
        Ok(ExtendedRequest {
            name: string(name_part, StringKind::Oid, "extended request name")?,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn1;

    fn reencode<T: ToAsn1 + FromAsn1>(value: &T) -> T {
        let bytes = asn1::encode(&value.to_asn1().unwrap());
        T::from_asn1(&asn1::decode(&bytes).unwrap().0).unwrap()
    }

    #[test]
    fn test_simple_bind_bytes() {
        let bind = BindRequest::simple("cn=admin", "secret");
        let bytes = asn1::encode(&bind.to_asn1().unwrap());
        let expected = [
            0x60, 0x15, 0x02, 0x01, 0x03, 0x04, 0x08, b'c', b'n', b'=', b'a', b'd', b'm', b'i', b'n', 0x80,
            0x06, b's', b'e', b'c', b'r', b'e', b't',
        ];
        assert_eq!(bytes, expected);
        assert_eq!(reencode(&bind), bind);
        assert!(bind.is_simple());
        assert!(BindRequest::anonymous().is_anonymous());
    }

    #[test]
    fn test_simple_bind_password_is_opaque() {
        let raw = Asn1::sequence(vec![
            Asn1::integer(3),
            Asn1::string("cn=admin"),
            Asn1::octet_string(vec![0xff, 0xfe, 0x00, 0x80]).context(SIMPLE_AUTH_TAG),
        ])
        .application(op_tag::BIND_REQUEST);
        let bind = BindRequest::from_asn1(&raw).unwrap();
        assert_eq!(bind.authentication, BindAuthentication::Simple(vec![0xff, 0xfe, 0x00, 0x80]));
        assert!(bind.is_simple());
        assert_eq!(reencode(&bind), bind);
    }

    #[test]
    fn test_sasl_bind_roundtrip() {
        let bind = BindRequest::sasl("PLAIN", Some(b"\0user\0pass".to_vec()));
        assert_eq!(reencode(&bind), bind);
        assert_eq!(bind.sasl_mechanism(), Some("PLAIN"));
        let no_creds = BindRequest::sasl("EXTERNAL", None);
        assert_eq!(reencode(&no_creds), no_creds);
    }

    #[test]
    fn test_bind_rejects_unknown_auth_choice() {
        let bad = Asn1::sequence(vec![Asn1::integer(3), Asn1::string(""), Asn1::string("x").context(1)])
            .application(0);
        assert!(BindRequest::from_asn1(&bad).is_err());
    }

    #[test]
    fn test_search_request_roundtrip() {
        let search = SearchRequest::new(
            "dc=example,dc=com",
            SearchScope::WholeSubtree,
            Filter::parse("(&(objectClass=person)(uid=j*))").unwrap(),
        )
        .with_attributes(["cn", "mail"])
        .with_size_limit(10);
        assert_eq!(reencode(&search), search);
        assert!(!search.is_root_dse());
    }

    #[test]
    fn test_search_request_rejects_bad_scope() {
        let mut asn1 = SearchRequest::new("", SearchScope::BaseObject, Filter::any_object())
            .to_asn1()
            .unwrap();
        asn1.as_constructed_mut().unwrap().set_child(1, Asn1::enumerated(7));
        assert!(SearchRequest::from_asn1(&asn1).is_err());
    }

    #[test]
    fn test_modify_add_delete_roundtrip() {
        let modify = ModifyRequest {
            dn: "cn=foo,dc=example,dc=com".into(),
            changes: vec![Change::replace("mail", ["foo@example.com"]), Change::delete("phone", Vec::<Vec<u8>>::new())],
        };
        assert_eq!(reencode(&modify), modify);

        let add = AddRequest {
            entry: Entry::new("cn=foo,dc=example,dc=com").with_attribute("cn", ["foo"]),
        };
        assert_eq!(reencode(&add), add);

        let delete = DeleteRequest {
            dn: "cn=foo,dc=example,dc=com".into(),
        };
        assert_eq!(reencode(&delete), delete);
    }

    #[test]
    fn test_modify_dn_compare_abandon_roundtrip() {
        let moddn = ModifyDnRequest {
            dn: "cn=foo,dc=example,dc=com".into(),
            new_rdn: "cn=bar".into(),
            delete_old_rdn: true,
            new_superior: Some("ou=people,dc=example,dc=com".into()),
        };
        assert_eq!(reencode(&moddn), moddn);

        let compare = CompareRequest {
            dn: "cn=foo,dc=example,dc=com".into(),
            attribute: "cn".into(),
            value: b"foo".to_vec(),
        };
        assert_eq!(reencode(&compare), compare);

        let abandon = AbandonRequest { message_id: 42 };
        assert_eq!(asn1::encode(&abandon.to_asn1().unwrap()), vec![0x50, 0x01, 0x2A]);
        assert_eq!(reencode(&abandon), abandon);
    }

    #[test]
    fn test_extended_and_unbind() {
        let ext = ExtendedRequest::new("1.3.6.1.4.1.4203.1.11.3", None);
        assert_eq!(reencode(&ext), ext);
        let ext = ExtendedRequest::new("1.3.6.1.1.8", Some(vec![0x30, 0x03, 0x02, 0x01, 0x05]));
        assert_eq!(reencode(&ext), ext);

        assert_eq!(asn1::encode(&UnbindRequest.to_asn1().unwrap()), vec![0x42, 0x00]);
        assert_eq!(reencode(&UnbindRequest), UnbindRequest);
    }
}
