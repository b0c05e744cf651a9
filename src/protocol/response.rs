// Response operations and the LDAPResult components they share

use super::entry::Entry;
use super::{child, children, enumerated, octets, op_tag, string, FromAsn1, StringKind, ToAsn1};
use crate::asn1::{Asn1, TagClass};
use crate::error::{OperationError, ProtocolError, ReferralError};
use crate::result_code::ResultCode;

const REFERRAL_TAG: u32 = 3;
const SERVER_SASL_CREDS_TAG: u32 = 7;
const EXTENDED_RESPONSE_NAME_TAG: u32 = 10;
const EXTENDED_RESPONSE_VALUE_TAG: u32 = 11;
const INTERMEDIATE_NAME_TAG: u32 = 0;
const INTERMEDIATE_VALUE_TAG: u32 = 1;

/// RFC 4511 4.1.9 LDAPResult.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn new(code: ResultCode, diagnostic_message: impl Into<String>) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.into(),
            referrals: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::SUCCESS, "")
    }

    pub fn with_matched_dn(mut self, dn: impl Into<String>) -> Self {
        self.matched_dn = dn.into();
        self
    }

    pub fn with_referrals(mut self, referrals: Vec<String>) -> Self {
        self.referrals = referrals;
        self
    }

    /// Translate the result into the caller-facing outcome: success-like codes
    /// pass, `referral` becomes a [`ReferralError`], anything else an
    /// [`OperationError`].
    pub fn into_outcome(self) -> Result<LdapResult, crate::error::LdapError> {
        if self.code.is_success() {
            return Ok(self);
        }
        if self.code == ResultCode::REFERRAL {
            return Err(ReferralError {
                referrals: self.referrals,
                message: self.diagnostic_message,
            }
            .into());
        }
        let message = if self.diagnostic_message.is_empty() {
            self.code.description().to_string()
        } else {
            self.diagnostic_message
        };
        Err(OperationError::new(self.code, message).into())
    }

    /// The LDAPResult elements, to be placed at the start of a response body.
    pub(crate) fn components(&self) -> Vec<Asn1> {
        let mut parts = vec![
            Asn1::enumerated(self.code.code() as i64),
            Asn1::string(&self.matched_dn),
            Asn1::string(&self.diagnostic_message),
        ];
        if !self.referrals.is_empty() {
            parts.push(
                Asn1::sequence_of(self.referrals.iter().map(|r| Asn1::string(r)).collect())
                    .context(REFERRAL_TAG),
            );
        }
        parts
    }

    /// Decode the LDAPResult elements from a response body. Returns the result
    /// and the index of the first element after it.
    pub(crate) fn from_components(parts: &[Asn1]) -> Result<(Self, usize), ProtocolError> {
        let code = enumerated(child(parts, 0, "result code")?, "result code")?;
        let code = i32::try_from(code)
            .map_err(|_| ProtocolError::new(format!("result code out of range: {}", code)))?;
        let matched_dn = string(child(parts, 1, "matched DN")?, StringKind::Dn, "matched DN")?;
        let diagnostic_message = string(
            child(parts, 2, "diagnostic message")?,
            StringKind::LdapString,
            "diagnostic message",
        )?;
        let mut next = 3;
        let mut referrals = Vec::new();
        if let Some(r) = parts.get(3).filter(|p| p.is(TagClass::Context, REFERRAL_TAG)) {
            for uri in children(r, "referral")? {
                referrals.push(string(&uri, StringKind::LdapString, "referral URI")?);
            }
            if referrals.is_empty() {
                return Err(ProtocolError::new("referral must contain at least one URI"));
            }
            next = 4;
        }
        Ok((
            LdapResult {
                code: ResultCode::new(code),
                matched_dn,
                diagnostic_message,
                referrals,
            },
            next,
        ))
    }

    pub(crate) fn to_tagged(&self, tag: u32) -> Asn1 {
        Asn1::sequence(self.components()).application(tag)
    }

    pub(crate) fn from_tagged(asn1: &Asn1, what: &str) -> Result<Self, ProtocolError> {
        let parts = children(asn1, what)?;
        let (result, next) = Self::from_components(&parts)?;
        if next != parts.len() {
            return Err(ProtocolError::new(format!("{} has unexpected trailing elements", what)));
        }
        Ok(result)
    }
}

impl Default for LdapResult {
    fn default() -> Self {
        Self::success()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

impl BindResponse {
    pub fn new(result: LdapResult) -> Self {
        Self {
            result,
            server_sasl_creds: None,
        }
    }
}

impl ToAsn1 for BindResponse {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        let mut parts = self.result.components();
        if let Some(creds) = &self.server_sasl_creds {
            parts.push(Asn1::octet_string(creds.clone()).context(SERVER_SASL_CREDS_TAG));
        }
        Ok(Asn1::sequence(parts).application(op_tag::BIND_RESPONSE))
    }
}

impl FromAsn1 for BindResponse {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "bind response")?;
        let (result, next) = LdapResult::from_components(&parts)?;
        let server_sasl_creds = match parts.get(next) {
            Some(p) if p.is(TagClass::Context, SERVER_SASL_CREDS_TAG) => {
                Some(octets(p, "server SASL credentials")?)
            }
            Some(p) => {
                return Err(ProtocolError::new(format!(
                    "unexpected bind response element [{}]",
                    p.tag
                )))
            }
            None => None,
        };
        Ok(BindResponse {
            result,
            server_sasl_creds,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub entry: Entry,
}

impl ToAsn1 for SearchResultEntry {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        Ok(Asn1::sequence(vec![
            Asn1::string(&self.entry.dn),
            self.entry.attributes_asn1()?,
        ])
        .application(op_tag::SEARCH_RESULT_ENTRY))
    }
}

impl FromAsn1 for SearchResultEntry {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "search result entry")?;
        Ok(SearchResultEntry {
            entry: Entry::from_parts(&parts, "search result entry")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultReference {
    pub uris: Vec<String>,
}

impl ToAsn1 for SearchResultReference {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        if self.uris.is_empty() {
            return Err(ProtocolError::new("search result reference needs at least one URI"));
        }
        Ok(Asn1::sequence_of(self.uris.iter().map(|u| Asn1::string(u)).collect())
            .application(op_tag::SEARCH_RESULT_REFERENCE))
    }
}

impl FromAsn1 for SearchResultReference {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let uris = children(asn1, "search result reference")?
            .iter()
            .map(|u| string(u, StringKind::LdapString, "reference URI"))
            .collect::<Result<Vec<_>, _>>()?;
        if uris.is_empty() {
            return Err(ProtocolError::new("search result reference has no URIs"));
        }
        Ok(SearchResultReference { uris })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

impl ExtendedResponse {
    pub fn new(result: LdapResult) -> Self {
        Self {
            result,
            name: None,
            value: None,
        }
    }
}

impl ToAsn1 for ExtendedResponse {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        let mut parts = self.result.components();
        if let Some(name) = &self.name {
            parts.push(Asn1::string(name).context(EXTENDED_RESPONSE_NAME_TAG));
        }
        if let Some(value) = &self.value {
            parts.push(Asn1::octet_string(value.clone()).context(EXTENDED_RESPONSE_VALUE_TAG));
        }
        Ok(Asn1::sequence(parts).application(op_tag::EXTENDED_RESPONSE))
    }
}

impl FromAsn1 for ExtendedResponse {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let parts = children(asn1, "extended response")?;
        let (result, next) = LdapResult::from_components(&parts)?;
        let mut response = ExtendedResponse::new(result);
        for part in &parts[next..] {
            match (part.class, part.tag) {
                (TagClass::Context, EXTENDED_RESPONSE_NAME_TAG) if response.name.is_none() => {
                    response.name = Some(string(part, StringKind::Oid, "response name")?)
                }
                (TagClass::Context, EXTENDED_RESPONSE_VALUE_TAG) if response.value.is_none() => {
                    response.value = Some(octets(part, "response value")?)
                }
                _ => {
                    return Err(ProtocolError::new(format!(
                        "unexpected extended response element [{}]",
                        part.tag
                    )))
                }
            }
        }
        Ok(response)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IntermediateResponse {
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

impl ToAsn1 for IntermediateResponse {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        let mut parts = Vec::new();
        if let Some(name) = &self.name {
            parts.push(Asn1::string(name).context(INTERMEDIATE_NAME_TAG));
        }
        if let Some(value) = &self.value {
            parts.push(Asn1::octet_string(value.clone()).context(INTERMEDIATE_VALUE_TAG));
        }
        Ok(Asn1::sequence(parts).application(op_tag::INTERMEDIATE_RESPONSE))
    }
}

impl FromAsn1 for IntermediateResponse {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        let mut response = IntermediateResponse::default();
        for part in children(asn1, "intermediate response")? {
            match (part.class, part.tag) {
                (TagClass::Context, INTERMEDIATE_NAME_TAG) if response.name.is_none() => {
                    response.name = Some(string(&part, StringKind::Oid, "response name")?)
                }
                (TagClass::Context, INTERMEDIATE_VALUE_TAG) if response.value.is_none() => {
                    response.value = Some(octets(&part, "response value")?)
                }
                _ => {
                    return Err(ProtocolError::new(format!(
                        "unexpected intermediate response element [{}]",
                        part.tag
                    )))
                }
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn1;
    use crate::error::LdapError;

    fn reencode<T: ToAsn1 + FromAsn1>(value: &T) -> T {
        let bytes = asn1::encode(&value.to_asn1().unwrap());
        T::from_asn1(&asn1::decode(&bytes).unwrap().0).unwrap()
    }

    #[test]
    fn test_bind_response_bytes() {
        let resp = BindResponse::new(LdapResult::success());
        let bytes = asn1::encode(&resp.to_asn1().unwrap());
        assert_eq!(bytes, vec![0x61, 0x07, 0x0A, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00]);
    }

    #[test]
    fn test_result_with_referrals_roundtrip() {
        let result = LdapResult::new(ResultCode::REFERRAL, "see other")
            .with_referrals(vec!["ldap://a.example.com/".into(), "ldap://b.example.com/".into()]);
        let asn1 = result.to_tagged(op_tag::SEARCH_RESULT_DONE);
        let bytes = asn1::encode(&asn1);
        let decoded = LdapResult::from_tagged(&asn1::decode(&bytes).unwrap().0, "done").unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn test_result_outcome_translation() {
        assert!(LdapResult::success().into_outcome().is_ok());
        assert!(LdapResult::new(ResultCode::COMPARE_FALSE, "").into_outcome().is_ok());
        match LdapResult::new(ResultCode::REFERRAL, "")
            .with_referrals(vec!["ldap://x/".into()])
            .into_outcome()
        {
            Err(LdapError::Referral(r)) => assert_eq!(r.referrals, vec!["ldap://x/".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
        match LdapResult::new(ResultCode::NO_SUCH_OBJECT, "").into_outcome() {
            Err(LdapError::Operation(e)) => {
                assert_eq!(e.code, ResultCode::NO_SUCH_OBJECT);
                assert_eq!(e.message, ResultCode::NO_SUCH_OBJECT.description());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bind_response_with_sasl_creds() {
        let mut resp = BindResponse::new(LdapResult::new(ResultCode::SASL_BIND_IN_PROGRESS, ""));
        resp.server_sasl_creds = Some(b"challenge".to_vec());
        assert_eq!(reencode(&resp), resp);
    }

    #[test]
    fn test_extended_and_intermediate_roundtrip() {
        let ext = ExtendedResponse {
            result: LdapResult::success(),
            name: Some("1.3.6.1.4.1.4203.1.11.3".into()),
            value: Some(b"dn:cn=admin".to_vec()),
        };
        assert_eq!(reencode(&ext), ext);

        let inter = IntermediateResponse {
            name: Some("1.3.6.1.4.1.4203.1.9.1.4".into()),
            value: None,
        };
        assert_eq!(reencode(&inter), inter);
    }

    #[test]
    fn test_search_entry_and_reference_roundtrip() {
        let entry = SearchResultEntry {
            entry: Entry::new("uid=jdoe,ou=people,dc=example,dc=com")
                .with_attribute("cn", ["John Doe"])
                .with_attribute("objectClass", ["top", "person"]),
        };
        assert_eq!(reencode(&entry), entry);

        let reference = SearchResultReference {
            uris: vec!["ldap://other.example.com/dc=example,dc=com".into()],
        };
        assert_eq!(reencode(&reference), reference);
        assert!(SearchResultReference { uris: vec![] }.to_asn1().is_err());
    }

    #[test]
    fn test_result_missing_elements() {
        let bad = Asn1::sequence(vec![Asn1::enumerated(0), Asn1::string("")]).application(5);
        assert!(LdapResult::from_tagged(&bad, "search done").is_err());
    }
}
