// RFC 4533 Sync Info Message, carried in an IntermediateResponse

use super::response::IntermediateResponse;
use super::{boolean, children, octets, FromAsn1, ToAsn1};
use crate::asn1::{self, tag, Asn1, TagClass};
use crate::error::ProtocolError;

pub const SYNC_INFO_OID: &str = "1.3.6.1.4.1.4203.1.9.1.4";

const NEW_COOKIE_TAG: u32 = 0;
const REFRESH_DELETE_TAG: u32 = 1;
const REFRESH_PRESENT_TAG: u32 = 2;
const SYNC_ID_SET_TAG: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncInfo {
    NewCookie(Vec<u8>),
    RefreshDelete {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    RefreshPresent {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    IdSet {
        cookie: Option<Vec<u8>>,
        refresh_deletes: bool,
        uuids: Vec<Vec<u8>>,
    },
}

impl SyncInfo {
    pub fn cookie(&self) -> Option<&[u8]> {
        match self {
            SyncInfo::NewCookie(c) => Some(c),
            SyncInfo::RefreshDelete { cookie, .. }
            | SyncInfo::RefreshPresent { cookie, .. }
            | SyncInfo::IdSet { cookie, .. } => cookie.as_deref(),
        }
    }

    pub fn to_intermediate(&self) -> Result<IntermediateResponse, ProtocolError> {
        Ok(IntermediateResponse {
            name: Some(SYNC_INFO_OID.to_string()),
            value: Some(asn1::encode(&self.to_asn1()?)),
        })
    }

    /// `None` when the intermediate response is not a sync info message.
    pub fn from_intermediate(response: &IntermediateResponse) -> Result<Option<Self>, ProtocolError> {
        if response.name.as_deref() != Some(SYNC_INFO_OID) {
            return Ok(None);
        }
        let value = response
            .value
            .as_deref()
            .ok_or_else(|| ProtocolError::new("sync info message without a value"))?;
        Ok(Some(SyncInfo::from_asn1(&asn1::decode_nested(value)?)?))
    }
}

/// Shared encoding of the refreshDelete / refreshPresent members:
/// `SEQUENCE { cookie OPTIONAL, refreshDone BOOLEAN DEFAULT TRUE }`.
fn refresh_done_to_asn1(tag: u32, cookie: Option<&[u8]>, refresh_done: bool) -> Asn1 {
    let mut parts = Vec::new();
    if let Some(c) = cookie {
        parts.push(Asn1::octet_string(c.to_vec()));
    }
    if !refresh_done {
        parts.push(Asn1::boolean(false));
    }
    Asn1::sequence(parts).context(tag)
}

fn refresh_done_from_asn1(asn1: &Asn1) -> Result<(Option<Vec<u8>>, bool), ProtocolError> {
    let parts = children(asn1, "sync refresh info")?;
    if parts.len() > 2 {
        return Err(ProtocolError::new("sync refresh info has too many elements"));
    }
    let mut cookie = None;
    let mut refresh_done = true;
    for (i, part) in parts.iter().enumerate() {
        if part.is_universal(tag::OCTET_STRING) && i == 0 {
            cookie = Some(octets(part, "sync cookie")?);
        } else if part.is_universal(tag::BOOLEAN) && i == parts.len() - 1 {
            refresh_done = boolean(part, "refreshDone")?;
        } else {
            return Err(ProtocolError::new("unexpected element in sync refresh info"));
        }
    }
    Ok((cookie, refresh_done))
}

fn id_set_from_asn1(asn1: &Asn1) -> Result<SyncInfo, ProtocolError> {
    let parts = children(asn1, "syncIdSet")?;
    if parts.len() >= 3 {
        return Err(ProtocolError::new(format!(
            "syncIdSet must have at most 2 elements, got {}",
            parts.len()
        )));
    }

    let mut cookie = None;
    let mut refresh_deletes = None;
    let mut uuids = None;
    for part in &parts {
        if part.is_universal(tag::SET) {
            if uuids.is_some() {
                return Err(ProtocolError::new("syncIdSet has more than one syncUUIDs set"));
            }
            let members = part
                .children()
                .iter()
                .map(|m| {
                    if m.is_universal(tag::OCTET_STRING) {
                        octets(m, "syncUUID")
                    } else {
                        Err(ProtocolError::new("syncUUIDs must only contain octet strings"))
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            uuids = Some(members);
        } else if part.is_universal(tag::OCTET_STRING) && cookie.is_none() {
            cookie = Some(octets(part, "sync cookie")?);
        } else if part.is_universal(tag::BOOLEAN) && refresh_deletes.is_none() {
            refresh_deletes = Some(boolean(part, "refreshDeletes")?);
        } else {
            return Err(ProtocolError::new("unexpected element in syncIdSet"));
        }
    }

    Ok(SyncInfo::IdSet {
        cookie,
        refresh_deletes: refresh_deletes.unwrap_or(false),
        uuids: uuids.ok_or_else(|| ProtocolError::new("syncIdSet is missing the syncUUIDs set"))?,
    })
}

impl ToAsn1 for SyncInfo {
    fn to_asn1(&self) -> Result<Asn1, ProtocolError> {
        Ok(match self {
            SyncInfo::NewCookie(cookie) => Asn1::octet_string(cookie.clone()).context(NEW_COOKIE_TAG),
            SyncInfo::RefreshDelete {
                cookie,
                refresh_done,
            } => refresh_done_to_asn1(REFRESH_DELETE_TAG, cookie.as_deref(), *refresh_done),
            SyncInfo::RefreshPresent {
                cookie,
                refresh_done,
            } => refresh_done_to_asn1(REFRESH_PRESENT_TAG, cookie.as_deref(), *refresh_done),
            SyncInfo::IdSet {
                cookie,
                refresh_deletes,
                uuids,
            } => {
                if cookie.is_some() && *refresh_deletes {
                    return Err(ProtocolError::new(
                        "syncIdSet carries either a cookie or refreshDeletes, not both",
                    ));
                }
                let mut parts = Vec::new();
                if let Some(c) = cookie {
                    parts.push(Asn1::octet_string(c.clone()));
                }
                if *refresh_deletes {
                    parts.push(Asn1::boolean(true));
                }
                parts.push(Asn1::set_of(uuids.iter().map(|u| Asn1::octet_string(u.clone())).collect()));
                Asn1::sequence(parts).context(SYNC_ID_SET_TAG)
            }
        })
    }
}

impl FromAsn1 for SyncInfo {
    fn from_asn1(asn1: &Asn1) -> Result<Self, ProtocolError> {
        if asn1.class != TagClass::Context {
            return Err(ProtocolError::new("sync info value must be context tagged"));
        }
        match asn1.tag {
            NEW_COOKIE_TAG => Ok(SyncInfo::NewCookie(octets(asn1, "newcookie")?)),
            REFRESH_DELETE_TAG => {
                let (cookie, refresh_done) = refresh_done_from_asn1(asn1)?;
                Ok(SyncInfo::RefreshDelete {
                    cookie,
                    refresh_done,
                })
            }
            REFRESH_PRESENT_TAG => {
                let (cookie, refresh_done) = refresh_done_from_asn1(asn1)?;
                Ok(SyncInfo::RefreshPresent {
                    cookie,
                    refresh_done,
                })
            }
            SYNC_ID_SET_TAG => id_set_from_asn1(asn1),
            other => Err(ProtocolError::new(format!("unknown sync info choice [{}]", other))),
        }
    }
}
