// RFC 4533 content synchronization controls

use super::{nested_value, TypedControl};
use crate::asn1::{self, tag, Asn1};
use crate::error::ProtocolError;
use crate::protocol::{boolean, children, enumerated, octets};

pub const SYNC_REQUEST_OID: &str = "1.3.6.1.4.1.4203.1.9.1.1";
pub const SYNC_STATE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.2";
pub const SYNC_DONE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    RefreshOnly = 1,
    RefreshAndPersist = 3,
}

impl TryFrom<i64> for SyncMode {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(SyncMode::RefreshOnly),
            3 => Ok(SyncMode::RefreshAndPersist),
            _ => Err(ProtocolError::new(format!("invalid sync mode: {}", value))),
        }
    }
}

/// `syncRequestValue ::= SEQUENCE { mode ENUMERATED, cookie OPTIONAL, reloadHint BOOLEAN DEFAULT FALSE }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequestControl {
    pub mode: SyncMode,
    pub cookie: Option<Vec<u8>>,
    pub reload_hint: bool,
}

impl SyncRequestControl {
    pub fn new(mode: SyncMode, cookie: Option<Vec<u8>>) -> Self {
        Self {
            mode,
            cookie,
            reload_hint: false,
        }
    }

    pub fn is_refresh_and_persist(&self) -> bool {
        self.mode == SyncMode::RefreshAndPersist
    }
}

impl TypedControl for SyncRequestControl {
    const OID: &'static str = SYNC_REQUEST_OID;

    fn from_value(value: Option<&[u8]>) -> Result<Self, ProtocolError> {
        let parts = children(&nested_value(value, "sync request")?, "sync request")?;
        let mode = match parts.first() {
            Some(m) if m.is_universal(tag::ENUMERATED) => SyncMode::try_from(enumerated(m, "sync mode")?)?,
            _ => return Err(ProtocolError::new("sync request must start with a mode")),
        };
        let mut control = SyncRequestControl::new(mode, None);
        for (i, part) in parts.iter().enumerate().skip(1) {
            if part.is_universal(tag::OCTET_STRING) && i == 1 {
                control.cookie = Some(octets(part, "sync cookie")?);
            } else if part.is_universal(tag::BOOLEAN) && i == parts.len() - 1 {
                control.reload_hint = boolean(part, "reloadHint")?;
            } else {
                return Err(ProtocolError::new("unexpected element in sync request"));
            }
        }
        Ok(control)
    }

    fn to_value(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut parts = vec![Asn1::enumerated(self.mode as i64)];
        if let Some(cookie) = &self.cookie {
            parts.push(Asn1::octet_string(cookie.clone()));
        }
        if self.reload_hint {
            parts.push(Asn1::boolean(true));
        }
        Ok(Some(asn1::encode(&Asn1::sequence(parts))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Present = 0,
    Add = 1,
    Modify = 2,
    Delete = 3,
}

impl TryFrom<i64> for SyncState {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(SyncState::Present),
            1 => Ok(SyncState::Add),
            2 => Ok(SyncState::Modify),
            3 => Ok(SyncState::Delete),
            _ => Err(ProtocolError::new(format!("invalid sync state: {}", value))),
        }
    }
}

/// `syncStateValue ::= SEQUENCE { state ENUMERATED, entryUUID, cookie OPTIONAL }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateControl {
    pub state: SyncState,
    pub entry_uuid: Vec<u8>,
    pub cookie: Option<Vec<u8>>,
}

impl TypedControl for SyncStateControl {
    const OID: &'static str = SYNC_STATE_OID;

    fn from_value(value: Option<&[u8]>) -> Result<Self, ProtocolError> {
        let parts = children(&nested_value(value, "sync state")?, "sync state")?;
        if parts.len() < 2 || parts.len() > 3 {
            return Err(ProtocolError::new(format!(
                "sync state must have 2 or 3 elements, got {}",
                parts.len()
            )));
        }
        let cookie = match parts.get(2) {
            Some(c) => Some(octets(c, "sync cookie")?),
            None => None,
        };
        Ok(SyncStateControl {
            state: SyncState::try_from(enumerated(&parts[0], "sync state")?)?,
            entry_uuid: octets(&parts[1], "entryUUID")?,
            cookie,
        })
    }

    fn to_value(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut parts = vec![
            Asn1::enumerated(self.state as i64),
            Asn1::octet_string(self.entry_uuid.clone()),
        ];
        if let Some(cookie) = &self.cookie {
            parts.push(Asn1::octet_string(cookie.clone()));
        }
        Ok(Some(asn1::encode(&Asn1::sequence(parts))))
    }
}

/// `syncDoneValue ::= SEQUENCE { cookie OPTIONAL, refreshDeletes BOOLEAN DEFAULT FALSE }`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncDoneControl {
    pub cookie: Option<Vec<u8>>,
    pub refresh_deletes: bool,
}

impl TypedControl for SyncDoneControl {
    const OID: &'static str = SYNC_DONE_OID;

    fn from_value(value: Option<&[u8]>) -> Result<Self, ProtocolError> {
        let parts = children(&nested_value(value, "sync done")?, "sync done")?;
        if parts.len() > 2 {
            return Err(ProtocolError::new("sync done has too many elements"));
        }
        let mut control = SyncDoneControl::default();
        for (i, part) in parts.iter().enumerate() {
            if part.is_universal(tag::OCTET_STRING) && i == 0 {
                control.cookie = Some(octets(part, "sync cookie")?);
            } else if part.is_universal(tag::BOOLEAN) && i == parts.len() - 1 {
                control.refresh_deletes = boolean(part, "refreshDeletes")?;
            } else {
                return Err(ProtocolError::new("unexpected element in sync done"));
            }
        }
        Ok(control)
    }

    fn to_value(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut parts = Vec::new();
        if let Some(cookie) = &self.cookie {
            parts.push(Asn1::octet_string(cookie.clone()));
        }
        if self.refresh_deletes {
            parts.push(Asn1::boolean(true));
        }
        Ok(Some(asn1::encode(&Asn1::sequence(parts))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_request_value() {
        let control = SyncRequestControl::new(SyncMode::RefreshOnly, Some(b"ck".to_vec()));
        let value = control.to_value().unwrap().unwrap();
        assert_eq!(value, vec![0x30, 0x07, 0x0A, 0x01, 0x01, 0x04, 0x02, b'c', b'k']);
        assert_eq!(SyncRequestControl::from_value(Some(&value)).unwrap(), control);
    }

    #[test]
    fn test_sync_request_persist_with_reload_hint() {
        let mut control = SyncRequestControl::new(SyncMode::RefreshAndPersist, None);
        control.reload_hint = true;
        let value = control.to_value().unwrap().unwrap();
        let decoded = SyncRequestControl::from_value(Some(&value)).unwrap();
        assert!(decoded.is_refresh_and_persist());
        assert!(decoded.reload_hint);
        assert_eq!(decoded.cookie, None);
    }

    #[test]
    fn test_sync_request_rejects_bad_mode() {
        let value = asn1::encode(&Asn1::sequence(vec![Asn1::enumerated(2)]));
        assert!(SyncRequestControl::from_value(Some(&value)).is_err());
    }

    #[test]
    fn test_sync_state_roundtrip() {
        let control = SyncStateControl {
            state: SyncState::Modify,
            entry_uuid: vec![0xAB; 16],
            cookie: Some(b"c1".to_vec()),
        };
        let value = control.to_value().unwrap().unwrap();
        assert_eq!(SyncStateControl::from_value(Some(&value)).unwrap(), control);
    }

    #[test]
    fn test_sync_done_roundtrip() {
        let control = SyncDoneControl {
            cookie: Some(b"done".to_vec()),
            refresh_deletes: true,
        };
        let value = control.to_value().unwrap().unwrap();
        assert_eq!(SyncDoneControl::from_value(Some(&value)).unwrap(), control);
        let empty = SyncDoneControl::default().to_value().unwrap().unwrap();
        assert_eq!(SyncDoneControl::from_value(Some(&empty)).unwrap(), SyncDoneControl::default());
    }
}
