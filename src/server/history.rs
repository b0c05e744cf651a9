// Per-connection request history

use std::collections::HashSet;
use std::time::Duration;

use super::paging::PagingRequests;
use crate::error::ProtocolError;

/// Message IDs a client has used on this connection, plus its paged searches.
#[derive(Debug)]
pub struct RequestHistory {
    ids: HashSet<i32>,
    paging: PagingRequests,
}

impl RequestHistory {
    pub fn new(paging_ttl: Duration, max_paged_searches: usize) -> Self {
        Self {
            ids: HashSet::new(),
            paging: PagingRequests::new(paging_ttl, max_paged_searches),
        }
    }

    /// Record a message ID. 0 is reserved for unsolicited notifications and
    /// IDs may not be reused on a connection.
    pub fn add_id(&mut self, message_id: i32) -> Result<(), ProtocolError> {
        if message_id == 0 {
            return Err(ProtocolError::new("message ID 0 is reserved for unsolicited notifications"));
        }
        if !self.ids.insert(message_id) {
            return Err(ProtocolError::new(format!("message ID {} was already used", message_id)));
        }
        Ok(())
    }

    pub fn contains(&self, message_id: i32) -> bool {
        self.ids.contains(&message_id)
    }

    pub fn paging(&mut self) -> &mut PagingRequests {
        &mut self.paging
    }
}

impl Default for RequestHistory {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), 16)
    }
}
