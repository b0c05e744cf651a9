// Server-side paged search state (RFC 2696)

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::error::OperationError;
use crate::protocol::control::PagingControl;
use crate::protocol::{Control, Entry, SearchRequest};
use crate::result_code::ResultCode;

const COOKIE_LEN: usize = 16;

fn new_cookie() -> Vec<u8> {
    let mut cookie = vec![0u8; COOKIE_LEN];
    rand::thread_rng().fill_bytes(&mut cookie);
    cookie
}

/// One paged search in progress on a connection.
#[derive(Debug, Clone)]
pub struct PagingRequest {
    /// The paging control of the most recent page request.
    pub control: PagingControl,
    pub search: SearchRequest,
    pub controls: Vec<Control>,
    /// Entries already returned by earlier pages.
    pub offset: usize,
    pub iteration: u32,
    next_cookie: Vec<u8>,
    created: Instant,
    last_processed: Instant,
}

impl PagingRequest {
    pub fn new(control: PagingControl, search: SearchRequest, controls: Vec<Control>) -> Self {
        let now = Instant::now();
        Self {
            control,
            search,
            controls,
            offset: 0,
            iteration: 0,
            next_cookie: new_cookie(),
            created: now,
            last_processed: now,
        }
    }

    /// The cookie the client must send to get the page after this one.
    pub fn next_cookie(&self) -> &[u8] {
        &self.next_cookie
    }

    pub fn is_paging_start(&self) -> bool {
        self.iteration <= 1
    }

    /// A size of 0 with a cookie asks the server to drop the search.
    pub fn is_abandon(&self) -> bool {
        self.control.size == 0 && !self.control.cookie.is_empty()
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Same search as the one that started the paging (RFC 2696 3: only the
    /// paging control may change between pages).
    pub fn matches(&self, search: &SearchRequest) -> bool {
        self.search == *search
    }

    pub(crate) fn advance(&mut self, control: PagingControl) {
        self.control = control;
        self.iteration += 1;
        self.last_processed = Instant::now();
    }

    pub(crate) fn finish_page(&mut self, returned: usize) {
        self.offset += returned;
        self.next_cookie = new_cookie();
    }
}

/// What a paging handler returns for one page.
#[derive(Debug, Clone, Default)]
pub struct PagingResponse {
    pub entries: Vec<Entry>,
    /// No more pages follow.
    pub complete: bool,
    /// Estimate of the total result size; 0 when unknown.
    pub size_estimate: i32,
}

impl PagingResponse {
    pub fn page(entries: Vec<Entry>) -> Self {
        Self {
            entries,
            complete: false,
            size_estimate: 0,
        }
    }

    pub fn last(entries: Vec<Entry>) -> Self {
        Self {
            entries,
            complete: true,
            size_estimate: 0,
        }
    }

    pub fn with_size_estimate(mut self, size: i32) -> Self {
        self.size_estimate = size;
        self
    }
}

/// Outstanding paged searches of one connection, keyed by the cookie the
/// client will send back.
#[derive(Debug)]
pub struct PagingRequests {
    requests: HashMap<Vec<u8>, PagingRequest>,
    ttl: Duration,
    limit: usize,
}

impl PagingRequests {
    pub fn new(ttl: Duration, limit: usize) -> Self {
        Self {
            requests: HashMap::new(),
            ttl,
            limit,
        }
    }

    /// Fails with adminLimitExceeded when no further paged search fits.
    pub fn ensure_capacity(&mut self) -> Result<(), OperationError> {
        self.prune();
        if self.requests.len() >= self.limit {
            return Err(OperationError::new(
                ResultCode::ADMIN_LIMIT_EXCEEDED,
                format!("Too many outstanding paged searches (limit {}).", self.limit),
            ));
        }
        Ok(())
    }

    pub fn add(&mut self, request: PagingRequest) -> Result<(), OperationError> {
        self.ensure_capacity()?;
        self.requests.insert(request.next_cookie.clone(), request);
        Ok(())
    }

    /// Take the request waiting for `cookie`, dropping it if it expired.
    pub fn take(&mut self, cookie: &[u8]) -> Option<PagingRequest> {
        self.prune();
        self.requests.remove(cookie)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn prune(&mut self) {
        let ttl = self.ttl;
        self.requests.retain(|_, r| r.last_processed.elapsed() < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Filter, SearchScope};

    fn search() -> SearchRequest {
        SearchRequest::new("dc=example,dc=com", SearchScope::WholeSubtree, Filter::present("objectClass"))
    }

    #[test]
    fn test_cookies_are_random_and_rotate() {
        let mut request = PagingRequest::new(PagingControl::new(10, vec![]), search(), vec![]);
        let first = request.next_cookie().to_vec();
        assert_eq!(first.len(), COOKIE_LEN);
        request.finish_page(10);
        assert_ne!(request.next_cookie(), first.as_slice());
        assert_eq!(request.offset, 10);
    }

    #[test]
    fn test_abandon_detection() {
        let mut request = PagingRequest::new(PagingControl::new(10, vec![]), search(), vec![]);
        assert!(!request.is_abandon());
        request.advance(PagingControl::new(0, b"c".to_vec()));
        assert!(request.is_abandon());
    }

    #[test]
    fn test_take_by_cookie() {
        let mut requests = PagingRequests::new(Duration::from_secs(60), 4);
        let request = PagingRequest::new(PagingControl::new(5, vec![]), search(), vec![]);
        let cookie = request.next_cookie().to_vec();
        requests.add(request).unwrap();
        assert!(requests.take(b"unknown").is_none());
        assert!(requests.take(&cookie).is_some());
        assert!(requests.is_empty());
    }

    #[test]
    fn test_expired_requests_are_dropped() {
        let mut requests = PagingRequests::new(Duration::ZERO, 4);
        let request = PagingRequest::new(PagingControl::new(5, vec![]), search(), vec![]);
        let cookie = request.next_cookie().to_vec();
        requests.add(request).unwrap();
        assert!(requests.take(&cookie).is_none());
    }

    #[test]
    fn test_add_prunes_expired_requests() {
        let mut requests = PagingRequests::new(Duration::ZERO, 4);
        for _ in 0..1000 {
            requests
                .add(PagingRequest::new(PagingControl::new(5, vec![]), search(), vec![]))
                .unwrap();
        }
        assert!(requests.len() <= 1);
    }

    #[test]
    fn test_outstanding_requests_are_capped() {
        let mut requests = PagingRequests::new(Duration::from_secs(60), 2);
        for _ in 0..2 {
            requests
                .add(PagingRequest::new(PagingControl::new(5, vec![]), search(), vec![]))
                .unwrap();
        }
        let err = requests
            .add(PagingRequest::new(PagingControl::new(5, vec![]), search(), vec![]))
            .unwrap_err();
        assert_eq!(err.code, ResultCode::ADMIN_LIMIT_EXCEEDED);
        assert!(requests.ensure_capacity().is_err());
        assert_eq!(requests.len(), 2);
    }
}
