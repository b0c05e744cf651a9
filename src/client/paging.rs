// Client-side paged search (RFC 2696)

use tracing::debug;

use super::LdapClient;
use crate::error::{OperationError, Result};
use crate::protocol::control::PagingControl;
use crate::protocol::{Control, Entry, SearchRequest, TypedControl};
use crate::result_code::ResultCode;

/// Walks a search one page at a time.
///
/// ```no_run
/// # async fn demo(client: &mut ldap_stack::LdapClient, search: ldap_stack::protocol::SearchRequest) -> ldap_stack::error::Result<()> {
/// let mut paging = ldap_stack::client::Paging::new(client, search);
/// while paging.has_entries() {
///     for entry in paging.get_entries(100).await? {
///         println!("{}", entry.dn);
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Paging<'a> {
    client: &'a mut LdapClient,
    search: SearchRequest,
    controls: Vec<Control>,
    cookie: Vec<u8>,
    size_estimate: Option<i32>,
    started: bool,
    ended: bool,
    critical: bool,
}

impl<'a> Paging<'a> {
    pub fn new(client: &'a mut LdapClient, search: SearchRequest) -> Self {
        Self {
            client,
            search,
            controls: Vec::new(),
            cookie: Vec::new(),
            size_estimate: None,
            started: false,
            ended: false,
            critical: false,
        }
    }

    /// Extra controls sent with every page.
    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    /// Mark the paging control critical: servers without paging support then
    /// fail the search instead of returning everything at once.
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn has_entries(&self) -> bool {
        !self.ended
    }

    /// The server's estimate of the total result size, if it gave one.
    pub fn size_estimate(&self) -> Option<i32> {
        self.size_estimate
    }

    /// The next page of at most `size` entries.
    pub async fn get_entries(&mut self, size: i32) -> Result<Vec<Entry>> {
        if self.ended {
            return Ok(Vec::new());
        }
        let results = self.send(size).await?;
        self.started = true;

        match results.control::<PagingControl>().transpose()? {
            Some(response) => {
                if response.size > 0 {
                    self.size_estimate = Some(response.size);
                }
                self.ended = response.is_last_page();
                self.cookie = response.cookie;
            }
            None if self.critical => {
                self.ended = true;
                return Err(OperationError::new(
                    ResultCode::UNAVAILABLE_CRITICAL_EXTENSION,
                    "server did not return a paging control",
                )
                .into());
            }
            None => {
                debug!("server ignored the paging control; all entries returned");
                self.ended = true;
            }
        }
        Ok(results.entries)
    }

    /// Tell the server to drop the rest of the result set.
    pub async fn abort(&mut self) -> Result<()> {
        if self.started && !self.ended {
            self.send(0).await?;
        }
        self.ended = true;
        self.cookie.clear();
        Ok(())
    }

    async fn send(&mut self, size: i32) -> Result<super::SearchResults> {
        let mut controls = vec![PagingControl::new(size, self.cookie.clone()).to_control(self.critical)?];
        controls.extend(self.controls.iter().cloned());
        self.client.search(self.search.clone(), controls).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{encode, scripted, sent};
    use crate::protocol::{Filter, LdapMessage, LdapResult, ProtocolOp, SearchResultEntry, SearchScope};

    fn search() -> SearchRequest {
        SearchRequest::new("dc=example,dc=com", SearchScope::WholeSubtree, Filter::any_object())
    }

    fn done(id: i32, size: i32, cookie: &[u8]) -> Vec<u8> {
        LdapMessage::new(id, ProtocolOp::SearchResultDone(LdapResult::success()))
            .with_control(PagingControl::new(size, cookie.to_vec()).to_control(false).unwrap())
            .encode()
            .unwrap()
    }

    fn entry(id: i32, dn: &str) -> Vec<u8> {
        encode(id, ProtocolOp::SearchResultEntry(SearchResultEntry { entry: Entry::new(dn) }))
    }

    #[tokio::test]
    async fn test_pages_until_empty_cookie() {
        let (mut client, written) = scripted(vec![
            entry(1, "cn=1"),
            entry(1, "cn=2"),
            done(1, 3, b"next"),
            entry(2, "cn=3"),
            done(2, 0, b""),
        ]);
        let mut paging = Paging::new(&mut client, search());
        assert_eq!(paging.get_entries(2).await.unwrap().len(), 2);
        assert!(paging.has_entries());
        assert_eq!(paging.size_estimate(), Some(3));
        assert_eq!(paging.get_entries(2).await.unwrap().len(), 1);
        assert!(!paging.has_entries());
        assert!(paging.get_entries(2).await.unwrap().is_empty());

        let requests = sent(&written);
        assert_eq!(requests.len(), 2);
        let second = requests[1].control::<PagingControl>().unwrap().unwrap();
        assert_eq!(second.cookie, b"next".to_vec());
        assert_eq!(second.size, 2);
    }

    #[tokio::test]
    async fn test_abort_sends_zero_size() {
        let (mut client, written) = scripted(vec![entry(1, "cn=1"), done(1, 0, b"more"), done(2, 0, b"")]);
        let mut paging = Paging::new(&mut client, search());
        paging.get_entries(1).await.unwrap();
        paging.abort().await.unwrap();
        assert!(!paging.has_entries());
        let abort = sent(&written)[1].control::<PagingControl>().unwrap().unwrap();
        assert_eq!(abort.size, 0);
        assert_eq!(abort.cookie, b"more".to_vec());
    }

    #[tokio::test]
    async fn test_critical_without_server_support() {
        let (mut client, _) = scripted(vec![
            entry(1, "cn=1"),
            encode(1, ProtocolOp::SearchResultDone(LdapResult::success())),
        ]);
        let mut paging = Paging::new(&mut client, search()).critical(true);
        assert!(paging.is_critical());
        assert!(paging.get_entries(10).await.is_err());
        assert!(!paging.has_entries());
    }
}
