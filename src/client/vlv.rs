// Client-side virtual list view (draft-ietf-ldapext-ldapv3-vlv)

use super::LdapClient;
use crate::error::{OperationError, ProtocolError, Result};
use crate::protocol::control::{SortingControl, VlvControl, VlvResponseControl};
use crate::protocol::{Entry, SearchRequest, TypedControl};

/// A sliding window over a sorted result set.
///
/// The window covers `before` entries ahead of the target position and
/// `after` entries behind it. The target is either a 1-based offset or,
/// until the first page is read, an assertion value matched against the
/// first sort key.
pub struct Vlv<'a> {
    client: &'a mut LdapClient,
    search: SearchRequest,
    sort: SortingControl,
    before: i32,
    after: i32,
    offset: i32,
    assertion: Option<Vec<u8>>,
    context_id: Option<Vec<u8>>,
    list_offset: Option<i32>,
    list_size: Option<i32>,
}

impl<'a> Vlv<'a> {
    pub fn new(client: &'a mut LdapClient, search: SearchRequest, sort: SortingControl, after: i32) -> Self {
        Self {
            client,
            search,
            sort,
            before: 0,
            after,
            offset: 1,
            assertion: None,
            context_id: None,
            list_offset: None,
            list_size: None,
        }
    }

    pub fn before_position(mut self, before: i32) -> Self {
        self.before = before;
        self
    }

    pub fn after_position(mut self, after: i32) -> Self {
        self.after = after;
        self
    }

    /// Start the window at the first entry sorting at or after `value`.
    pub fn start_at_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.assertion = Some(value.into());
        self
    }

    pub fn move_to(&mut self, offset: i32) {
        self.assertion = None;
        self.offset = offset.max(1);
    }

    pub fn move_forward(&mut self, count: i32) {
        let offset = self.current_offset().saturating_add(count);
        self.move_to(offset);
    }

    pub fn move_backward(&mut self, count: i32) {
        let offset = self.current_offset().saturating_sub(count);
        self.move_to(offset);
    }

    /// The target position the server reported for the last page.
    pub fn list_offset(&self) -> Option<i32> {
        self.list_offset
    }

    /// The server's estimate of the list size.
    pub fn list_size(&self) -> Option<i32> {
        self.list_size
    }

    pub fn is_at_start(&self) -> bool {
        self.list_offset.map_or(true, |offset| offset - self.before <= 1)
    }

    pub fn is_at_end(&self) -> bool {
        match (self.list_offset, self.list_size) {
            (Some(offset), Some(size)) => offset + self.after >= size,
            _ => false,
        }
    }

    fn current_offset(&self) -> i32 {
        self.list_offset.filter(|_| self.assertion.is_none()).unwrap_or(self.offset)
    }

    fn request_control(&self) -> VlvControl {
        let mut control = match &self.assertion {
            Some(value) => VlvControl::by_assertion(self.before, self.after, value.clone()),
            None => VlvControl::by_offset(self.before, self.after, self.offset, self.list_size.unwrap_or(0)),
        };
        control.context_id = self.context_id.clone();
        control
    }

    /// Read the entries in the current window.
    pub async fn get_entries(&mut self) -> Result<Vec<Entry>> {
        let controls = vec![self.sort.to_control(true)?, self.request_control().to_control(true)?];
        let results = self.client.search(self.search.clone(), controls).await?;
        let response = results
            .control::<VlvResponseControl>()
            .transpose()?
            .ok_or_else(|| ProtocolError::new("server did not return a VLV response control"))?;
        if !response.result.is_success() {
            return Err(OperationError::new(response.result, response.result.description()).into());
        }

        self.list_offset = Some(response.offset);
        self.list_size = Some(response.count);
        self.context_id = response.context_id;
        if self.assertion.take().is_some() {
            self.offset = response.offset.max(1);
        }
        Ok(results.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{scripted, sent};
    use crate::protocol::control::SortKey;
    use crate::protocol::{Filter, LdapMessage, LdapResult, ProtocolOp, SearchScope};
    use crate::result_code::ResultCode;

    fn done(id: i32, offset: i32, count: i32, context: &[u8]) -> Vec<u8> {
        let response = VlvResponseControl {
            offset,
            count,
            result: ResultCode::SUCCESS,
            context_id: Some(context.to_vec()),
        };
        LdapMessage::new(id, ProtocolOp::SearchResultDone(LdapResult::success()))
            .with_control(response.to_control(false).unwrap())
            .encode()
            .unwrap()
    }

    fn vlv_request(message: &LdapMessage) -> VlvControl {
        message.control::<VlvControl>().unwrap().unwrap()
    }

    fn search() -> SearchRequest {
        SearchRequest::new("ou=people,dc=example,dc=com", SearchScope::SingleLevel, Filter::present("sn"))
    }

    #[tokio::test]
    async fn test_window_moves_and_replays_context() {
        let (mut client, written) = scripted(vec![done(1, 1, 50, b"ctx1"), done(2, 11, 50, b"ctx2")]);
        let sort = SortingControl::new(vec![SortKey::new("sn")]);
        let mut vlv = Vlv::new(&mut client, search(), sort, 9);

        vlv.get_entries().await.unwrap();
        assert!(vlv.is_at_start());
        assert!(!vlv.is_at_end());
        assert_eq!(vlv.list_size(), Some(50));

        vlv.move_forward(10);
        vlv.get_entries().await.unwrap();
        assert_eq!(vlv.list_offset(), Some(11));

        let requests = sent(&written);
        let first = vlv_request(&requests[0]);
        assert_eq!((first.offset, first.count, first.context_id), (Some(1), Some(0), None));
        let second = vlv_request(&requests[1]);
        assert_eq!(second.offset, Some(11));
        assert_eq!(second.count, Some(50));
        assert_eq!(second.context_id, Some(b"ctx1".to_vec()));
        assert!(requests[1].find_control(crate::protocol::control::SORTING_OID).unwrap().critical);
    }

    #[tokio::test]
    async fn test_assertion_target_then_offsets() {
        let (mut client, written) = scripted(vec![done(1, 42, 50, b"c"), done(2, 40, 50, b"c")]);
        let sort = SortingControl::new(vec![SortKey::new("sn")]);
        let mut vlv = Vlv::new(&mut client, search(), sort, 5).before_position(2).start_at_value("smith");
        vlv.get_entries().await.unwrap();
        assert!(!vlv.is_at_end());
        vlv.move_backward(2);
        vlv.get_entries().await.unwrap();

        let requests = sent(&written);
        assert_eq!(vlv_request(&requests[0]).filter, Some(b"smith".to_vec()));
        let second = vlv_request(&requests[1]);
        assert_eq!(second.filter, None);
        assert_eq!(second.offset, Some(40));
        assert_eq!(second.before, 2);
    }

    #[tokio::test]
    async fn test_missing_response_control() {
        let (mut client, _) = scripted(vec![LdapMessage::new(1, ProtocolOp::SearchResultDone(LdapResult::success()))
            .encode()
            .unwrap()]);
        let sort = SortingControl::new(vec![SortKey::new("sn")]);
        let mut vlv = Vlv::new(&mut client, search(), sort, 9);
        assert!(vlv.get_entries().await.is_err());
    }
}
