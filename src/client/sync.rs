// Content synchronization (RFC 4533) consumer

use tracing::{debug, info};

use super::LdapClient;
use crate::error::{LdapError, ProtocolError, Result};
use crate::protocol::control::{ManageDsaItControl, SyncDoneControl, SyncMode, SyncRequestControl, SyncStateControl};
use crate::protocol::{Control, Entry, LdapMessage, ProtocolOp, SearchRequest, SyncInfo, TypedControl};
use crate::result_code::ResultCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    /// Catching up with the server's current content.
    Refresh,
    /// refreshAndPersist only: receiving live changes.
    Persist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Delete,
    Present,
}

/// The RFC 4533 step a session is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncProgress {
    /// refreshOnly without a cookie: the full content is transferred.
    InitialContent,
    /// refreshOnly resuming from a cookie: only changes are transferred.
    ContentUpdate,
    /// refreshAndPersist requested, no refresh phase seen yet.
    RefreshAndPersist,
    /// refreshAndPersist inside a delete or present phase.
    Refresh,
    /// refreshAndPersist after refreshDone: live changes.
    Persist,
}

/// Where a sync session stands. Only the driver changes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    stage: SyncStage,
    cookie: Option<Vec<u8>>,
    phase: Option<SyncPhase>,
    mode: Option<SyncMode>,
    resumed: bool,
}

impl SyncSession {
    fn new(cookie: Option<Vec<u8>>) -> Self {
        Self {
            stage: SyncStage::Refresh,
            cookie,
            phase: None,
            mode: None,
            resumed: false,
        }
    }

    fn start(&mut self, mode: SyncMode) {
        self.mode = Some(mode);
        self.resumed = self.cookie.is_some();
        self.stage = SyncStage::Refresh;
        self.phase = None;
    }

    /// None until the first request has been sent.
    pub fn progress(&self) -> Option<SyncProgress> {
        Some(match (self.mode?, self.stage) {
            (SyncMode::RefreshOnly, _) if self.resumed => SyncProgress::ContentUpdate,
            (SyncMode::RefreshOnly, _) => SyncProgress::InitialContent,
            (SyncMode::RefreshAndPersist, SyncStage::Persist) => SyncProgress::Persist,
            (SyncMode::RefreshAndPersist, _) if self.phase.is_some() => SyncProgress::Refresh,
            (SyncMode::RefreshAndPersist, _) => SyncProgress::RefreshAndPersist,
        })
    }

    pub fn stage(&self) -> SyncStage {
        self.stage
    }

    pub fn cookie(&self) -> Option<&[u8]> {
        self.cookie.as_deref()
    }

    pub fn phase(&self) -> Option<SyncPhase> {
        self.phase
    }

    fn update_phase(&mut self, phase: SyncPhase, refresh_done: bool) {
        if refresh_done {
            self.stage = SyncStage::Persist;
            self.phase = None;
        } else {
            self.phase = Some(phase);
        }
    }

    /// A response without a cookie leaves the current one in place.
    fn update_cookie(&mut self, cookie: Option<&[u8]>, handler: &mut dyn SyncHandler) -> Result<()> {
        let Some(cookie) = cookie else {
            return Ok(());
        };
        if self.cookie.as_deref() != Some(cookie) {
            self.cookie = Some(cookie.to_vec());
            handler.cookie(cookie)?;
        }
        Ok(())
    }
}

/// Callbacks for a sync run. Returning [`LdapError::CancelSync`] from any of
/// them ends the run cleanly.
pub trait SyncHandler: Send {
    fn entry(&mut self, entry: &Entry, state: &SyncStateControl, session: &SyncSession) -> Result<()>;

    /// entryUUIDs from a syncIdSet message: deleted entries when
    /// `refresh_deletes`, otherwise unchanged ones.
    fn id_set(&mut self, _uuids: &[Vec<u8>], _refresh_deletes: bool, _session: &SyncSession) -> Result<()> {
        Ok(())
    }

    fn referral(&mut self, _uris: &[String], _session: &SyncSession) -> Result<()> {
        Ok(())
    }

    /// Called whenever the server hands out a new cookie; persist it to
    /// resume later.
    fn cookie(&mut self, _cookie: &[u8]) -> Result<()> {
        Ok(())
    }
}

pub struct SyncRepl<'a> {
    client: &'a mut LdapClient,
    search: SearchRequest,
    controls: Vec<Control>,
    session: SyncSession,
}

impl<'a> SyncRepl<'a> {
    pub fn new(client: &'a mut LdapClient, search: SearchRequest) -> Self {
        Self {
            client,
            search,
            controls: Vec::new(),
            session: SyncSession::new(None),
        }
    }

    /// Resume from a cookie saved by an earlier run.
    pub fn with_cookie(mut self, cookie: Vec<u8>) -> Self {
        self.session.cookie = Some(cookie);
        self
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    /// One refreshOnly pass: returns once the server says the refresh is done.
    pub async fn poll(&mut self, handler: &mut dyn SyncHandler) -> Result<()> {
        self.run(SyncMode::RefreshOnly, handler).await
    }

    /// refreshAndPersist: runs until the server ends the search or a
    /// callback cancels it.
    pub async fn listen(&mut self, handler: &mut dyn SyncHandler) -> Result<()> {
        self.run(SyncMode::RefreshAndPersist, handler).await
    }

    fn request_controls(&self, mode: SyncMode) -> Result<Vec<Control>> {
        let mut controls = vec![
            SyncRequestControl::new(mode, self.session.cookie.clone()).to_control(true)?,
            ManageDsaItControl.to_control(false)?,
        ];
        controls.extend(self.controls.iter().cloned());
        Ok(controls)
    }

    async fn run(&mut self, mode: SyncMode, handler: &mut dyn SyncHandler) -> Result<()> {
        let mut restarted = false;
        loop {
            let controls = self.request_controls(mode)?;
            self.session.start(mode);

            let session = &mut self.session;
            let result = self
                .client
                .search_with(self.search.clone(), controls, |message| {
                    process(message, session, &mut *handler)
                })
                .await;

            match result {
                Ok(done) => {
                    if let Some(done) = done.control::<SyncDoneControl>().transpose()? {
                        self.session.update_cookie(done.cookie.as_deref(), handler)?;
                    }
                    return Ok(());
                }
                Err(LdapError::Operation(e)) if e.code == ResultCode::SYNC_REFRESH_REQUIRED && !restarted => {
                    info!("server requires a full refresh, restarting without a cookie");
                    self.session.cookie = None;
                    restarted = true;
                }
                Err(LdapError::CancelSync) => {
                    debug!("sync cancelled");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn process(message: &LdapMessage, session: &mut SyncSession, handler: &mut dyn SyncHandler) -> Result<()> {
    match &message.op {
        ProtocolOp::SearchResultEntry(result) => {
            let state = message
                .control::<SyncStateControl>()
                .transpose()?
                .ok_or_else(|| ProtocolError::new("sync entry without a sync state control"))?;
            session.update_cookie(state.cookie.as_deref(), handler)?;
            handler.entry(&result.entry, &state, session)
        }
        ProtocolOp::SearchResultReference(reference) => {
            if let Some(state) = message.control::<SyncStateControl>().transpose()? {
                session.update_cookie(state.cookie.as_deref(), handler)?;
            }
            handler.referral(&reference.uris, session)
        }
        ProtocolOp::IntermediateResponse(_) => {
            let Some(info) = message.sync_info()? else {
                debug!("ignoring intermediate response outside the sync protocol");
                return Ok(());
            };
            match &info {
                SyncInfo::NewCookie(_) => {}
                SyncInfo::RefreshDelete { refresh_done, .. } => session.update_phase(SyncPhase::Delete, *refresh_done),
                SyncInfo::RefreshPresent { refresh_done, .. } => {
                    session.update_phase(SyncPhase::Present, *refresh_done)
                }
                SyncInfo::IdSet {
                    refresh_deletes, uuids, ..
                } => handler.id_set(uuids, *refresh_deletes, session)?,
            }
            session.update_cookie(info.cookie(), handler)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{encode, scripted, sent};
    use crate::protocol::control::{SyncState, SYNC_REQUEST_OID};
    use crate::protocol::{Filter, LdapResult, SearchResultEntry, SearchScope};

    #[derive(Default)]
    struct Recorder {
        entries: Vec<String>,
        cookies: Vec<Vec<u8>>,
        deleted: Vec<Vec<u8>>,
        progress: Vec<Option<SyncProgress>>,
        cancel_after: Option<usize>,
    }

    impl SyncHandler for Recorder {
        fn entry(&mut self, entry: &Entry, _state: &SyncStateControl, session: &SyncSession) -> Result<()> {
            self.entries.push(entry.dn.clone());
            self.progress.push(session.progress());
            if Some(self.entries.len()) == self.cancel_after {
                return Err(LdapError::CancelSync);
            }
            Ok(())
        }

        fn id_set(&mut self, uuids: &[Vec<u8>], refresh_deletes: bool, _session: &SyncSession) -> Result<()> {
            if refresh_deletes {
                self.deleted.extend(uuids.iter().cloned());
            }
            Ok(())
        }

        fn cookie(&mut self, cookie: &[u8]) -> Result<()> {
            self.cookies.push(cookie.to_vec());
            Ok(())
        }
    }

    fn search() -> SearchRequest {
        SearchRequest::new("dc=example,dc=com", SearchScope::WholeSubtree, Filter::any_object())
    }

    fn done(id: i32, cookie: Option<&[u8]>) -> Vec<u8> {
        let control = SyncDoneControl {
            cookie: cookie.map(<[u8]>::to_vec),
            refresh_deletes: false,
        }
        .to_control(false)
        .unwrap();
        LdapMessage::new(id, ProtocolOp::SearchResultDone(LdapResult::success()))
            .with_control(control)
            .encode()
            .unwrap()
    }

    fn entry(id: i32, dn: &str, cookie: Option<&[u8]>) -> Vec<u8> {
        let state = SyncStateControl {
            state: SyncState::Add,
            entry_uuid: vec![7; 16],
            cookie: cookie.map(<[u8]>::to_vec),
        };
        LdapMessage::new(
            id,
            ProtocolOp::SearchResultEntry(SearchResultEntry { entry: Entry::new(dn) }),
        )
        .with_control(state.to_control(false).unwrap())
        .encode()
        .unwrap()
    }

    fn sent_cookie(message: &LdapMessage) -> Option<Vec<u8>> {
        message.control::<SyncRequestControl>().unwrap().unwrap().cookie
    }

    #[tokio::test]
    async fn test_cookie_continuity_across_polls() {
        let (mut client, written) = scripted(vec![done(1, Some(b"A")), done(2, None), done(3, Some(b"C"))]);
        let mut handler = Recorder::default();
        let mut sync = SyncRepl::new(&mut client, search());
        assert_eq!(sync.session().progress(), None);

        sync.poll(&mut handler).await.unwrap();
        assert_eq!(sync.session().cookie(), Some(&b"A"[..]));
        assert_eq!(sync.session().progress(), Some(SyncProgress::InitialContent));
        sync.poll(&mut handler).await.unwrap();
        assert_eq!(sync.session().progress(), Some(SyncProgress::ContentUpdate));
        assert_eq!(sync.session().cookie(), Some(&b"A"[..]));
        sync.poll(&mut handler).await.unwrap();
        assert_eq!(sync.session().cookie(), Some(&b"C"[..]));

        let requests = sent(&written);
        assert_eq!(requests.len(), 3);
        assert_eq!(sent_cookie(&requests[0]), None);
        assert_eq!(sent_cookie(&requests[1]), Some(b"A".to_vec()));
        assert_eq!(sent_cookie(&requests[2]), Some(b"A".to_vec()));
        assert!(requests[0].find_control(SYNC_REQUEST_OID).unwrap().critical);
        assert_eq!(handler.cookies, vec![b"A".to_vec(), b"C".to_vec()]);
    }

    #[tokio::test]
    async fn test_entries_and_id_sets() {
        let id_set = SyncInfo::IdSet {
            cookie: None,
            refresh_deletes: true,
            uuids: vec![vec![1; 16]],
        }
        .to_intermediate()
        .unwrap();
        let (mut client, _) = scripted(vec![
            entry(1, "cn=a,dc=example,dc=com", Some(b"A")),
            encode(1, ProtocolOp::IntermediateResponse(id_set)),
            done(1, Some(b"B")),
        ]);
        let mut handler = Recorder::default();
        let mut sync = SyncRepl::new(&mut client, search());
        sync.poll(&mut handler).await.unwrap();
        assert_eq!(handler.entries, vec!["cn=a,dc=example,dc=com".to_string()]);
        assert_eq!(handler.deleted, vec![vec![1; 16]]);
        assert_eq!(sync.session().cookie(), Some(&b"B"[..]));
    }

    #[tokio::test]
    async fn test_refresh_required_restarts_without_cookie() {
        let required = LdapMessage::new(
            1,
            ProtocolOp::SearchResultDone(LdapResult::new(ResultCode::SYNC_REFRESH_REQUIRED, "")),
        )
        .encode()
        .unwrap();
        let (mut client, written) = scripted(vec![required, done(2, Some(b"fresh"))]);
        let mut handler = Recorder::default();
        let mut sync = SyncRepl::new(&mut client, search()).with_cookie(b"stale".to_vec());
        sync.poll(&mut handler).await.unwrap();
        assert_eq!(sync.session().cookie(), Some(&b"fresh"[..]));

        let requests = sent(&written);
        assert_eq!(sent_cookie(&requests[0]), Some(b"stale".to_vec()));
        assert_eq!(sent_cookie(&requests[1]), None);
    }

    #[tokio::test]
    async fn test_listen_refresh_done_and_cancel() {
        let refresh_done = SyncInfo::RefreshDelete {
            cookie: None,
            refresh_done: true,
        }
        .to_intermediate()
        .unwrap();
        let (mut client, _) = scripted(vec![
            encode(1, ProtocolOp::IntermediateResponse(refresh_done)),
            entry(1, "cn=live,dc=example,dc=com", Some(b"L")),
        ]);
        let mut handler = Recorder {
            cancel_after: Some(1),
            ..Default::default()
        };
        let mut sync = SyncRepl::new(&mut client, search());
        sync.listen(&mut handler).await.unwrap();
        assert_eq!(sync.session().stage(), SyncStage::Persist);
        assert_eq!(handler.progress, vec![Some(SyncProgress::Persist)]);
        assert_eq!(sync.session().cookie(), Some(&b"L"[..]));
    }

    #[tokio::test]
    async fn test_listen_progress_through_refresh() {
        let present = SyncInfo::RefreshPresent {
            cookie: None,
            refresh_done: false,
        }
        .to_intermediate()
        .unwrap();
        let refresh_done = SyncInfo::RefreshPresent {
            cookie: Some(b"P".to_vec()),
            refresh_done: true,
        }
        .to_intermediate()
        .unwrap();
        let (mut client, _) = scripted(vec![
            entry(1, "cn=first,dc=example,dc=com", None),
            encode(1, ProtocolOp::IntermediateResponse(present)),
            entry(1, "cn=old,dc=example,dc=com", None),
            encode(1, ProtocolOp::IntermediateResponse(refresh_done)),
            entry(1, "cn=new,dc=example,dc=com", None),
        ]);
        let mut handler = Recorder {
            cancel_after: Some(3),
            ..Default::default()
        };
        let mut sync = SyncRepl::new(&mut client, search());
        sync.listen(&mut handler).await.unwrap();
        assert_eq!(
            handler.progress,
            vec![
                Some(SyncProgress::RefreshAndPersist),
                Some(SyncProgress::Refresh),
                Some(SyncProgress::Persist),
            ]
        );
        assert_eq!(sync.session().cookie(), Some(&b"P"[..]));
    }
}
