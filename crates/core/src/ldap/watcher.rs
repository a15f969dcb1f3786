//! Syncrepl protocol state machine.
//!
//! The [`Watcher`] pulls raw responses from a [`ResponseSource`] and turns
//! each one into zero or more typed [`Event`]s. It owns every protocol
//! correctness decision: required controls, entry classification, the
//! identifier integrity check, and the per-flavor server quirks that
//! adjust `RefreshComplete.autodelete`.

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;

use tracing::{debug, warn};

use super::controls::{
    RefreshMode, SyncDoneValue, SyncInfoValue, SyncStateKind, SyncStateValue, SYNC_DONE_OID,
    SYNC_INFO_OID, SYNC_STATE_OID,
};
use super::flavor::DirectoryModel;
use super::response::{
    LdapResponse, RawAttributes, RawControl, ResponseData, ResponseKind, ResponseSource,
};
use crate::errors::WatchError;
use crate::models::{Attributes, Cookie, DirectoryEntry, Event, SyncId};

/// Pull interface over a stream of typed events.
///
/// `Ok(None)` marks the end of the stream. In refreshOnly mode that
/// happens right after the final `RefreshComplete` and `SyncCookie`.
pub trait EventStream {
    fn next_event(&mut self) -> impl Future<Output = Result<Option<Event>, WatchError>> + Send;
}

/// A fixed event list, drained front to back.
impl EventStream for VecDeque<Event> {
    async fn next_event(&mut self) -> Result<Option<Event>, WatchError> {
        Ok(self.pop_front())
    }
}

/// Decodes one sync search into events.
pub struct Watcher<S> {
    source: S,
    model: DirectoryModel,
    mode: RefreshMode,
    /// Whether the search was issued with a resumption cookie.
    incremental: bool,
    pending: VecDeque<Event>,
    /// Whether the refresh phase has ended.
    refreshed: bool,
    finished: bool,
}

impl<S: ResponseSource + Send> Watcher<S> {
    pub fn new(source: S, model: DirectoryModel, mode: RefreshMode, incremental: bool) -> Self {
        Self {
            source,
            model,
            mode,
            incremental,
            pending: VecDeque::new(),
            refreshed: false,
            finished: false,
        }
    }

    pub fn mode(&self) -> RefreshMode {
        self.mode
    }

    pub fn model(&self) -> &DirectoryModel {
        &self.model
    }

    /// Give back the underlying response source.
    pub fn into_source(self) -> S {
        self.source
    }

    /// Queue the events carried by one raw response.
    fn dispatch(&mut self, response: LdapResponse) -> Result<(), WatchError> {
        match response.kind {
            ResponseKind::SearchEntry => {
                for data in response.data {
                    match data {
                        ResponseData::Entry { dn, attrs, ctrls } => {
                            self.search_entry(dn, attrs, &ctrls)?
                        }
                        ResponseData::Intermediate { .. } => {
                            return Err(WatchError::Protocol(
                                "Intermediate message in search entry response".into(),
                            ))
                        }
                    }
                }
            }
            ResponseKind::Intermediate => {
                let value = response
                    .data
                    .into_iter()
                    .find_map(|data| match data {
                        ResponseData::Intermediate { name, value, .. } if name == SYNC_INFO_OID => {
                            Some(value)
                        }
                        _ => None,
                    })
                    .ok_or_else(|| WatchError::Protocol("Missing syncInfoMessage".into()))?;
                self.intermediate(SyncInfoValue::decode(&value)?)?;
            }
            ResponseKind::SearchResult => {
                let ctrl = find_control(&response.ctrls, SYNC_DONE_OID)
                    .ok_or_else(|| WatchError::Protocol("Missing syncDoneControl".into()))?;
                self.search_result(SyncDoneValue::decode(&ctrl.value)?);
                self.finished = true;
            }
            ResponseKind::SearchReference | ResponseKind::Other(_) => {
                return Err(WatchError::Protocol(format!(
                    "Unrecognised message type {}",
                    response.kind.code()
                )));
            }
        }
        Ok(())
    }

    fn search_entry(
        &mut self,
        dn: String,
        attrs: RawAttributes,
        ctrls: &[RawControl],
    ) -> Result<(), WatchError> {
        let ctrl = find_control(ctrls, SYNC_STATE_OID)
            .ok_or_else(|| WatchError::Protocol("Missing syncStateControl".into()))?;
        let state = SyncStateValue::decode(&ctrl.value)?;
        let syncid = SyncId::from_slice(&state.entry_uuid).ok_or_else(|| {
            WatchError::Protocol(format!(
                "syncStateControl entryUUID is {} octets, expected 16",
                state.entry_uuid.len()
            ))
        })?;

        match state.state {
            SyncStateKind::Present => {
                debug!(syncid = %syncid, "present entry");
                self.pending
                    .push_back(Event::UnchangedSyncIds(BTreeSet::from([syncid])));
            }
            SyncStateKind::Delete => {
                debug!(syncid = %syncid, "delete entry");
                self.pending
                    .push_back(Event::DeletedSyncIds(BTreeSet::from([syncid])));
            }
            SyncStateKind::Add | SyncStateKind::Modify => {
                let entry = self.decode_entry(dn, attrs, syncid)?;
                debug!(syncid = %syncid, dn = %entry.dn, kind = %entry.kind, "changed entry");
                self.pending.push_back(Event::ChangedEntry(entry));
            }
        }

        if let Some(cookie) = state.cookie {
            self.pending.push_back(Event::SyncCookie(Cookie(cookie)));
        }
        Ok(())
    }

    fn decode_entry(
        &self,
        dn: String,
        attrs: RawAttributes,
        syncid: SyncId,
    ) -> Result<DirectoryEntry, WatchError> {
        let mut attrs: Attributes = attrs.into_iter().collect();
        let kind = self
            .model
            .classify(&attrs)
            .ok_or_else(|| WatchError::UnrecognisedEntry(dn.clone()))?;

        let uuid_attr = &self.model.model(kind).uuid;
        match attrs.get(uuid_attr).and_then(|values| values.first()) {
            Some(raw) => {
                let text = String::from_utf8_lossy(raw);
                if SyncId::parse_lenient(&text) != Some(syncid) {
                    return Err(WatchError::SyncIdMismatch {
                        syncid: syncid.to_string(),
                        found: text.into_owned(),
                        dn,
                    });
                }
            }
            None => attrs.set(uuid_attr, vec![syncid.to_string().into_bytes()]),
        }

        Ok(DirectoryEntry {
            dn,
            kind,
            syncid,
            attrs,
        })
    }

    fn intermediate(&mut self, info: SyncInfoValue) -> Result<(), WatchError> {
        let cookie = match info {
            SyncInfoValue::NewCookie(cookie) => {
                debug!(cookie = %Cookie(cookie.clone()), "new cookie");
                Some(cookie)
            }
            SyncInfoValue::RefreshDelete {
                cookie,
                refresh_done,
            } => {
                debug!(done = refresh_done, "delete phase complete");
                if refresh_done {
                    self.refresh_complete(false);
                }
                cookie
            }
            SyncInfoValue::RefreshPresent {
                cookie,
                refresh_done,
            } => {
                debug!(done = refresh_done, "present phase complete");
                if refresh_done {
                    self.refresh_complete(true);
                }
                cookie
            }
            SyncInfoValue::SyncIdSet {
                cookie,
                refresh_deletes,
                sync_uuids,
            } => {
                let ids = sync_uuids
                    .iter()
                    .map(|raw| {
                        SyncId::from_slice(raw).ok_or_else(|| {
                            WatchError::Protocol(format!(
                                "syncIdSet entryUUID is {} octets, expected 16",
                                raw.len()
                            ))
                        })
                    })
                    .collect::<Result<BTreeSet<SyncId>, _>>()?;
                if refresh_deletes {
                    debug!(count = ids.len(), "delete sync IDs");
                    self.pending.push_back(Event::DeletedSyncIds(ids));
                } else {
                    debug!(count = ids.len(), "present sync IDs");
                    self.pending.push_back(Event::UnchangedSyncIds(ids));
                }
                cookie
            }
        };
        if let Some(cookie) = cookie {
            self.pending.push_back(Event::SyncCookie(Cookie(cookie)));
        }
        Ok(())
    }

    fn search_result(&mut self, done: SyncDoneValue) {
        debug!(refresh_deletes = done.refresh_deletes, "search complete");
        self.refresh_complete(!done.refresh_deletes);
        if let Some(cookie) = done.cookie {
            self.pending.push_back(Event::SyncCookie(Cookie(cookie)));
        }
    }

    /// Queue a `RefreshComplete`, correcting for known server behaviour.
    fn refresh_complete(&mut self, mut autodelete: bool) {
        if self.refreshed {
            debug!("refresh phase already complete");
            return;
        }
        self.refreshed = true;
        let quirks = self.model.quirks;
        match self.mode {
            RefreshMode::RefreshOnly
                if quirks.incremental_refresh_omits_deletes_flag
                    && self.incremental
                    && autodelete =>
            {
                warn!(
                    flavor = %self.model.flavor,
                    "incremental refresh ended without refreshDeletes; assuming refreshDeletes=TRUE intended"
                );
                autodelete = false;
            }
            RefreshMode::RefreshAndPersist
                if quirks.initial_persist_marks_delete_phase
                    && !self.incremental
                    && !autodelete =>
            {
                warn!(
                    flavor = %self.model.flavor,
                    "initial content ended with refreshDelete; assuming refreshPresent intended"
                );
                autodelete = true;
            }
            _ => {}
        }
        self.pending.push_back(Event::RefreshComplete { autodelete });
    }
}

impl<S: ResponseSource + Send> EventStream for Watcher<S> {
    async fn next_event(&mut self) -> Result<Option<Event>, WatchError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }
            match self.source.next_response().await? {
                Some(response) => self.dispatch(response)?,
                None => {
                    self.finished = true;
                    if self.mode == RefreshMode::RefreshOnly {
                        return Err(WatchError::Protocol(
                            "search ended without syncDoneControl".into(),
                        ));
                    }
                }
            }
        }
    }
}

fn find_control<'a>(ctrls: &'a [RawControl], oid: &str) -> Option<&'a RawControl> {
    ctrls.iter().find(|ctrl| ctrl.oid == oid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::flavor::Flavor;
    use crate::ldap::response::ReplaySource;
    use crate::models::EntryKind;
    use uuid::Uuid;

    fn id(n: u8) -> SyncId {
        SyncId(Uuid::from_bytes([n; 16]))
    }

    fn state(kind: SyncStateKind, syncid: SyncId, cookie: Option<&str>) -> RawControl {
        SyncStateValue {
            state: kind,
            entry_uuid: syncid.as_bytes().to_vec(),
            cookie: cookie.map(|c| c.as_bytes().to_vec()),
        }
        .to_control().unwrap()
    }

    fn person(cn: &str) -> RawAttributes {
        vec![
            ("objectClass".into(), vec![b"top".to_vec(), b"person".to_vec()]),
            ("cn".into(), vec![cn.as_bytes().to_vec()]),
        ]
    }

    fn info(value: SyncInfoValue) -> LdapResponse {
        LdapResponse::intermediate(SYNC_INFO_OID, value.encode().unwrap())
    }

    fn done(cookie: Option<&str>, refresh_deletes: bool) -> LdapResponse {
        LdapResponse::search_result(vec![SyncDoneValue {
            cookie: cookie.map(|c| c.as_bytes().to_vec()),
            refresh_deletes,
        }
        .to_control().unwrap()])
    }

    async fn collect(
        flavor: Flavor,
        mode: RefreshMode,
        incremental: bool,
        responses: Vec<LdapResponse>,
    ) -> Result<Vec<Event>, WatchError> {
        let mut watcher = Watcher::new(
            ReplaySource::new(responses),
            DirectoryModel::new(flavor),
            mode,
            incremental,
        );
        let mut events = Vec::new();
        while let Some(event) = watcher.next_event().await? {
            events.push(event);
        }
        Ok(events)
    }

    #[tokio::test]
    async fn test_refresh_only_full_cycle() {
        let events = collect(
            Flavor::Rfc4519,
            RefreshMode::RefreshOnly,
            false,
            vec![
                LdapResponse::entry(
                    "cn=alice,dc=example,dc=com",
                    person("alice"),
                    vec![state(SyncStateKind::Add, id(1), None)],
                ),
                LdapResponse::entry(
                    "cn=bob,dc=example,dc=com",
                    Vec::new(),
                    vec![state(SyncStateKind::Present, id(2), Some("c0"))],
                ),
                done(Some("c1"), false),
            ],
        )
        .await
        .unwrap();

        assert_eq!(events.len(), 5);
        match &events[0] {
            Event::ChangedEntry(entry) => {
                assert_eq!(entry.kind, EntryKind::User);
                assert_eq!(entry.syncid, id(1));
                // Identifier attribute populated from the control.
                assert_eq!(
                    entry.attrs.first_str("entryUUID"),
                    Some(id(1).to_string().as_str())
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events[1], Event::UnchangedSyncIds(BTreeSet::from([id(2)])));
        assert_eq!(events[2], Event::SyncCookie(Cookie::from("c0")));
        assert_eq!(events[3], Event::RefreshComplete { autodelete: true });
        assert_eq!(events[4], Event::SyncCookie(Cookie::from("c1")));
    }

    #[tokio::test]
    async fn test_delete_state_and_refresh_deletes() {
        let events = collect(
            Flavor::Rfc4519,
            RefreshMode::RefreshOnly,
            true,
            vec![
                LdapResponse::entry(
                    "cn=gone,dc=example,dc=com",
                    Vec::new(),
                    vec![state(SyncStateKind::Delete, id(3), None)],
                ),
                done(None, true),
            ],
        )
        .await
        .unwrap();
        assert_eq!(
            events,
            vec![
                Event::DeletedSyncIds(BTreeSet::from([id(3)])),
                Event::RefreshComplete { autodelete: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_sync_info_alternatives() {
        let events = collect(
            Flavor::Rfc4519,
            RefreshMode::RefreshAndPersist,
            true,
            vec![
                info(SyncInfoValue::NewCookie(b"n1".to_vec())),
                info(SyncInfoValue::RefreshDelete {
                    cookie: None,
                    refresh_done: false,
                }),
                info(SyncInfoValue::RefreshPresent {
                    cookie: Some(b"p1".to_vec()),
                    refresh_done: true,
                }),
                info(SyncInfoValue::SyncIdSet {
                    cookie: None,
                    refresh_deletes: true,
                    sync_uuids: vec![id(4).as_bytes().to_vec(), id(5).as_bytes().to_vec()],
                }),
                info(SyncInfoValue::SyncIdSet {
                    cookie: Some(b"s1".to_vec()),
                    refresh_deletes: false,
                    sync_uuids: vec![id(6).as_bytes().to_vec()],
                }),
            ],
        )
        .await
        .unwrap();
        assert_eq!(
            events,
            vec![
                Event::SyncCookie(Cookie::from("n1")),
                Event::RefreshComplete { autodelete: true },
                Event::SyncCookie(Cookie::from("p1")),
                Event::DeletedSyncIds(BTreeSet::from([id(4), id(5)])),
                Event::UnchangedSyncIds(BTreeSet::from([id(6)])),
                Event::SyncCookie(Cookie::from("s1")),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_controls_are_protocol_errors() {
        let err = collect(
            Flavor::Rfc4519,
            RefreshMode::RefreshOnly,
            false,
            vec![LdapResponse::entry("cn=x", person("x"), Vec::new())],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WatchError::Protocol(ref m) if m == "Missing syncStateControl"));

        let err = collect(
            Flavor::Rfc4519,
            RefreshMode::RefreshOnly,
            false,
            vec![LdapResponse::intermediate("1.2.3.4", Vec::new())],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WatchError::Protocol(ref m) if m == "Missing syncInfoMessage"));

        let err = collect(
            Flavor::Rfc4519,
            RefreshMode::RefreshOnly,
            false,
            vec![LdapResponse::search_result(Vec::new())],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WatchError::Protocol(ref m) if m == "Missing syncDoneControl"));
    }

    #[tokio::test]
    async fn test_unrecognised_message_and_info_value() {
        let reference = LdapResponse {
            kind: ResponseKind::SearchReference,
            data: Vec::new(),
            ctrls: Vec::new(),
        };
        let err = collect(Flavor::Rfc4519, RefreshMode::RefreshOnly, false, vec![reference])
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Protocol(_)));

        // [4] is not a syncInfoValue alternative.
        let bogus = LdapResponse::intermediate(SYNC_INFO_OID, vec![0x84, 0x00]);
        let err = collect(Flavor::Rfc4519, RefreshMode::RefreshOnly, false, vec![bogus])
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Protocol(ref m) if m == "Unrecognised syncInfoValue"));
    }

    #[tokio::test]
    async fn test_unrecognised_entry() {
        let attrs = vec![("objectClass".to_string(), vec![b"device".to_vec()])];
        let err = collect(
            Flavor::Rfc4519,
            RefreshMode::RefreshOnly,
            false,
            vec![LdapResponse::entry(
                "cn=printer,dc=example,dc=com",
                attrs,
                vec![state(SyncStateKind::Add, id(1), None)],
            )],
        )
        .await
        .unwrap_err();
        assert!(
            matches!(err, WatchError::UnrecognisedEntry(ref dn) if dn == "cn=printer,dc=example,dc=com")
        );
    }

    #[tokio::test]
    async fn test_syncid_mismatch_is_fatal() {
        let mut attrs = person("alice");
        attrs.push(("entryUUID".into(), vec![id(9).to_string().into_bytes()]));
        let err = collect(
            Flavor::Rfc4519,
            RefreshMode::RefreshOnly,
            false,
            vec![LdapResponse::entry(
                "cn=alice",
                attrs,
                vec![state(SyncStateKind::Modify, id(1), None)],
            )],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WatchError::SyncIdMismatch { .. }));
    }

    #[tokio::test]
    async fn test_matching_389ds_unique_id_accepted() {
        let syncid = id(7);
        let simple = syncid.0.simple().to_string();
        let ns_unique_id = format!(
            "{}-{}-{}-{}",
            &simple[0..8],
            &simple[8..16],
            &simple[16..24],
            &simple[24..32]
        );
        let attrs = vec![
            ("objectClass".to_string(), vec![b"inetOrgPerson".to_vec()]),
            ("uid".to_string(), vec![b"alice".to_vec()]),
            ("nsUniqueId".to_string(), vec![ns_unique_id.into_bytes()]),
        ];
        let events = collect(
            Flavor::FreeIpa,
            RefreshMode::RefreshAndPersist,
            true,
            vec![LdapResponse::entry(
                "uid=alice",
                attrs,
                vec![state(SyncStateKind::Add, syncid, None)],
            )],
        )
        .await
        .unwrap();
        assert!(matches!(&events[0], Event::ChangedEntry(e) if e.syncid == syncid));
    }

    #[tokio::test]
    async fn test_freeipa_incremental_refresh_only_forces_no_autodelete() {
        let events = collect(
            Flavor::FreeIpa,
            RefreshMode::RefreshOnly,
            true,
            vec![done(Some("c2"), false)],
        )
        .await
        .unwrap();
        assert_eq!(events[0], Event::RefreshComplete { autodelete: false });

        // Without a request cookie the done control is taken literally.
        let events = collect(
            Flavor::FreeIpa,
            RefreshMode::RefreshOnly,
            false,
            vec![done(None, false)],
        )
        .await
        .unwrap();
        assert_eq!(events[0], Event::RefreshComplete { autodelete: true });
    }

    #[tokio::test]
    async fn test_freeipa_initial_persist_forces_autodelete() {
        let delete_done = info(SyncInfoValue::RefreshDelete {
            cookie: None,
            refresh_done: true,
        });
        let events = collect(
            Flavor::FreeIpa,
            RefreshMode::RefreshAndPersist,
            false,
            vec![delete_done.clone()],
        )
        .await
        .unwrap();
        assert_eq!(events, vec![Event::RefreshComplete { autodelete: true }]);

        // Standards-conforming flavors keep the literal meaning.
        let events = collect(
            Flavor::Rfc4519,
            RefreshMode::RefreshAndPersist,
            false,
            vec![delete_done],
        )
        .await
        .unwrap();
        assert_eq!(events, vec![Event::RefreshComplete { autodelete: false }]);
    }

    #[tokio::test]
    async fn test_refresh_only_requires_search_done() {
        let err = collect(Flavor::Rfc4519, RefreshMode::RefreshOnly, false, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Protocol(_)));

        let events = collect(
            Flavor::Rfc4519,
            RefreshMode::RefreshAndPersist,
            false,
            Vec::new(),
        )
        .await
        .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_sync_id_set_is_protocol_error() {
        let err = collect(
            Flavor::Rfc4519,
            RefreshMode::RefreshOnly,
            false,
            vec![
                info(SyncInfoValue::SyncIdSet {
                    cookie: None,
                    refresh_deletes: false,
                    sync_uuids: vec![
                        id(1).as_bytes().to_vec(),
                        id(2).to_string().into_bytes(),
                    ],
                }),
                done(None, false),
            ],
        )
        .await
        .unwrap_err();
        assert!(
            matches!(err, WatchError::Protocol(ref m) if m == "syncIdSet entryUUID is 36 octets, expected 16")
        );
    }

    #[tokio::test]
    async fn test_refresh_completes_once_per_search() {
        let events = collect(
            Flavor::Rfc4519,
            RefreshMode::RefreshAndPersist,
            false,
            vec![
                info(SyncInfoValue::RefreshPresent {
                    cookie: None,
                    refresh_done: true,
                }),
                done(Some("c9"), false),
            ],
        )
        .await
        .unwrap();
        assert_eq!(
            events,
            vec![
                Event::RefreshComplete { autodelete: true },
                Event::SyncCookie(Cookie::from("c9")),
            ]
        );
    }
}
