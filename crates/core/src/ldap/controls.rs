//! BER codec for the LDAP Content Synchronization (RFC 4533) controls.
//!
//! Values are built and parsed as `lber` structure tags, reached through
//! `ldap3::asn1`. The module definitions use implicit tagging, so the
//! context-tagged alternatives of `syncInfoValue` carry their contents
//! directly.

use bytes::BytesMut;
use ldap3::asn1::{parse_tag, write, StructureTag, TagClass, PL};

use super::response::RawControl;
use crate::errors::WatchError;

/// OID of the sync request control.
pub const SYNC_REQUEST_OID: &str = "1.3.6.1.4.1.4203.1.9.1.1";
/// OID of the sync state control.
pub const SYNC_STATE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.2";
/// OID of the sync done control.
pub const SYNC_DONE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.3";
/// Response name of the sync info intermediate message.
pub const SYNC_INFO_OID: &str = "1.3.6.1.4.1.4203.1.9.1.4";

// Universal tag numbers.
const BOOLEAN: u64 = 1;
const OCTET_STRING: u64 = 4;
const ENUMERATED: u64 = 10;
const SEQUENCE: u64 = 16;
const SET: u64 = 17;

// ---------------------------------------------------------------------------
// Typed control values
// ---------------------------------------------------------------------------

/// Search mode requested by the sync request control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Bounded: initial content then a search done message.
    RefreshOnly,
    /// Unbounded: initial content then a persistent change stream.
    RefreshAndPersist,
}

impl RefreshMode {
    fn code(self) -> i64 {
        match self {
            Self::RefreshOnly => 1,
            Self::RefreshAndPersist => 3,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::RefreshOnly),
            3 => Some(Self::RefreshAndPersist),
            _ => None,
        }
    }
}

impl std::fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RefreshOnly => write!(f, "refreshOnly"),
            Self::RefreshAndPersist => write!(f, "refreshAndPersist"),
        }
    }
}

/// `syncRequestValue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequestValue {
    pub mode: RefreshMode,
    pub cookie: Option<Vec<u8>>,
    pub reload_hint: bool,
}

impl SyncRequestValue {
    pub fn new(mode: RefreshMode, cookie: Option<Vec<u8>>) -> Self {
        Self {
            mode,
            cookie,
            reload_hint: false,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WatchError> {
        let mut fields = vec![enumerated(self.mode.code())];
        if let Some(cookie) = &self.cookie {
            fields.push(octets(cookie.clone()));
        }
        if self.reload_hint {
            fields.push(boolean(true));
        }
        to_bytes(sequence(fields))
    }

    pub fn decode(value: &[u8]) -> Result<Self, WatchError> {
        let mut fields = children(parse(value, "syncRequestValue")?, "syncRequestValue")?.into_iter();
        let mode = fields
            .next()
            .filter(|t| is_universal(t, ENUMERATED))
            .map(|t| primitive(t, "mode").map(|b| integer(&b)))
            .transpose()?
            .and_then(RefreshMode::from_code)
            .ok_or_else(|| invalid("syncRequestValue: bad mode"))?;
        let mut request = Self::new(mode, None);
        for field in fields {
            if is_universal(&field, OCTET_STRING) {
                request.cookie = Some(primitive(field, "cookie")?);
            } else if is_universal(&field, BOOLEAN) {
                request.reload_hint = boolean_value(&primitive(field, "reloadHint")?);
            }
        }
        Ok(request)
    }

    /// The critical request control ready to attach to a search.
    pub fn to_control(&self) -> Result<RawControl, WatchError> {
        Ok(RawControl::new(SYNC_REQUEST_OID, true, self.encode()?))
    }
}

/// `state` of a sync state control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStateKind {
    Present,
    Add,
    Modify,
    Delete,
}

impl SyncStateKind {
    fn code(self) -> i64 {
        match self {
            Self::Present => 0,
            Self::Add => 1,
            Self::Modify => 2,
            Self::Delete => 3,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Present),
            1 => Some(Self::Add),
            2 => Some(Self::Modify),
            3 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// `syncStateValue`, attached to each search entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateValue {
    pub state: SyncStateKind,
    pub entry_uuid: Vec<u8>,
    pub cookie: Option<Vec<u8>>,
}

impl SyncStateValue {
    pub fn encode(&self) -> Result<Vec<u8>, WatchError> {
        let mut fields = vec![
            enumerated(self.state.code()),
            octets(self.entry_uuid.clone()),
        ];
        if let Some(cookie) = &self.cookie {
            fields.push(octets(cookie.clone()));
        }
        to_bytes(sequence(fields))
    }

    pub fn decode(value: &[u8]) -> Result<Self, WatchError> {
        let mut fields = children(parse(value, "syncStateValue")?, "syncStateValue")?.into_iter();
        let state = match fields.next() {
            Some(tag) if is_universal(&tag, ENUMERATED) => {
                SyncStateKind::from_code(integer(&primitive(tag, "state")?))
            }
            _ => None,
        }
        .ok_or_else(|| invalid("syncStateValue: bad state"))?;
        let entry_uuid = match fields.next() {
            Some(tag) if is_universal(&tag, OCTET_STRING) => primitive(tag, "entryUUID")?,
            _ => return Err(invalid("syncStateValue: missing entryUUID")),
        };
        let cookie = match fields.next() {
            Some(tag) if is_universal(&tag, OCTET_STRING) => Some(primitive(tag, "cookie")?),
            Some(_) => return Err(invalid("syncStateValue: unexpected field")),
            None => None,
        };
        Ok(Self {
            state,
            entry_uuid,
            cookie,
        })
    }

    pub fn to_control(&self) -> Result<RawControl, WatchError> {
        Ok(RawControl::new(SYNC_STATE_OID, false, self.encode()?))
    }
}

/// `syncDoneValue`, attached to the search done message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDoneValue {
    pub cookie: Option<Vec<u8>>,
    pub refresh_deletes: bool,
}

impl SyncDoneValue {
    pub fn encode(&self) -> Result<Vec<u8>, WatchError> {
        let mut fields = Vec::new();
        if let Some(cookie) = &self.cookie {
            fields.push(octets(cookie.clone()));
        }
        if self.refresh_deletes {
            fields.push(boolean(true));
        }
        to_bytes(sequence(fields))
    }

    pub fn decode(value: &[u8]) -> Result<Self, WatchError> {
        let mut done = Self::default();
        // An absent control value means both fields take their defaults.
        if value.is_empty() {
            return Ok(done);
        }
        for field in children(parse(value, "syncDoneValue")?, "syncDoneValue")? {
            if is_universal(&field, OCTET_STRING) {
                done.cookie = Some(primitive(field, "cookie")?);
            } else if is_universal(&field, BOOLEAN) {
                done.refresh_deletes = boolean_value(&primitive(field, "refreshDeletes")?);
            } else {
                return Err(invalid("syncDoneValue: unexpected field"));
            }
        }
        Ok(done)
    }

    pub fn to_control(&self) -> Result<RawControl, WatchError> {
        Ok(RawControl::new(SYNC_DONE_OID, false, self.encode()?))
    }
}

/// `syncInfoValue`, the payload of the sync info intermediate message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncInfoValue {
    NewCookie(Vec<u8>),
    RefreshDelete {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    RefreshPresent {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    SyncIdSet {
        cookie: Option<Vec<u8>>,
        refresh_deletes: bool,
        sync_uuids: Vec<Vec<u8>>,
    },
}

impl SyncInfoValue {
    pub fn encode(&self) -> Result<Vec<u8>, WatchError> {
        let tag = match self {
            Self::NewCookie(cookie) => context(0, PL::P(cookie.clone())),
            Self::RefreshDelete {
                cookie,
                refresh_done,
            } => context(1, PL::C(phase_fields(cookie, *refresh_done))),
            Self::RefreshPresent {
                cookie,
                refresh_done,
            } => context(2, PL::C(phase_fields(cookie, *refresh_done))),
            Self::SyncIdSet {
                cookie,
                refresh_deletes,
                sync_uuids,
            } => {
                let mut fields = Vec::new();
                if let Some(cookie) = cookie {
                    fields.push(octets(cookie.clone()));
                }
                if *refresh_deletes {
                    fields.push(boolean(true));
                }
                fields.push(universal(
                    SET,
                    PL::C(sync_uuids.iter().cloned().map(octets).collect()),
                ));
                context(3, PL::C(fields))
            }
        };
        to_bytes(tag)
    }

    /// Decode a sync info message.
    ///
    /// Malformed BER is an invalid control; a well-formed value of an
    /// unknown alternative is a protocol error.
    pub fn decode(value: &[u8]) -> Result<Self, WatchError> {
        let tag = parse(value, "syncInfoValue")?;
        if tag.class != TagClass::Context {
            return Err(WatchError::Protocol("Unrecognised syncInfoValue".into()));
        }
        match tag.id {
            0 => Ok(Self::NewCookie(primitive(tag, "newcookie")?)),
            1 => {
                let (cookie, refresh_done) = phase(tag, "refreshDelete")?;
                Ok(Self::RefreshDelete {
                    cookie,
                    refresh_done,
                })
            }
            2 => {
                let (cookie, refresh_done) = phase(tag, "refreshPresent")?;
                Ok(Self::RefreshPresent {
                    cookie,
                    refresh_done,
                })
            }
            3 => {
                let mut cookie = None;
                let mut refresh_deletes = false;
                let mut sync_uuids = None;
                for field in children(tag, "syncIdSet")? {
                    if is_universal(&field, OCTET_STRING) {
                        cookie = Some(primitive(field, "cookie")?);
                    } else if is_universal(&field, BOOLEAN) {
                        refresh_deletes = boolean_value(&primitive(field, "refreshDeletes")?);
                    } else if is_universal(&field, SET) {
                        sync_uuids = Some(
                            children(field, "syncUUIDs")?
                                .into_iter()
                                .map(|uuid| primitive(uuid, "syncUUID"))
                                .collect::<Result<Vec<_>, _>>()?,
                        );
                    }
                }
                Ok(Self::SyncIdSet {
                    cookie,
                    refresh_deletes,
                    sync_uuids: sync_uuids
                        .ok_or_else(|| invalid("syncIdSet: missing syncUUIDs"))?,
                })
            }
            _ => Err(WatchError::Protocol("Unrecognised syncInfoValue".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// BER helpers
// ---------------------------------------------------------------------------

fn invalid(detail: &str) -> WatchError {
    WatchError::InvalidControl(detail.to_string())
}

fn universal(id: u64, payload: PL) -> StructureTag {
    StructureTag {
        class: TagClass::Universal,
        id,
        payload,
    }
}

fn context(id: u64, payload: PL) -> StructureTag {
    StructureTag {
        class: TagClass::Context,
        id,
        payload,
    }
}

fn octets(bytes: Vec<u8>) -> StructureTag {
    universal(OCTET_STRING, PL::P(bytes))
}

fn boolean(value: bool) -> StructureTag {
    universal(BOOLEAN, PL::P(vec![if value { 0xff } else { 0x00 }]))
}

fn enumerated(value: i64) -> StructureTag {
    // Control enumerations are all small non-negative values.
    universal(ENUMERATED, PL::P(vec![value as u8]))
}

fn sequence(fields: Vec<StructureTag>) -> StructureTag {
    universal(SEQUENCE, PL::C(fields))
}

fn phase_fields(cookie: &Option<Vec<u8>>, refresh_done: bool) -> Vec<StructureTag> {
    let mut fields = Vec::new();
    if let Some(cookie) = cookie {
        fields.push(octets(cookie.clone()));
    }
    // refreshDone defaults to TRUE and is only encoded when false.
    if !refresh_done {
        fields.push(boolean(false));
    }
    fields
}

fn phase(tag: StructureTag, what: &str) -> Result<(Option<Vec<u8>>, bool), WatchError> {
    let mut cookie = None;
    let mut refresh_done = true;
    for field in children(tag, what)? {
        if is_universal(&field, OCTET_STRING) {
            cookie = Some(primitive(field, "cookie")?);
        } else if is_universal(&field, BOOLEAN) {
            refresh_done = boolean_value(&primitive(field, "refreshDone")?);
        }
    }
    Ok((cookie, refresh_done))
}

fn to_bytes(tag: StructureTag) -> Result<Vec<u8>, WatchError> {
    let mut buf = BytesMut::new();
    write::encode_into(&mut buf, tag).map_err(|e| invalid(&format!("BER encoding failed: {e}")))?;
    Ok(buf.to_vec())
}

fn parse(value: &[u8], what: &str) -> Result<StructureTag, WatchError> {
    match parse_tag(value) {
        Ok((rest, tag)) if rest.is_empty() => Ok(tag),
        Ok(_) => Err(invalid(&format!("{what}: trailing data"))),
        Err(_) => Err(invalid(&format!("{what}: malformed BER"))),
    }
}

fn is_universal(tag: &StructureTag, id: u64) -> bool {
    tag.class == TagClass::Universal && tag.id == id
}

fn children(tag: StructureTag, what: &str) -> Result<Vec<StructureTag>, WatchError> {
    match tag.payload {
        PL::C(children) => Ok(children),
        PL::P(_) => Err(invalid(&format!("{what}: expected constructed value"))),
    }
}

fn primitive(tag: StructureTag, what: &str) -> Result<Vec<u8>, WatchError> {
    match tag.payload {
        PL::P(bytes) => Ok(bytes),
        PL::C(_) => Err(invalid(&format!("{what}: expected primitive value"))),
    }
}

fn boolean_value(bytes: &[u8]) -> bool {
    bytes.iter().any(|b| *b != 0)
}

fn integer(bytes: &[u8]) -> i64 {
    let negative = bytes.first().is_some_and(|b| b & 0x80 != 0);
    let init: i64 = if negative { -1 } else { 0 };
    bytes.iter().fold(init, |acc, b| (acc << 8) | i64::from(*b))
}
