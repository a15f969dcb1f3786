//! Event model shared by the directory watcher and the synchronizer.
//!
//! These are the small typed values flowing from protocol decoding to
//! reconciliation: permanent identifiers, resumption cookies, decoded
//! directory entries, and the closed [`Event`] set.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Permanent identifier
// ---------------------------------------------------------------------------

/// Permanent identifier of a source entry, stable across renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncId(pub Uuid);

impl SyncId {
    /// Build from the 16 raw octets carried by syncrepl controls.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(SyncId)
    }

    /// Parse a textual UUID, ignoring hyphen placement.
    ///
    /// 389-ds renders `nsUniqueId` as four hyphen-separated groups of eight
    /// hex digits, so hyphens are stripped before parsing.
    pub fn parse_lenient(text: &str) -> Option<Self> {
        let simple: String = text.trim().chars().filter(|c| *c != '-').collect();
        Uuid::parse_str(&simple).ok().map(SyncId)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SyncId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SyncId)
    }
}

impl From<Uuid> for SyncId {
    fn from(uuid: Uuid) -> Self {
        SyncId(uuid)
    }
}

// ---------------------------------------------------------------------------
// Cookie
// ---------------------------------------------------------------------------

const BINARY_COOKIE_PREFIX: &str = "base64:";

/// Opaque resumption token issued by the directory server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cookie(pub Vec<u8>);

impl Cookie {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Textual form used by the state store and the cookie file.
    ///
    /// Cookies are plain text in practice (`rid=000,csn=...`); anything that
    /// is not UTF-8 without line breaks is stored base64-encoded behind a
    /// `base64:` prefix so that the token survives a line-oriented file.
    pub fn to_token(&self) -> String {
        match std::str::from_utf8(&self.0) {
            Ok(text)
                if !text.starts_with(BINARY_COOKIE_PREFIX)
                    && !text.contains(['\n', '\r']) =>
            {
                text.to_string()
            }
            _ => format!(
                "{}{}",
                BINARY_COOKIE_PREFIX,
                base64::engine::general_purpose::STANDARD.encode(&self.0)
            ),
        }
    }

    /// Inverse of [`to_token`](Self::to_token).
    pub fn from_token(token: &str) -> Option<Self> {
        match token.strip_prefix(BINARY_COOKIE_PREFIX) {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .ok()
                .map(Cookie),
            None => Some(Cookie(token.as_bytes().to_vec())),
        }
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_token())
    }
}

impl From<&str> for Cookie {
    fn from(s: &str) -> Self {
        Cookie(s.as_bytes().to_vec())
    }
}

// ---------------------------------------------------------------------------
// Directory entries
// ---------------------------------------------------------------------------

/// Entity kind of a directory entry or destination row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    User,
    Group,
}

impl EntryKind {
    pub const ALL: [EntryKind; 2] = [EntryKind::User, EntryKind::Group];
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// Attribute multimap with case-folded keys.
///
/// LDAP attribute descriptions are case-insensitive, so keys are stored in
/// lower case and lookups fold the requested name the same way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(BTreeMap<String, Vec<Vec<u8>>>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&[Vec<u8>]> {
        self.0.get(&name.to_ascii_lowercase()).map(Vec::as_slice)
    }

    /// First value of `name` as UTF-8 text, if present and valid.
    pub fn first_str(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Replace all values of `name`.
    pub fn set(&mut self, name: &str, values: Vec<Vec<u8>>) {
        self.0.insert(name.to_ascii_lowercase(), values);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Vec<u8>])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>> FromIterator<(K, Vec<Vec<u8>>)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, Vec<Vec<u8>>)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (name, values) in iter {
            attrs
                .0
                .entry(name.as_ref().to_ascii_lowercase())
                .or_default()
                .extend(values);
        }
        attrs
    }
}

/// A decoded source entry, classified as a user or a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Distinguished name; mutable on the source, used only for logging.
    pub dn: String,
    pub kind: EntryKind,
    pub syncid: SyncId,
    pub attrs: Attributes,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Typed event produced by the directory watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A new or modified entry.
    ChangedEntry(DirectoryEntry),
    /// Entries confirmed still present, with no attribute payload.
    UnchangedSyncIds(BTreeSet<SyncId>),
    /// Entries confirmed deleted.
    DeletedSyncIds(BTreeSet<SyncId>),
    /// End of the initial content phase.
    RefreshComplete { autodelete: bool },
    /// Updated resumption token.
    SyncCookie(Cookie),
}

impl Event {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ChangedEntry(_) => "changed",
            Self::UnchangedSyncIds(_) => "unchanged",
            Self::DeletedSyncIds(_) => "deleted",
            Self::RefreshComplete { .. } => "refresh_complete",
            Self::SyncCookie(_) => "cookie",
        }
    }
}
