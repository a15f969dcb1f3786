//! Raw directory protocol responses.
//!
//! An [`LdapResponse`] mirrors one protocol message as the client library
//! hands it over: a result-type code, a list of entries or intermediate
//! messages (each with its own controls), and the message-level controls.
//! The watcher consumes these; the trace recorder serializes them.

use std::collections::VecDeque;
use std::future::Future;

use crate::errors::WatchError;

/// Result-type code of a search entry message.
pub const RES_SEARCH_ENTRY: u32 = 100;
/// Result-type code of a search done message.
pub const RES_SEARCH_RESULT: u32 = 101;
/// Result-type code of a search continuation reference.
pub const RES_SEARCH_REFERENCE: u32 = 115;
/// Result-type code of an intermediate response.
pub const RES_INTERMEDIATE: u32 = 121;

/// Kind of a protocol response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    SearchEntry,
    SearchResult,
    SearchReference,
    Intermediate,
    /// Any other result-type code, kept so that traces round-trip.
    Other(u32),
}

impl ResponseKind {
    pub fn code(self) -> u32 {
        match self {
            Self::SearchEntry => RES_SEARCH_ENTRY,
            Self::SearchResult => RES_SEARCH_RESULT,
            Self::SearchReference => RES_SEARCH_REFERENCE,
            Self::Intermediate => RES_INTERMEDIATE,
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            RES_SEARCH_ENTRY => Self::SearchEntry,
            RES_SEARCH_RESULT => Self::SearchResult,
            RES_SEARCH_REFERENCE => Self::SearchReference,
            RES_INTERMEDIATE => Self::Intermediate,
            other => Self::Other(other),
        }
    }
}

/// A protocol control as carried on the wire.
///
/// An absent control value is represented by an empty `value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawControl {
    pub oid: String,
    pub critical: bool,
    pub value: Vec<u8>,
}

impl RawControl {
    pub fn new(oid: impl Into<String>, critical: bool, value: Vec<u8>) -> Self {
        Self {
            oid: oid.into(),
            critical,
            value,
        }
    }
}

impl From<ldap3::controls::RawControl> for RawControl {
    fn from(raw: ldap3::controls::RawControl) -> Self {
        Self {
            oid: raw.ctype,
            critical: raw.crit,
            value: raw.val.unwrap_or_default(),
        }
    }
}

impl From<RawControl> for ldap3::controls::RawControl {
    fn from(ctrl: RawControl) -> Self {
        ldap3::controls::RawControl {
            ctype: ctrl.oid,
            crit: ctrl.critical,
            val: if ctrl.value.is_empty() {
                None
            } else {
                Some(ctrl.value)
            },
        }
    }
}

/// Ordered attribute list of a raw entry, in server order.
pub type RawAttributes = Vec<(String, Vec<Vec<u8>>)>;

/// One item carried by a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseData {
    /// A directory entry with its entry-level controls.
    Entry {
        dn: String,
        attrs: RawAttributes,
        ctrls: Vec<RawControl>,
    },
    /// An intermediate message (`responseName`, `responseValue`).
    Intermediate {
        name: String,
        value: Vec<u8>,
        ctrls: Vec<RawControl>,
    },
}

/// One raw protocol response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResponse {
    pub kind: ResponseKind,
    pub data: Vec<ResponseData>,
    pub ctrls: Vec<RawControl>,
}

impl LdapResponse {
    /// A search entry response carrying a single entry.
    pub fn entry(dn: impl Into<String>, attrs: RawAttributes, ctrls: Vec<RawControl>) -> Self {
        Self {
            kind: ResponseKind::SearchEntry,
            data: vec![ResponseData::Entry {
                dn: dn.into(),
                attrs,
                ctrls,
            }],
            ctrls: Vec::new(),
        }
    }

    /// An intermediate response carrying a single message.
    pub fn intermediate(name: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            kind: ResponseKind::Intermediate,
            data: vec![ResponseData::Intermediate {
                name: name.into(),
                value,
                ctrls: Vec::new(),
            }],
            ctrls: Vec::new(),
        }
    }

    /// A search done response with message-level controls.
    pub fn search_result(ctrls: Vec<RawControl>) -> Self {
        Self {
            kind: ResponseKind::SearchResult,
            data: Vec::new(),
            ctrls,
        }
    }
}

// ---------------------------------------------------------------------------
// Response sources
// ---------------------------------------------------------------------------

/// Pull interface over a stream of raw responses.
///
/// Each call may suspend on network I/O. `Ok(None)` means the stream has
/// ended; for a one-shot search that happens after the search done message.
pub trait ResponseSource {
    fn next_response(
        &mut self,
    ) -> impl Future<Output = Result<Option<LdapResponse>, WatchError>> + Send;
}

/// Source replaying a fixed list of responses, e.g. a decoded trace.
#[derive(Debug, Clone, Default)]
pub struct ReplaySource {
    responses: VecDeque<LdapResponse>,
}

impl ReplaySource {
    pub fn new(responses: impl IntoIterator<Item = LdapResponse>) -> Self {
        Self {
            responses: responses.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.responses.len()
    }
}

impl ResponseSource for ReplaySource {
    async fn next_response(&mut self) -> Result<Option<LdapResponse>, WatchError> {
        Ok(self.responses.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes() {
        for kind in [
            ResponseKind::SearchEntry,
            ResponseKind::SearchResult,
            ResponseKind::SearchReference,
            ResponseKind::Intermediate,
            ResponseKind::Other(120),
        ] {
            assert_eq!(ResponseKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn test_raw_control_conversion_drops_empty_value() {
        let ctrl = RawControl::new("1.2.3", true, Vec::new());
        let raw: ldap3::controls::RawControl = ctrl.clone().into();
        assert!(raw.val.is_none());
        assert_eq!(RawControl::from(raw), ctrl);
    }

    #[tokio::test]
    async fn test_replay_source_drains_in_order() {
        let mut source = ReplaySource::new(vec![
            LdapResponse::intermediate("1.2.3", vec![1]),
            LdapResponse::search_result(Vec::new()),
        ]);
        assert_eq!(source.remaining(), 2);
        let first = source.next_response().await.unwrap().unwrap();
        assert_eq!(first.kind, ResponseKind::Intermediate);
        let second = source.next_response().await.unwrap().unwrap();
        assert_eq!(second.kind, ResponseKind::SearchResult);
        assert!(source.next_response().await.unwrap().is_none());
    }
}
