//! Live directory adapter over `ldap3`.
//!
//! [`LdapDirectory`] owns an authenticated async connection and issues the
//! syncrepl search. The resulting [`LdapSearch`] is a [`ResponseSource`]
//! that converts each `ldap3` result message into the raw
//! [`LdapResponse`] shape the watcher and trace recorder consume.

use std::time::Duration;

use ldap3::asn1::{StructureTag, TagClass, PL};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, ResultEntry, Scope, SearchStream};
use tracing::{debug, info, warn};

use super::controls::{RefreshMode, SyncRequestValue};
use super::flavor::DirectoryModel;
use super::response::{
    LdapResponse, RawAttributes, RawControl, ResponseData, ResponseKind, ResponseSource,
};
use super::watcher::Watcher;
use crate::config::{BindMethod, LdapConfig};
use crate::errors::WatchError;
use crate::models::Cookie;

/// Attributes requested by the sync search: all user and operational ones.
const SEARCH_ATTRS: [&str; 2] = ["*", "+"];

/// Application tag of a search result entry.
const TAG_SEARCH_ENTRY: u64 = 4;
/// Application tag of an intermediate response.
const TAG_INTERMEDIATE: u64 = 25;

/// An authenticated connection to the source directory.
pub struct LdapDirectory {
    ldap: Ldap,
    base: String,
    model: DirectoryModel,
}

impl LdapDirectory {
    /// Connect and bind according to `config`.
    pub async fn connect(config: &LdapConfig) -> Result<Self, WatchError> {
        let settings =
            LdapConnSettings::new().set_conn_timeout(Duration::from_secs(config.timeout_secs));

        debug!(url = %config.url, "connecting to LDAP server");
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &config.url).await?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        let result = match config.bind {
            BindMethod::Simple => {
                let bind_dn = config.bind_dn.as_deref().unwrap_or_default();
                let password = config.bind_password.as_deref().unwrap_or_default();
                debug!(bind_dn = %bind_dn, "performing simple bind");
                ldap.simple_bind(bind_dn, password).await?
            }
            BindMethod::External => {
                debug!("performing SASL EXTERNAL bind");
                ldap.sasl_external_bind().await?
            }
            BindMethod::Anonymous => {
                debug!("performing anonymous bind");
                ldap.simple_bind("", "").await?
            }
        };
        if result.rc != 0 {
            return Err(WatchError::Ldap(format!(
                "bind failed with code {}: {}",
                result.rc, result.text
            )));
        }

        let base = config.base_dn();
        info!(url = %config.url, base = %base, flavor = %config.flavor, "connected to LDAP server");

        Ok(Self {
            ldap,
            base,
            model: config.directory_model(),
        })
    }

    pub fn model(&self) -> &DirectoryModel {
        &self.model
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Issue the syncrepl search for all users and groups.
    pub async fn sync_search(
        &mut self,
        cookie: Option<&Cookie>,
        mode: RefreshMode,
    ) -> Result<LdapSearch, WatchError> {
        let request = SyncRequestValue::new(mode, cookie.map(|c| c.as_bytes().to_vec()));
        let filter = self.model.search_filter();
        debug!(%mode, filter = %filter, base = %self.base, "starting sync search");

        let attrs: Vec<String> = SEARCH_ATTRS.iter().map(|a| a.to_string()).collect();
        let control: ldap3::controls::RawControl = request.to_control()?.into();
        let stream = self
            .ldap
            .with_controls(vec![control])
            .streaming_search(&self.base, Scope::Subtree, &filter, attrs)
            .await?;

        Ok(LdapSearch {
            stream,
            finished: false,
        })
    }

    /// Issue the sync search and wrap it in a [`Watcher`].
    pub async fn watch(
        &mut self,
        cookie: Option<&Cookie>,
        mode: RefreshMode,
    ) -> Result<Watcher<LdapSearch>, WatchError> {
        let search = self.sync_search(cookie, mode).await?;
        Ok(Watcher::new(
            search,
            self.model.clone(),
            mode,
            cookie.is_some(),
        ))
    }

    /// Close the connection.
    pub async fn unbind(mut self) -> Result<(), WatchError> {
        self.ldap.unbind().await?;
        Ok(())
    }
}

/// A running sync search.
pub struct LdapSearch {
    stream: SearchStream<'static, String, Vec<String>>,
    finished: bool,
}

impl ResponseSource for LdapSearch {
    async fn next_response(&mut self) -> Result<Option<LdapResponse>, WatchError> {
        if self.finished {
            return Ok(None);
        }
        match self.stream.next().await? {
            Some(entry) => convert_entry(entry).map(Some),
            None => {
                self.finished = true;
                let result = self.stream.finish().await;
                if result.rc != 0 {
                    return Err(WatchError::SearchFailed {
                        rc: result.rc,
                        text: result.text,
                    });
                }
                let ctrls = result.ctrls.into_iter().map(|c| c.1.into()).collect();
                Ok(Some(LdapResponse::search_result(ctrls)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Message conversion
// ---------------------------------------------------------------------------

fn convert_entry(entry: ResultEntry) -> Result<LdapResponse, WatchError> {
    let (tag, controls) = (entry.0, entry.1);
    let ctrls: Vec<RawControl> = controls.into_iter().map(|c| c.1.into()).collect();
    if tag.class != TagClass::Application {
        return Err(WatchError::Protocol(format!(
            "unexpected {:?} message tag {}",
            tag.class, tag.id
        )));
    }
    // LDAP result-type codes are the constructed application tag octet.
    let code = u32::try_from(tag.id)
        .ok()
        .filter(|id| *id < 0x20)
        .ok_or_else(|| WatchError::Protocol(format!("unexpected message tag {}", tag.id)))?;
    let kind = ResponseKind::from_code(0x60 | code);
    let data = match tag.id {
        TAG_SEARCH_ENTRY => {
            let (dn, attrs) = search_entry_fields(tag)?;
            vec![ResponseData::Entry { dn, attrs, ctrls }]
        }
        TAG_INTERMEDIATE => {
            let (name, value) = intermediate_fields(tag)?;
            vec![ResponseData::Intermediate { name, value, ctrls }]
        }
        // References and unknown messages carry nothing the watcher reads.
        _ => Vec::new(),
    };
    Ok(LdapResponse {
        kind,
        data,
        ctrls: Vec::new(),
    })
}

fn malformed(what: &str) -> WatchError {
    WatchError::Protocol(format!("malformed {what}"))
}

fn constructed(tag: StructureTag, what: &str) -> Result<Vec<StructureTag>, WatchError> {
    match tag.payload {
        PL::C(children) => Ok(children),
        PL::P(_) => Err(malformed(what)),
    }
}

fn octets(tag: StructureTag, what: &str) -> Result<Vec<u8>, WatchError> {
    match tag.payload {
        PL::P(bytes) => Ok(bytes),
        PL::C(_) => Err(malformed(what)),
    }
}

fn text(tag: StructureTag, what: &str) -> Result<String, WatchError> {
    String::from_utf8(octets(tag, what)?).map_err(|_| malformed(what))
}

/// `SearchResultEntry ::= [APPLICATION 4] SEQUENCE { objectName, attributes }`
fn search_entry_fields(tag: StructureTag) -> Result<(String, RawAttributes), WatchError> {
    let mut fields = constructed(tag, "search entry")?.into_iter();
    let dn = text(fields.next().ok_or_else(|| malformed("search entry"))?, "objectName")?;
    let mut attrs = RawAttributes::new();
    if let Some(list) = fields.next() {
        for attr in constructed(list, "attribute list")? {
            let mut parts = constructed(attr, "attribute")?.into_iter();
            let name = text(parts.next().ok_or_else(|| malformed("attribute"))?, "type")?;
            let values = match parts.next() {
                Some(set) => constructed(set, "attribute values")?
                    .into_iter()
                    .map(|v| octets(v, "attribute value"))
                    .collect::<Result<Vec<_>, _>>()?,
                None => Vec::new(),
            };
            attrs.push((name, values));
        }
    }
    Ok((dn, attrs))
}

/// `IntermediateResponse ::= [APPLICATION 25] SEQUENCE { [0] name, [1] value }`
fn intermediate_fields(tag: StructureTag) -> Result<(String, Vec<u8>), WatchError> {
    let mut name = String::new();
    let mut value = Vec::new();
    for field in constructed(tag, "intermediate response")? {
        match (field.class, field.id) {
            (TagClass::Context, 0) => name = text(field, "responseName")?,
            (TagClass::Context, 1) => value = octets(field, "responseValue")?,
            _ => return Err(malformed("intermediate response")),
        }
    }
    Ok((name, value))
}
