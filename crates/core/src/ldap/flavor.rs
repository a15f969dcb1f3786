//! Directory vendor policy table.
//!
//! A [`Flavor`] fixes the object classes that identify users and groups,
//! the naming and permanent-identifier attributes, the attribute schema
//! tables, and the server quirks the watcher compensates for.

use serde::{Deserialize, Serialize};

use crate::models::{Attributes, EntryKind};
use crate::schema::{self, Schema};

/// Directory vendor / schema family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    /// Plain `person` / `groupOfNames` entries.
    #[default]
    Rfc4519,
    /// POSIX accounts and groups.
    Rfc2307,
    /// FreeIPA on 389-ds-base.
    FreeIpa,
}

impl std::fmt::Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rfc4519 => write!(f, "rfc4519"),
            Self::Rfc2307 => write!(f, "rfc2307"),
            Self::FreeIpa => write!(f, "freeipa"),
        }
    }
}

/// Known deviations from RFC 4533 that affect `RefreshComplete.autodelete`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerQuirks {
    /// In refreshOnly mode with a request cookie the server sends changed
    /// and deleted entries, then a done control without `refreshDeletes`.
    /// Trust the explicit delete list instead.
    pub incremental_refresh_omits_deletes_flag: bool,
    /// In refreshAndPersist mode without a request cookie the server ends
    /// a full enumeration with a refreshDelete marker. Treat it as present.
    pub initial_persist_marks_delete_phase: bool,
}

/// How one entry kind is recognised and named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryModel {
    pub object_class: String,
    /// Naming attribute used for guess matching.
    pub key: String,
    /// Attribute holding the permanent identifier.
    pub uuid: String,
}

impl EntryModel {
    fn new(object_class: &str, key: &str, uuid: &str) -> Self {
        Self {
            object_class: object_class.into(),
            key: key.into(),
            uuid: uuid.into(),
        }
    }

    /// Search filter matching every entry of this kind.
    pub fn filter(&self) -> String {
        format!("(objectClass={})", self.object_class)
    }
}

/// Complete per-directory policy used by the watcher and synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryModel {
    pub flavor: Flavor,
    pub user: EntryModel,
    pub group: EntryModel,
    pub quirks: ServerQuirks,
}

impl DirectoryModel {
    pub fn new(flavor: Flavor) -> Self {
        match flavor {
            Flavor::Rfc4519 => Self {
                flavor,
                user: EntryModel::new("person", "cn", "entryUUID"),
                group: EntryModel::new("groupOfNames", "cn", "entryUUID"),
                quirks: ServerQuirks::default(),
            },
            Flavor::Rfc2307 => Self {
                flavor,
                user: EntryModel::new("posixAccount", "uid", "entryUUID"),
                group: EntryModel::new("posixGroup", "cn", "entryUUID"),
                quirks: ServerQuirks::default(),
            },
            Flavor::FreeIpa => Self {
                flavor,
                user: EntryModel::new("inetOrgPerson", "uid", "nsUniqueId"),
                group: EntryModel::new("ipaUserGroup", "cn", "nsUniqueId"),
                quirks: ServerQuirks {
                    incremental_refresh_omits_deletes_flag: true,
                    initial_persist_marks_delete_phase: true,
                },
            },
        }
    }

    /// Override the object classes chosen by the flavor.
    pub fn with_object_classes(mut self, user: Option<&str>, group: Option<&str>) -> Self {
        if let Some(class) = user {
            self.user.object_class = class.to_string();
        }
        if let Some(class) = group {
            self.group.object_class = class.to_string();
        }
        self
    }

    pub fn model(&self, kind: EntryKind) -> &EntryModel {
        match kind {
            EntryKind::User => &self.user,
            EntryKind::Group => &self.group,
        }
    }

    /// Filter for the sync search: every user and every group.
    pub fn search_filter(&self) -> String {
        format!("(|{}{})", self.user.filter(), self.group.filter())
    }

    /// Classify an entry by the first of its object classes that matches.
    pub fn classify(&self, attrs: &Attributes) -> Option<EntryKind> {
        attrs
            .get("objectClass")
            .unwrap_or_default()
            .iter()
            .filter_map(|v| std::str::from_utf8(v).ok())
            .find_map(|class| {
                if class.eq_ignore_ascii_case(&self.user.object_class) {
                    Some(EntryKind::User)
                } else if class.eq_ignore_ascii_case(&self.group.object_class) {
                    Some(EntryKind::Group)
                } else {
                    None
                }
            })
    }

    /// Attribute schema table for `kind`.
    pub fn schema(&self, kind: EntryKind) -> Schema {
        match (self.flavor, kind) {
            (Flavor::Rfc4519, EntryKind::User) => Schema::new(kind, &[schema::BASE_USER]),
            (Flavor::Rfc2307, EntryKind::User) => {
                Schema::new(kind, &[schema::BASE_USER, schema::RFC2307_USER])
            }
            (Flavor::FreeIpa, EntryKind::User) => Schema::new(
                kind,
                &[schema::BASE_USER, schema::RFC2307_USER, schema::FREEIPA_USER],
            ),
            (Flavor::Rfc4519, EntryKind::Group) => Schema::new(kind, &[schema::BASE_GROUP]),
            (Flavor::Rfc2307 | Flavor::FreeIpa, EntryKind::Group) => {
                Schema::new(kind, &[schema::BASE_GROUP, schema::RFC2307_GROUP])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes(values: &[&str]) -> Attributes {
        values
            .iter()
            .map(|v| ("objectClass", vec![v.as_bytes().to_vec()]))
            .collect()
    }

    #[test]
    fn test_search_filter() {
        let model = DirectoryModel::new(Flavor::Rfc4519);
        assert_eq!(
            model.search_filter(),
            "(|(objectClass=person)(objectClass=groupOfNames))"
        );
    }

    #[test]
    fn test_classify_first_match_wins() {
        let model = DirectoryModel::new(Flavor::Rfc4519);
        assert_eq!(
            model.classify(&classes(&["top", "Person", "organizationalPerson"])),
            Some(EntryKind::User)
        );
        assert_eq!(
            model.classify(&classes(&["groupOfNames", "person"])),
            Some(EntryKind::Group)
        );
        assert_eq!(model.classify(&classes(&["device"])), None);
        assert_eq!(model.classify(&Attributes::new()), None);
    }

    #[test]
    fn test_freeipa_policy() {
        let model = DirectoryModel::new(Flavor::FreeIpa);
        assert_eq!(model.user.uuid, "nsUniqueId");
        assert!(model.quirks.incremental_refresh_omits_deletes_flag);
        assert!(model.quirks.initial_persist_marks_delete_phase);
        assert!(model.schema(EntryKind::User).spec("accountLocked").is_some());
    }

    #[test]
    fn test_object_class_override() {
        let model = DirectoryModel::new(Flavor::Rfc4519)
            .with_object_classes(Some("inetOrgPerson"), None);
        assert_eq!(model.user.object_class, "inetOrgPerson");
        assert_eq!(model.group.object_class, "groupOfNames");
    }
}
