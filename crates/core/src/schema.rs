//! Per-kind attribute schema tables.
//!
//! Each entry kind maps destination field names to LDAP attribute names
//! with an explicit syntax and multiplicity. Projecting a directory entry
//! through its table yields the typed attribute set stored on destination
//! rows.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::models::{Attributes, EntryKind, SyncId};

/// Syntax of an attribute's raw values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    Text,
    Integer,
    Boolean,
    Uuid,
}

/// One row of a schema table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSpec {
    /// Destination field name.
    pub field: &'static str,
    /// LDAP attribute name.
    pub ldap: &'static str,
    pub syntax: Syntax,
    pub multi: bool,
}

const fn text(field: &'static str, ldap: &'static str) -> AttributeSpec {
    AttributeSpec {
        field,
        ldap,
        syntax: Syntax::Text,
        multi: false,
    }
}

const fn texts(field: &'static str, ldap: &'static str) -> AttributeSpec {
    AttributeSpec {
        field,
        ldap,
        syntax: Syntax::Text,
        multi: true,
    }
}

const fn number(field: &'static str, ldap: &'static str) -> AttributeSpec {
    AttributeSpec {
        field,
        ldap,
        syntax: Syntax::Integer,
        multi: false,
    }
}

/// Attributes common to every user entry.
pub const BASE_USER: &[AttributeSpec] = &[
    text("commonName", "cn"),
    text("displayName", "displayName"),
    text("employeeNumber", "employeeNumber"),
    text("givenName", "givenName"),
    text("initials", "initials"),
    texts("mail", "mail"),
    texts("mobile", "mobile"),
    text("surname", "sn"),
    texts("telephoneNumber", "telephoneNumber"),
    text("title", "title"),
    texts("memberOf", "memberOf"),
];

/// POSIX account attributes.
pub const RFC2307_USER: &[AttributeSpec] = &[
    text("uid", "uid"),
    number("uidNumber", "uidNumber"),
    number("gidNumber", "gidNumber"),
    text("homeDirectory", "homeDirectory"),
    text("loginShell", "loginShell"),
    text("gecos", "gecos"),
];

/// FreeIPA account attributes.
pub const FREEIPA_USER: &[AttributeSpec] = &[
    AttributeSpec {
        field: "accountLocked",
        ldap: "nsAccountLock",
        syntax: Syntax::Boolean,
        multi: false,
    },
    AttributeSpec {
        field: "ipaUniqueId",
        ldap: "ipaUniqueID",
        syntax: Syntax::Uuid,
        multi: false,
    },
];

/// Attributes common to every group entry.
pub const BASE_GROUP: &[AttributeSpec] = &[
    text("commonName", "cn"),
    text("description", "description"),
    texts("member", "member"),
];

/// POSIX group attributes.
pub const RFC2307_GROUP: &[AttributeSpec] = &[
    number("gidNumber", "gidNumber"),
    texts("memberUid", "memberUid"),
];

/// Typed attribute set stored on a destination row.
pub type Projection = BTreeMap<String, Value>;

/// A raw value that its accessor could not parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeError {
    pub attribute: String,
    pub detail: String,
}

/// The schema table of one entry kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub kind: EntryKind,
    specs: Vec<AttributeSpec>,
}

impl Schema {
    pub fn new(kind: EntryKind, tables: &[&[AttributeSpec]]) -> Self {
        Self {
            kind,
            specs: tables.iter().flat_map(|t| t.iter().copied()).collect(),
        }
    }

    pub fn specs(&self) -> &[AttributeSpec] {
        &self.specs
    }

    pub fn spec(&self, field: &str) -> Option<&AttributeSpec> {
        self.specs.iter().find(|s| s.field == field)
    }

    /// Project raw attributes onto this table.
    ///
    /// Multi-valued fields always appear (possibly as an empty list);
    /// absent single-valued fields are omitted.
    pub fn project(&self, attrs: &Attributes) -> Result<Projection, AttributeError> {
        let mut projection = Projection::new();
        for spec in &self.specs {
            let raw = attrs.get(spec.ldap).unwrap_or_default();
            let mut values = raw
                .iter()
                .map(|v| parse_value(spec, v))
                .collect::<Result<Vec<_>, _>>()?;
            if spec.multi {
                projection.insert(spec.field.to_string(), Value::Array(values));
            } else if !values.is_empty() {
                projection.insert(spec.field.to_string(), values.swap_remove(0));
            }
        }
        Ok(projection)
    }
}

fn parse_value(spec: &AttributeSpec, raw: &[u8]) -> Result<Value, AttributeError> {
    let fail = |detail: String| AttributeError {
        attribute: spec.ldap.to_string(),
        detail,
    };
    let text = std::str::from_utf8(raw).map_err(|e| fail(format!("not UTF-8: {e}")))?;
    match spec.syntax {
        Syntax::Text => Ok(Value::String(text.to_string())),
        Syntax::Integer => text
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| fail(format!("not an integer: {e}"))),
        Syntax::Boolean => Ok(Value::Bool(text.eq_ignore_ascii_case("true"))),
        Syntax::Uuid => SyncId::parse_lenient(text)
            .map(|id| Value::String(id.to_string()))
            .ok_or_else(|| fail(format!("not a UUID: {text}"))),
    }
}
