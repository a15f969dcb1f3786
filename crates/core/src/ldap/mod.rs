//! Directory side: syncrepl controls, raw responses, vendor policy, the
//! protocol state machine, and the live `ldap3` adapter.

pub mod client;
pub mod controls;
pub mod flavor;
pub mod response;
pub mod watcher;

pub use client::{LdapDirectory, LdapSearch};
pub use controls::RefreshMode;
pub use flavor::{DirectoryModel, EntryModel, Flavor, ServerQuirks};
pub use response::{LdapResponse, RawControl, ReplaySource, ResponseData, ResponseKind, ResponseSource};
pub use watcher::{EventStream, Watcher};
