//! redb table definitions for the WarpGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Applications keyed by `{tenant}.{application}`.
pub const APPLICATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("applications");

/// System-wide records, such as the platform version status.
pub const SYSTEM: TableDefinition<&str, &[u8]> = TableDefinition::new("system");

/// Key of the version status record in [`SYSTEM`].
pub const VERSION_STATUS_KEY: &str = "version-status";
