//! redb table definitions for the fleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Fleet templates keyed by template id.
pub const TEMPLATES: TableDefinition<&str, &[u8]> = TableDefinition::new("templates");

/// Server instances keyed by instance id. TERMINATED records are kept for audit.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");
