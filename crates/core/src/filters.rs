//! The shape of a single postgres_changes subscription (§3 Binding).

use serde::Serialize;

/// One `postgres_changes` registration: event name (`INSERT`, `UPDATE`,
/// `DELETE`, or `*`), schema, table, and an optional literal filter
/// string in PostgREST form (e.g. `"id=eq.1"`).
///
/// `id` is stamped onto the binding by the postgres_changes handshake
/// once the join reply assigns one (§4.D); it starts `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostgresChangesFilter {
    pub event: String,
    pub schema: String,
    pub table: String,
    pub filter: Option<String>,
    #[serde(skip)]
    pub id: Option<String>,
}

impl PostgresChangesFilter {
    pub fn new(event: impl Into<String>, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            schema: schema.into(),
            table: table.into(),
            filter: None,
            id: None,
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// `(event, schema, table, filter)` equality used by the join-reply
    /// handshake to pair client bindings with server-assigned ids.
    pub fn matches_server_entry(&self, event: &str, schema: &str, table: &str, filter: Option<&str>) -> bool {
        self.event.eq_ignore_ascii_case(event)
            && self.schema == schema
            && self.table == table
            && self.filter.as_deref() == filter
    }
}
