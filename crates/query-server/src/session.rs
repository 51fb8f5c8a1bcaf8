//! Session state changes reported to the client
//!
//! Statements such as `USE` or `PREPARE` change the client's session. The
//! query manager records each change as a [`SessionUpdate`]; the result
//! protocol folds them into a [`SessionDelta`] and attaches the delta to the
//! next payload exactly once.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One change to the client session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionUpdate {
    SetCatalog(String),
    SetSchema(String),
    SetPath(String),
    SetSessionProperty { name: String, value: String },
    ResetSessionProperty(String),
    SetRole { catalog: String, role: String },
    AddPreparedStatement { name: String, statement: String },
    DeallocatePreparedStatement(String),
    StartTransaction(String),
    ClearTransaction,
}

/// Session changes not yet delivered to the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDelta {
    pub set_catalog: Option<String>,
    pub set_schema: Option<String>,
    pub set_path: Option<String>,
    pub set_session_properties: BTreeMap<String, String>,
    pub reset_session_properties: BTreeSet<String>,
    pub set_roles: BTreeMap<String, String>,
    pub added_prepared_statements: BTreeMap<String, String>,
    pub deallocated_prepared_statements: BTreeSet<String>,
    pub started_transaction_id: Option<String>,
    pub clear_transaction_id: bool,
}

impl SessionDelta {
    pub fn is_empty(&self) -> bool {
        *self == SessionDelta::default()
    }

    /// Fold one update in; a later update for the same name wins
    pub fn apply(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::SetCatalog(catalog) => self.set_catalog = Some(catalog),
            SessionUpdate::SetSchema(schema) => self.set_schema = Some(schema),
            SessionUpdate::SetPath(path) => self.set_path = Some(path),
            SessionUpdate::SetSessionProperty { name, value } => {
                self.reset_session_properties.remove(&name);
                self.set_session_properties.insert(name, value);
            }
            SessionUpdate::ResetSessionProperty(name) => {
                self.set_session_properties.remove(&name);
                self.reset_session_properties.insert(name);
            }
            SessionUpdate::SetRole { catalog, role } => {
                self.set_roles.insert(catalog, role);
            }
            SessionUpdate::AddPreparedStatement { name, statement } => {
                self.deallocated_prepared_statements.remove(&name);
                self.added_prepared_statements.insert(name, statement);
            }
            SessionUpdate::DeallocatePreparedStatement(name) => {
                self.added_prepared_statements.remove(&name);
                self.deallocated_prepared_statements.insert(name);
            }
            SessionUpdate::StartTransaction(id) => {
                self.clear_transaction_id = false;
                self.started_transaction_id = Some(id);
            }
            SessionUpdate::ClearTransaction => {
                self.started_transaction_id = None;
                self.clear_transaction_id = true;
            }
        }
    }

    pub fn extend(&mut self, updates: impl IntoIterator<Item = SessionUpdate>) {
        for update in updates {
            self.apply(update);
        }
    }

    /// Hand out everything accumulated and start over
    pub fn take(&mut self) -> SessionDelta {
        std::mem::take(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_later_updates_win() {
        let mut delta = SessionDelta::default();
        assert!(delta.is_empty());
        delta.extend(vec![
            SessionUpdate::SetCatalog("hive".into()),
            SessionUpdate::SetCatalog("iceberg".into()),
            SessionUpdate::SetSessionProperty {
                name: "join_distribution".into(),
                value: "broadcast".into(),
            },
            SessionUpdate::ResetSessionProperty("join_distribution".into()),
            SessionUpdate::ResetSessionProperty("spill".into()),
            SessionUpdate::SetSessionProperty {
                name: "spill".into(),
                value: "true".into(),
            },
        ]);
        assert_eq!(delta.set_catalog.as_deref(), Some("iceberg"));
        assert_eq!(
            delta.reset_session_properties,
            BTreeSet::from(["join_distribution".to_string()])
        );
        assert_eq!(delta.set_session_properties.get("spill").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_prepared_statements_and_transactions() {
        let mut delta = SessionDelta::default();
        delta.apply(SessionUpdate::AddPreparedStatement {
            name: "q1".into(),
            statement: "SELECT 1".into(),
        });
        delta.apply(SessionUpdate::DeallocatePreparedStatement("q1".into()));
        assert!(delta.added_prepared_statements.is_empty());
        assert!(delta.deallocated_prepared_statements.contains("q1"));

        delta.apply(SessionUpdate::StartTransaction("tx-1".into()));
        assert!(!delta.clear_transaction_id);
        delta.apply(SessionUpdate::ClearTransaction);
        assert!(delta.clear_transaction_id);
        assert!(delta.started_transaction_id.is_none());
    }

    #[test]
    fn test_take_clears() {
        let mut delta = SessionDelta::default();
        delta.apply(SessionUpdate::SetRole {
            catalog: "hive".into(),
            role: "admin".into(),
        });
        let taken = delta.take();
        assert_eq!(taken.set_roles.len(), 1);
        assert!(delta.is_empty());
    }
}
