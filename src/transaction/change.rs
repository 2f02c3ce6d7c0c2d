// ============================================================================
// Transaction Change Log
// ============================================================================
//
// Every transactional write is recorded as a Change. Commit re-checks each
// touched key for conflicts and then replays the log onto committed state;
// abort simply drops it.
//
// ============================================================================

use crate::core::Document;

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Insert {
        namespace: String,
        id: String,
        doc: Document,
    },

    Replace {
        namespace: String,
        id: String,
        old: Document,
        new: Document,
    },

    Delete {
        namespace: String,
        id: String,
        old: Document,
    },
}

impl Change {
    pub fn namespace(&self) -> &str {
        match self {
            Change::Insert { namespace, .. } => namespace,
            Change::Replace { namespace, .. } => namespace,
            Change::Delete { namespace, .. } => namespace,
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            Change::Insert { id, .. } => id,
            Change::Replace { id, .. } => id,
            Change::Delete { id, .. } => id,
        }
    }

    /// Document state after the change, `None` for deletes.
    pub fn after(&self) -> Option<&Document> {
        match self {
            Change::Insert { doc, .. } => Some(doc),
            Change::Replace { new, .. } => Some(new),
            Change::Delete { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Change::Insert { .. } => "insert",
            Change::Replace { .. } => "replace",
            Change::Delete { .. } => "delete",
        }
    }
}
