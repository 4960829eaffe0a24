//! Job and storage location models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Storage location (yard, shop, container...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub id: String,
    pub name: String,
    pub address: Option<String>,
    /// Location that returned units fall back to when no other is known
    pub is_default: bool,
}

/// Field job. `diagram` is the denormalized wiring diagram payload
/// (`{ "nodes": [...], "edges": [...] }`) owned by the diagram view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub client: Option<String>,
    pub location: Option<String>,
    pub diagram: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

const CODE_KEYS: [&str; 2] = ["equipmentCode", "equipment_code"];

impl Job {
    /// A job that has not been soft-deleted
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Equipment codes referenced by the diagram's nodes, either on the node
    /// itself or under its `data` object.
    pub fn diagram_equipment_codes(&self) -> BTreeSet<String> {
        let mut codes = BTreeSet::new();
        let nodes = match self
            .diagram
            .as_ref()
            .and_then(|d| d.get("nodes"))
            .and_then(|n| n.as_array())
        {
            Some(nodes) => nodes,
            None => return codes,
        };

        for node in nodes {
            for holder in [Some(node), node.get("data")].into_iter().flatten() {
                for key in CODE_KEYS {
                    if let Some(code) = holder.get(key).and_then(|v| v.as_str()) {
                        if !code.is_empty() {
                            codes.insert(code.to_string());
                        }
                    }
                }
            }
        }
        codes
    }
}
