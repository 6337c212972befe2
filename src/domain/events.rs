//! Domain events: an audit trail of commits, aborts, and merges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A significant, immutable occurrence in the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    /// A SET committed: the key became visible in the commit table.
    ObjectCommitted {
        object_key: String,
        stripe_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// A proxy reported a SET as aborted.
    ObjectAborted {
        object_key: String,
        timestamp: DateTime<Utc>,
    },

    /// A DEL (by key or by stripe) committed.
    ObjectDeleted {
        object_key: Option<String>,
        stripe_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// A new stripe was placed.
    StripePlaced {
        stripe_id: u64,
        clusters: Vec<u32>,
        timestamp: DateTime<Utc>,
    },

    /// One merge chunk succeeded.
    MergeChunkCompleted {
        merged_stripe_id: u64,
        source_stripes: Vec<u64>,
        local_recompute_ms: u64,
        global_recompute_ms: u64,
        relocation_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// One merge chunk was abandoned; its sources are untouched.
    MergeChunkAborted {
        source_stripes: Vec<u64>,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// setParameter installed a new schema and reset placement state.
    SchemaInstalled { timestamp: DateTime<Utc> },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ObjectCommitted { .. } => "ObjectCommitted",
            DomainEvent::ObjectAborted { .. } => "ObjectAborted",
            DomainEvent::ObjectDeleted { .. } => "ObjectDeleted",
            DomainEvent::StripePlaced { .. } => "StripePlaced",
            DomainEvent::MergeChunkCompleted { .. } => "MergeChunkCompleted",
            DomainEvent::MergeChunkAborted { .. } => "MergeChunkAborted",
            DomainEvent::SchemaInstalled { .. } => "SchemaInstalled",
        }
    }

    pub fn object_committed(object_key: impl Into<String>, stripe_id: u64) -> Self {
        DomainEvent::ObjectCommitted {
            object_key: object_key.into(),
            stripe_id,
            timestamp: Utc::now(),
        }
    }

    pub fn object_aborted(object_key: impl Into<String>) -> Self {
        DomainEvent::ObjectAborted {
            object_key: object_key.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn object_deleted(object_key: Option<String>, stripe_id: u64) -> Self {
        DomainEvent::ObjectDeleted {
            object_key,
            stripe_id,
            timestamp: Utc::now(),
        }
    }

    pub fn stripe_placed(stripe_id: u64, clusters: Vec<u32>) -> Self {
        DomainEvent::StripePlaced {
            stripe_id,
            clusters,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_round_trips() {
        let event = DomainEvent::object_committed("obj1", 7);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("ObjectCommitted"));
        let deserialized: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.event_type(), "ObjectCommitted");
    }

    #[test]
    fn event_type_names() {
        assert_eq!(
            DomainEvent::object_aborted("obj2").event_type(),
            "ObjectAborted"
        );
        assert_eq!(
            DomainEvent::stripe_placed(3, vec![0, 1]).event_type(),
            "StripePlaced"
        );
    }
}
