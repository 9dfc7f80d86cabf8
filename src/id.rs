//! Identifier generation.
//!
//! Jobs, results, and deliveries use ULIDs so every listing that needs a
//! streaming cursor can rely on lexicographic order matching creation order.
//! Attempt correlation uses plain v4 UUIDs; those are never used as cursors.

use ulid::Ulid;
use uuid::Uuid;

/// New time-ordered entity ID.
pub fn new_id() -> String {
    Ulid::new().to_string()
}

/// New correlation ID for a single LLM attempt.
pub fn attempt_id() -> String {
    Uuid::new_v4().to_string()
}
