//! External-id generation.
//!
//! Human-visible identifiers are compact random 128-bit values rendered as
//! 32 lowercase hex characters. They are user-assignable; this is only the
//! default. Uniqueness is enforced by the store.

use uuid::Uuid;

/// Generate a fresh external id: 32 hex chars, no hyphens.
pub fn external_id() -> String {
    Uuid::new_v4().simple().to_string()
}
