//! Global identifiers.
//!
//! The coordinator uses `Typename:id` (colon-delimited, not base64). Only the
//! first colon separates the typename; the id part may contain more colons,
//! e.g. `Session:projectDir:sessionId`.

use crate::types::EntityKind;

/// Parsed global ID with typename and raw id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalId {
    pub typename: String,
    pub id: String,
}

impl GlobalId {
    /// Entity kind for the typename, if it is one the store knows about.
    pub fn kind(&self) -> Option<EntityKind> {
        self.typename.parse().ok()
    }
}

/// Encode a global ID in `Typename:id` format.
pub fn encode_global_id(typename: &str, id: &str) -> String {
    format!("{typename}:{id}")
}

/// Decode a global ID. Returns None if either part is empty or the colon is missing.
pub fn decode_global_id(global_id: &str) -> Option<GlobalId> {
    let (typename, id) = global_id.split_once(':')?;
    if typename.is_empty() || id.is_empty() {
        return None;
    }
    Some(GlobalId {
        typename: typename.to_string(),
        id: id.to_string(),
    })
}

/// Extract the bare session id from a `sessionId` argument or a global
/// `Session:...` id (the session id is the last colon segment).
pub fn bare_session_id(value: &str) -> &str {
    match value.strip_prefix("Session:") {
        Some(rest) => rest.rsplit(':').next().unwrap_or(rest),
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_global_id() {
        assert_eq!(encode_global_id("Session", "abc123"), "Session:abc123");
    }

    #[test]
    fn test_decode_global_id_with_colons_in_id() {
        let parsed = decode_global_id("Session:projectDir:sessionId").unwrap();
        assert_eq!(parsed.typename, "Session");
        assert_eq!(parsed.id, "projectDir:sessionId");
        assert_eq!(parsed.kind(), Some(EntityKind::Session));
    }

    #[test]
    fn test_decode_global_id_invalid() {
        assert!(decode_global_id("no-colon").is_none());
        assert!(decode_global_id(":no-typename").is_none());
        assert!(decode_global_id("no-id:").is_none());
    }

    #[test]
    fn test_bare_session_id() {
        assert_eq!(bare_session_id("S1"), "S1");
        assert_eq!(bare_session_id("Session:/work/proj:S1"), "S1");
    }
}
