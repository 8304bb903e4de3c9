//! Counter key composition.

use super::quota::{LimitClass, Tier};

/// Identifier used when a request's identity could not be resolved.
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

/// Normalize an identifier the way counter keys store it.
///
/// Surrounding whitespace is dropped and an empty identifier becomes
/// [`UNKNOWN_IDENTIFIER`].
pub fn normalize_identifier(identifier: &str) -> &str {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        UNKNOWN_IDENTIFIER
    } else {
        identifier
    }
}

/// A key that uniquely identifies one fixed-window counter.
///
/// The key is composed of the limit class, the tier, and the identifier
/// (a normalized IP or an opaque user id). An empty identifier is replaced
/// with [`UNKNOWN_IDENTIFIER`] so that it addresses a real shared bucket
/// rather than acting as a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// The traffic class
    pub class: LimitClass,
    /// The tier whose quota applies
    pub tier: Tier,
    /// IP address or user id
    pub identifier: String,
}

impl WindowKey {
    /// Compose a key from its parts.
    pub fn new(class: LimitClass, tier: Tier, identifier: &str) -> Self {
        Self {
            class,
            tier,
            identifier: normalize_identifier(identifier).to_string(),
        }
    }

    /// Render the key with a storage prefix, e.g. for the distributed store.
    pub fn to_prefixed(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self)
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.class, self.tier, self.identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_key_to_string() {
        let key = WindowKey::new(LimitClass::Submission, Tier::Free, "1.2.3.4");
        assert_eq!(key.to_string(), "submission:free:1.2.3.4");

        let key = WindowKey::new(LimitClass::FormCreation, Tier::Pro, "u1");
        assert_eq!(key.to_prefixed("fg:"), "fg:form_creation:pro:u1");
    }

    #[test]
    fn test_empty_identifier_maps_to_sentinel() {
        let key = WindowKey::new(LimitClass::Api, Tier::Free, "");
        assert_eq!(key.identifier, UNKNOWN_IDENTIFIER);

        let key = WindowKey::new(LimitClass::Api, Tier::Free, "   ");
        assert_eq!(key, WindowKey::new(LimitClass::Api, Tier::Free, UNKNOWN_IDENTIFIER));
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier(" u1 "), "u1");
        assert_eq!(normalize_identifier(""), UNKNOWN_IDENTIFIER);
        assert_eq!(normalize_identifier("\t"), UNKNOWN_IDENTIFIER);
        assert_eq!(normalize_identifier("1.2.3.4"), "1.2.3.4");
    }

    #[test]
    fn test_window_key_equality() {
        let key1 = WindowKey::new(LimitClass::Api, Tier::Starter, "u1");
        let key2 = WindowKey::new(LimitClass::Api, Tier::Starter, "u1");
        let key3 = WindowKey::new(LimitClass::Api, Tier::Pro, "u1");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }
}
