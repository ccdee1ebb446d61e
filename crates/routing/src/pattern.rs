//! Path patterns.

use std::collections::HashMap;
use std::fmt;

/// Path parameters captured by a pattern.
///
/// Literal and wildcard patterns never capture anything, the map is handed to
/// handlers uninterpreted so richer patterns can be added without changing
/// the handler signature.
pub type PathParams = HashMap<String, String>;

/// A compiled path pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// Matches exactly one path.
    Literal(String),
    /// Matches any path.
    Wildcard,
}

impl Pattern {
    /// Compile a pattern which matches exactly `path`.
    ///
    /// # Panics
    ///
    /// Panics if `path` is empty, does not start with `/`, or contains a
    /// query/fragment delimiter or whitespace. A malformed route is a
    /// deployment defect and must not make it past startup.
    pub fn literal(path: impl Into<String>) -> Self {
        let path = path.into();
        if let Err(reason) = validate_literal(&path) {
            panic!("invalid literal route pattern {path:?}: {reason}");
        }
        Pattern::Literal(path)
    }

    /// Compile a pattern which matches any path.
    pub fn wildcard() -> Self {
        Pattern::Wildcard
    }

    /// Match `path` against this pattern.
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        match self {
            Pattern::Literal(literal) if literal == path => Some(PathParams::new()),
            Pattern::Literal(_) => None,
            Pattern::Wildcard => Some(PathParams::new()),
        }
    }

    /// Whether this is the catch-all pattern.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Pattern::Wildcard)
    }

    /// The literal path, if any.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Pattern::Literal(path) => Some(path),
            Pattern::Wildcard => None,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Literal(path) => f.write_str(path),
            Pattern::Wildcard => f.write_str("*"),
        }
    }
}

fn validate_literal(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("path is empty");
    }
    if !path.starts_with('/') {
        return Err("path must start with '/'");
    }
    if path.contains(['?', '#']) {
        return Err("path must not contain a query or fragment");
    }
    if path.chars().any(char::is_whitespace) {
        return Err("path must not contain whitespace");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_matches_exact_path_only() {
        let pattern = Pattern::literal("/test");

        assert!(pattern.matches("/test").is_some());
        assert!(pattern.matches("/test/").is_none());
        assert!(pattern.matches("/tes").is_none());
        assert!(pattern.matches("/TEST").is_none());
        assert!(pattern.matches("/").is_none());
    }

    #[test]
    fn test_wildcard_matches_everything() {
        let pattern = Pattern::wildcard();

        for path in ["/", "/a", "/a/b/c.txt", "/metrics"] {
            let params = pattern.matches(path).expect("wildcard should match");
            assert!(params.is_empty());
        }
        assert!(pattern.is_wildcard());
        assert_eq!(pattern.as_literal(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Pattern::literal("/docs").to_string(), "/docs");
        assert_eq!(Pattern::wildcard().to_string(), "*");
    }

    #[test]
    #[should_panic(expected = "must start with '/'")]
    fn test_literal_without_leading_slash_panics() {
        let _ = Pattern::literal("test");
    }

    #[test]
    #[should_panic(expected = "path is empty")]
    fn test_empty_literal_panics() {
        let _ = Pattern::literal("");
    }

    #[test]
    #[should_panic(expected = "query or fragment")]
    fn test_literal_with_query_panics() {
        let _ = Pattern::literal("/search?q=1");
    }

    #[test]
    #[should_panic(expected = "whitespace")]
    fn test_literal_with_whitespace_panics() {
        let _ = Pattern::literal("/a b");
    }
}
