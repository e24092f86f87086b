//! Shell-style glob matching for dot-segmented topics.

use crate::BusError;

/// Validated subscription pattern: a shell-style glob over topic strings.
///
/// Only `*` (any run of characters, dots included) and `?` (any single
/// character) are special; no character classes, no regex. Both transports
/// share these semantics, so `story.*` matches `story.created` and
/// `story.updated` but never `saga.started` under either one.
///
/// Matching is byte-wise; topics are lowercase ASCII tokens by convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern(String);

impl TopicPattern {
    /// Create a pattern, rejecting the empty string.
    pub fn new(pattern: impl Into<String>) -> Result<Self, BusError> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(BusError::invalid_config(
                "subscription pattern cannot be empty",
            ));
        }
        Ok(Self(pattern))
    }

    /// The raw pattern string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Test whether `topic` matches this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        glob_match(self.0.as_bytes(), topic.as_bytes())
    }
}

/// Iterative glob match with single-star backtracking.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let mut pi = 0;
    let mut ti = 0;
    // Position to resume from when a literal run after `*` fails.
    let mut star: Option<(usize, usize)> = None;

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == b'?' || pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == b'*' {
            star = Some((pi + 1, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }

    while pi < pattern.len() && pattern[pi] == b'*' {
        pi += 1;
    }
    pi == pattern.len()
}
