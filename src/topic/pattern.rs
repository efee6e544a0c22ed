//! MQTT wildcard topic patterns, precompiled into matcher levels.

use thiserror::Error;

/// Errors raised while compiling a topic pattern.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicMatchError {
    /// The pattern string was empty.
    #[error("topic pattern must not be empty")]
    EmptyPattern,

    /// A level in the pattern was empty (e.g. a trailing or doubled `/`).
    #[error("topic pattern {pattern:?} has an empty level")]
    EmptyLevel {
        /// The offending pattern.
        pattern: String,
    },

    /// `#` appeared somewhere other than the last level.
    #[error("topic pattern {pattern:?} has '#' before the last level")]
    HashNotLast {
        /// The offending pattern.
        pattern: String,
    },

    /// A level mixed a wildcard character with literal characters.
    #[error("topic pattern {pattern:?} mixes a wildcard with literal characters in one level")]
    WildcardMixedWithLiteral {
        /// The offending pattern.
        pattern: String,
    },
}

/// A single level within a compiled topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Level {
    /// A literal, exact-match level.
    Literal(String),
    /// `+`, matching exactly one non-empty level.
    Plus,
    /// `#`, matching zero or more trailing levels. Always the last level.
    Hash,
}

/// A precompiled MQTT-style topic pattern.
///
/// Invariant: `#` appears only as the last level; `+` matches exactly one
/// non-empty level; levels are delimited by `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    levels: Vec<Level>,
}

impl TopicPattern {
    /// Compiles and validates a raw pattern string.
    ///
    /// # Errors
    ///
    /// Returns [`TopicMatchError`] if the pattern violates the MQTT wildcard
    /// grammar: an empty pattern, an empty level (including a trailing
    /// slash), `#` not in the last position, or a level mixing a wildcard
    /// with literal characters.
    pub fn compile(raw: &str) -> Result<Self, TopicMatchError> {
        if raw.is_empty() {
            return Err(TopicMatchError::EmptyPattern);
        }

        let parts: Vec<&str> = raw.split('/').collect();
        let mut levels = Vec::with_capacity(parts.len());
        let last_index = parts.len() - 1;

        for (index, part) in parts.iter().enumerate() {
            if part.is_empty() {
                return Err(TopicMatchError::EmptyLevel {
                    pattern: raw.to_string(),
                });
            }
            if *part == "+" {
                levels.push(Level::Plus);
                continue;
            }
            if *part == "#" {
                if index != last_index {
                    return Err(TopicMatchError::HashNotLast {
                        pattern: raw.to_string(),
                    });
                }
                levels.push(Level::Hash);
                continue;
            }
            if part.contains('+') || part.contains('#') {
                return Err(TopicMatchError::WildcardMixedWithLiteral {
                    pattern: raw.to_string(),
                });
            }
            levels.push(Level::Literal((*part).to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            levels,
        })
    }

    /// The original pattern string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The compiled level sequence.
    #[must_use]
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_trailing_slash() {
        assert_eq!(
            TopicPattern::compile("devices/temp/"),
            Err(TopicMatchError::EmptyLevel {
                pattern: "devices/temp/".to_string()
            })
        );
    }

    #[test]
    fn rejects_hash_not_last() {
        assert!(matches!(
            TopicPattern::compile("devices/#/telemetry"),
            Err(TopicMatchError::HashNotLast { .. })
        ));
    }

    #[test]
    fn rejects_wildcard_mixed_with_literal() {
        assert!(matches!(
            TopicPattern::compile("devices/a+b/telemetry"),
            Err(TopicMatchError::WildcardMixedWithLiteral { .. })
        ));
    }

    #[test]
    fn accepts_plus_and_hash() {
        let pattern = TopicPattern::compile("devices/+/telemetry").unwrap();
        assert_eq!(
            pattern.levels(),
            &[
                Level::Literal("devices".to_string()),
                Level::Plus,
                Level::Literal("telemetry".to_string()),
            ]
        );

        let pattern = TopicPattern::compile("sensors/#").unwrap();
        assert_eq!(
            pattern.levels(),
            &[Level::Literal("sensors".to_string()), Level::Hash]
        );
    }
}
