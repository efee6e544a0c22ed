//! Topic pattern matching: MQTT wildcard patterns, compiled into a trie and
//! resolved against concrete topics to a bound schema id.

mod matcher;
mod pattern;

pub use matcher::{ClientRule, MatchOutcome, SchemaBinding, TopicMatcher};
pub use pattern::{Level, TopicMatchError, TopicPattern};
