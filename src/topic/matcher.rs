//! A trie-backed matcher resolving concrete topics to bound schema ids.

use std::collections::HashMap;

use crate::domain_types::{ClientId, SchemaId};

use super::pattern::{Level, TopicMatchError, TopicPattern};

/// A `(pattern, schema_id)` binding. The binding set is an ordered list; on
/// lookup, the first binding whose pattern matches wins. `schema_id` is
/// `None` for a topic-only binding: the topic is allowed onto the bus but no
/// schema is enforced against it.
#[derive(Debug, Clone)]
pub struct SchemaBinding {
    pattern: TopicPattern,
    schema_id: Option<SchemaId>,
}

impl SchemaBinding {
    /// Builds a binding from an already-compiled pattern and an optional
    /// schema id. Pass `None` for a topic that is allow-listed but has no
    /// schema bound to it.
    #[must_use]
    pub fn new(pattern: TopicPattern, schema_id: Option<SchemaId>) -> Self {
        Self { pattern, schema_id }
    }

    /// The pattern this binding matches against.
    #[must_use]
    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    /// The schema id this binding resolves to, or `None` if the topic is
    /// allow-listed with no schema bound.
    #[must_use]
    pub fn schema_id(&self) -> Option<&SchemaId> {
        self.schema_id.as_ref()
    }
}

#[derive(Debug, Default)]
struct TrieNode {
    literal: HashMap<String, TrieNode>,
    plus: Option<Box<TrieNode>>,
    /// Index of the pattern that terminates exactly at this node.
    exact: Option<usize>,
    /// Index of the pattern whose last level is `#`, rooted at this node.
    hash: Option<usize>,
}

impl TrieNode {
    fn insert(&mut self, levels: &[Level], index: usize) {
        match levels.split_first() {
            None => self.exact = Some(index),
            Some((Level::Hash, _)) => self.hash = Some(index),
            Some((Level::Plus, rest)) => {
                self.plus
                    .get_or_insert_with(|| Box::new(TrieNode::default()))
                    .insert(rest, index);
            }
            Some((Level::Literal(lit), rest)) => {
                self.literal
                    .entry(lit.clone())
                    .or_default()
                    .insert(rest, index);
            }
        }
    }

    /// Collects the indices of every pattern that matches `levels` from this
    /// node down, without short-circuiting — overlapping patterns are
    /// resolved by insertion order at the call site, not by trie structure.
    fn collect_matches(&self, levels: &[&str], acc: &mut Vec<usize>) {
        if let Some(idx) = self.hash {
            acc.push(idx);
        }
        match levels.split_first() {
            None => {
                if let Some(idx) = self.exact {
                    acc.push(idx);
                }
            }
            Some((head, rest)) => {
                if let Some(child) = self.literal.get(*head) {
                    child.collect_matches(rest, acc);
                }
                if let Some(child) = &self.plus {
                    if !head.is_empty() {
                        child.collect_matches(rest, acc);
                    }
                }
            }
        }
    }
}

/// Per-client allow-list: the concrete topic must additionally match at
/// least one of these patterns, else the rejection reason is
/// `TopicNotAllowed` even if the global patterns accept it.
#[derive(Debug, Clone, Default)]
pub struct ClientRule {
    allowed_topics: Vec<TopicPattern>,
}

impl ClientRule {
    /// Builds a client rule from a list of already-compiled patterns.
    #[must_use]
    pub fn new(allowed_topics: Vec<TopicPattern>) -> Self {
        Self { allowed_topics }
    }

    fn matches(&self, topic_levels: &[&str]) -> bool {
        self.allowed_topics
            .iter()
            .any(|pattern| pattern_matches(pattern, topic_levels))
    }
}

fn pattern_matches(pattern: &TopicPattern, topic_levels: &[&str]) -> bool {
    fn go(levels: &[Level], topic: &[&str]) -> bool {
        match (levels.split_first(), topic.split_first()) {
            (None, None) => true,
            (Some((Level::Hash, _)), _) => true,
            (Some((Level::Plus, rest)), Some((head, topic_rest))) => {
                !head.is_empty() && go(rest, topic_rest)
            }
            (Some((Level::Literal(lit), rest)), Some((head, topic_rest))) => {
                lit == head && go(rest, topic_rest)
            }
            _ => false,
        }
    }
    go(pattern.levels(), topic_levels)
}

/// Matches concrete topics against the configured pattern set, resolving
/// the winning pattern's schema id. Pure function over a prebuilt index,
/// built once at configuration load and shared read-only across workers.
#[derive(Debug, Default)]
pub struct TopicMatcher {
    bindings: Vec<SchemaBinding>,
    trie: TrieNode,
    client_rules: HashMap<ClientId, ClientRule>,
}

impl TopicMatcher {
    /// Builds a matcher from an ordered list of bindings plus optional
    /// per-client allow-lists.
    ///
    /// # Errors
    ///
    /// Never fails itself — pattern compilation errors are caught earlier by
    /// [`TopicPattern::compile`]; this constructor only indexes already
    /// validated patterns.
    #[must_use]
    pub fn build(
        bindings: Vec<SchemaBinding>,
        client_rules: HashMap<ClientId, ClientRule>,
    ) -> Self {
        let mut trie = TrieNode::default();
        for (index, binding) in bindings.iter().enumerate() {
            trie.insert(binding.pattern().levels(), index);
        }
        Self {
            bindings,
            trie,
            client_rules,
        }
    }

    /// Matches a concrete topic, returning the winning binding's schema id
    /// (or `None` for a topic-only binding) if any global pattern matches
    /// and, when a client rule is configured for `client_id`, the topic also
    /// matches that client's allow-list.
    #[must_use]
    pub fn matches(&self, topic: &str, client_id: &ClientId) -> MatchOutcome {
        let levels: Vec<&str> = topic.split('/').collect();

        let mut candidates = Vec::new();
        self.trie.collect_matches(&levels, &mut candidates);

        let Some(&winner) = candidates.iter().min() else {
            return MatchOutcome::NoMatch;
        };

        if let Some(rule) = self.client_rules.get(client_id) {
            if !rule.matches(&levels) {
                return MatchOutcome::ClientRuleRejected;
            }
        }

        MatchOutcome::Matched(self.bindings[winner].schema_id().cloned())
    }
}

/// The result of matching a concrete topic against the configured index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// No configured pattern matched the topic.
    NoMatch,
    /// A global pattern matched but the client's allow-list rejected it.
    ClientRuleRejected,
    /// A pattern matched. Carries the bound schema id, or `None` if the
    /// matching pattern is a topic-only binding with no schema enforced.
    Matched(Option<SchemaId>),
}
