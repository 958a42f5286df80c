//! Reconciliation of tokens into keyed entities.
//!
//! Each widget domain describes which token kinds it reads and how tokens
//! sharing a natural key merge. [`ReconcilingExtractor`] drives the scan:
//! it replays the whole log from scratch every time, so running it twice
//! over the same text always produces the same snapshot.

pub mod backpack;
pub mod contacts;
pub mod forum;
pub mod shop;
pub mod tasks;

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use uuid::Uuid;

use crate::chat_log::{concatenate, ChatMessage};
use crate::grammar::{Token, TokenGrammar, TokenKind};

/// Full entity collection of one widget, in first-seen order.
pub type Snapshot<E> = Vec<E>;

/// How a repeated key folds into the entity already collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Numeric quantities add up.
    Additive,
    /// Descriptive fields take the latest value.
    LastWriteWins,
    /// Lifecycle state only moves forward.
    StateMachine,
}

pub trait Reconcile: Sized {
    type Key: Eq + Hash + Clone;

    fn key(&self) -> Self::Key;

    fn absorb(&mut self, incoming: Self, policy: MergePolicy);
}

/// Insertion-ordered map used while replaying tokens.
pub struct KeyedMerge<E: Reconcile> {
    policy: MergePolicy,
    entities: Vec<E>,
    index: HashMap<E::Key, usize>,
}

impl<E: Reconcile> KeyedMerge<E> {
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            policy,
            entities: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn insert(&mut self, entity: E) {
        let key = entity.key();
        match self.index.get(&key) {
            Some(&at) => self.entities[at].absorb(entity, self.policy),
            None => {
                self.index.insert(key, self.entities.len());
                self.entities.push(entity);
            }
        }
    }

    pub fn get_mut(&mut self, key: &E::Key) -> Option<&mut E> {
        let at = *self.index.get(key)?;
        self.entities.get_mut(at)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn into_vec(self) -> Vec<E> {
        self.entities
    }
}

/// A widget's token vocabulary and merge rules.
pub trait Domain: Send + Sync + 'static {
    type Entity: Clone + PartialEq + Debug + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn kinds(&self) -> &'static [TokenKind];

    /// Build entities from tokens already in document order. `text` is the
    /// visible (thinking-stripped) log they were taken from.
    fn reconcile(&self, text: &str, tokens: &[Token]) -> Snapshot<Self::Entity>;
}

pub struct ReconcilingExtractor<D: Domain> {
    grammar: Arc<TokenGrammar>,
    domain: D,
}

impl<D: Domain> ReconcilingExtractor<D> {
    pub fn new(grammar: Arc<TokenGrammar>, domain: D) -> Self {
        Self { grammar, domain }
    }

    pub fn domain(&self) -> &D {
        &self.domain
    }

    pub fn extract(&self, all_text: &str) -> Snapshot<D::Entity> {
        let visible = self.grammar.strip_thinking(all_text);
        let kinds = self.domain.kinds();
        let tokens: Vec<_> = self
            .grammar
            .scan_raw(&visible)
            .into_iter()
            .filter(|token| kinds.contains(&token.kind))
            .collect();
        self.domain.reconcile(&visible, &tokens)
    }

    pub fn extract_messages(&self, messages: &[ChatMessage]) -> Snapshot<D::Entity> {
        self.extract(&concatenate(messages, &self.grammar))
    }
}

/// Stable opaque id derived from a domain name and natural key.
pub fn entity_id(domain: &str, key_parts: &[&str]) -> String {
    let name = format!("{}:{}", domain, key_parts.join("\u{1f}"));
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Icon shown next to items and products; unknown types get a box.
pub fn icon_for_type(item_type: &str) -> &'static str {
    match item_type.trim() {
        "食品" | "食物" => "🍖",
        "药品" | "药剂" => "💊",
        "武器" => "⚔️",
        "防具" | "装备" => "🛡️",
        "材料" => "🪵",
        "书籍" => "📖",
        "饰品" => "💍",
        "消耗品" => "🧪",
        "礼物" => "🎁",
        _ => "📦",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        name: String,
        value: u32,
    }

    impl Reconcile for Counter {
        type Key = String;

        fn key(&self) -> String {
            self.name.clone()
        }

        fn absorb(&mut self, incoming: Self, policy: MergePolicy) {
            match policy {
                MergePolicy::Additive => self.value += incoming.value,
                _ => self.value = incoming.value,
            }
        }
    }

    fn counter(name: &str, value: u32) -> Counter {
        Counter {
            name: name.to_string(),
            value,
        }
    }

    #[test]
    fn keyed_merge_keeps_first_seen_order() {
        let mut merge = KeyedMerge::new(MergePolicy::Additive);
        merge.insert(counter("b", 1));
        merge.insert(counter("a", 2));
        merge.insert(counter("b", 3));

        assert_eq!(merge.len(), 2);
        assert_eq!(merge.into_vec(), vec![counter("b", 4), counter("a", 2)]);
    }

    #[test]
    fn last_write_wins_replaces_value() {
        let mut merge = KeyedMerge::new(MergePolicy::LastWriteWins);
        merge.insert(counter("a", 1));
        merge.insert(counter("a", 7));
        assert_eq!(merge.get_mut(&"a".to_string()).map(|c| c.value), Some(7));
    }

    #[test]
    fn entity_ids_are_stable_per_key() {
        assert_eq!(
            entity_id("backpack", &["药水", "药品"]),
            entity_id("backpack", &["药水", "药品"])
        );
        assert_ne!(
            entity_id("backpack", &["药水", "药品"]),
            entity_id("shop", &["药水", "药品"])
        );
    }

    #[test]
    fn extract_ignores_tokens_inside_thinking() {
        let ex = ReconcilingExtractor::new(
            Arc::new(TokenGrammar::standard().unwrap()),
            backpack::Backpack,
        );
        let items = ex.extract("<thinking>[背包|金币|货币|草稿|99]</thinking>[背包|药水|药品|恢复50HP|2]");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "药水");
    }

    #[test]
    fn unknown_types_get_default_icon() {
        assert_eq!(icon_for_type("药品"), "💊");
        assert_eq!(icon_for_type("古董"), "📦");
    }
}
