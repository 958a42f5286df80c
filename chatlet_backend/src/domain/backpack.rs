//! Backpack items: `[背包|name|type|description|quantity]`.
//!
//! Quantities for the same (name, type) add up across the whole log. The
//! latest non-empty description wins; a token that leaves it blank keeps
//! the earlier text, the same rule the shop applies to listings.
//! Consumed stock is not subtracted here; a write-back rewrites the old
//! tokens to `[已使用|...]`, which this domain does not read.

use serde::{Deserialize, Serialize};

use super::{entity_id, icon_for_type, Domain, KeyedMerge, MergePolicy, Reconcile, Snapshot};
use crate::grammar::{Token, TokenKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
    pub item_type: String,
    pub description: String,
    pub quantity: u32,
    pub icon: String,
}

impl Item {
    pub fn from_token(token: &Token) -> Self {
        let name = token.field(0).to_string();
        let item_type = token.field(1).to_string();
        Self {
            id: entity_id("backpack", &[&name, &item_type]),
            icon: icon_for_type(&item_type).to_string(),
            description: token.field(2).to_string(),
            quantity: token.count(3),
            name,
            item_type,
        }
    }
}

impl Reconcile for Item {
    type Key = (String, String);

    fn key(&self) -> Self::Key {
        (self.name.clone(), self.item_type.clone())
    }

    fn absorb(&mut self, incoming: Self, policy: MergePolicy) {
        match policy {
            MergePolicy::Additive => {
                self.quantity = self.quantity.saturating_add(incoming.quantity);
                if !incoming.description.is_empty() {
                    self.description = incoming.description;
                }
            }
            MergePolicy::LastWriteWins | MergePolicy::StateMachine => *self = incoming,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Backpack;

impl Domain for Backpack {
    type Entity = Item;

    fn name(&self) -> &'static str {
        "backpack"
    }

    fn kinds(&self) -> &'static [TokenKind] {
        &[TokenKind::Item]
    }

    fn reconcile(&self, _text: &str, tokens: &[Token]) -> Snapshot<Item> {
        let mut merge = KeyedMerge::new(MergePolicy::Additive);
        for token in tokens.iter().filter(|t| t.kind == TokenKind::Item) {
            if token.field(0).is_empty() {
                continue;
            }
            merge.insert(Item::from_token(token));
        }
        merge.into_vec()
    }
}
