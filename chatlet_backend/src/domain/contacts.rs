//! Friend list: `[好友id|name|number]` and `[群聊|name|id|members]`.

use serde::{Deserialize, Serialize};

use super::{Domain, KeyedMerge, MergePolicy, Reconcile, Snapshot};
use crate::grammar::{Token, TokenKind};

const LAST_MESSAGE_MAX_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContactKind {
    Friend,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub kind: ContactKind,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub last_message: Option<String>,
}

impl Contact {
    fn from_token(token: &Token) -> Option<Self> {
        let contact = match token.kind {
            TokenKind::Friend => Contact {
                kind: ContactKind::Friend,
                name: token.field(0).to_string(),
                id: token.field(1).to_string(),
                members: Vec::new(),
                last_message: None,
            },
            TokenKind::Group => Contact {
                kind: ContactKind::Group,
                name: token.field(0).to_string(),
                id: token.field(1).to_string(),
                members: split_members(token.field(2)),
                last_message: None,
            },
            _ => return None,
        };
        (!contact.id.is_empty()).then_some(contact)
    }
}

impl Reconcile for Contact {
    type Key = (ContactKind, String);

    fn key(&self) -> Self::Key {
        (self.kind, self.id.clone())
    }

    fn absorb(&mut self, incoming: Self, _policy: MergePolicy) {
        if !incoming.name.is_empty() {
            self.name = incoming.name;
        }
        if !incoming.members.is_empty() {
            self.members = incoming.members;
        }
    }
}

fn split_members(raw: &str) -> Vec<String> {
    raw.split([',', '，', '、', '/', ' '])
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

/// Drop contact definition tokens so a line that only declares a contact
/// is not mistaken for a message from it.
fn without_contact_tokens(line: &str) -> String {
    let mut out = String::new();
    let mut rest = line;
    loop {
        let next = [TokenKind::Friend, TokenKind::Group]
            .iter()
            .filter_map(|kind| rest.find(&format!("[{}|", kind.label())))
            .min();
        let Some(start) = next else {
            break;
        };
        out.push_str(&rest[..start]);
        match rest[start..].find(']') {
            Some(end) => rest = &rest[start + end + 1..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (i, ch) in input.chars().enumerate() {
        if i >= max_chars {
            out.push_str("...");
            break;
        }
        out.push(ch);
    }
    out
}

/// Most recent line mentioning `name`, scanning backward from the end.
fn last_message_for(text: &str, name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    text.lines().rev().find_map(|line| {
        let visible = without_contact_tokens(line);
        let visible = visible.trim();
        visible
            .contains(name)
            .then(|| truncate_chars(visible, LAST_MESSAGE_MAX_CHARS))
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Contacts;

impl Domain for Contacts {
    type Entity = Contact;

    fn name(&self) -> &'static str {
        "contacts"
    }

    fn kinds(&self) -> &'static [TokenKind] {
        &[TokenKind::Friend, TokenKind::Group]
    }

    fn reconcile(&self, text: &str, tokens: &[Token]) -> Snapshot<Contact> {
        let mut merge = KeyedMerge::new(MergePolicy::LastWriteWins);
        for contact in tokens.iter().filter_map(Contact::from_token) {
            merge.insert(contact);
        }

        let mut contacts = merge.into_vec();
        for contact in &mut contacts {
            contact.last_message = last_message_for(text, &contact.name);
        }
        contacts
    }
}
