//! Forum threads built from three token kinds:
//!
//! - `[标题|author|id|title|body]` opens thread `id`
//! - `[回复|author|id|content]` appends a floor to thread `id`
//! - `[楼中楼|author|id|parentFloor|content]` replies to one floor
//!
//! Replies are bucketed by thread id in document order. A reply to a
//! thread whose title has not appeared yet lands in a stub thread that the
//! title token fills in later.

use serde::{Deserialize, Serialize};

use super::{Domain, KeyedMerge, MergePolicy, Reconcile, Snapshot};
use crate::grammar::{Token, TokenKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubReply {
    pub author: String,
    pub parent_ref: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// 1-based position inside the thread.
    pub floor: usize,
    pub author: String,
    pub content: String,
    #[serde(default)]
    pub sub_replies: Vec<SubReply>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub author: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub replies: Vec<Reply>,
}

impl Thread {
    fn stub(id: &str) -> Self {
        Self {
            id: id.to_string(),
            author: String::new(),
            title: String::new(),
            body: String::new(),
            replies: Vec::new(),
        }
    }

    /// True while no title token for this id has been seen.
    pub fn is_stub(&self) -> bool {
        self.title.is_empty() && self.author.is_empty()
    }

    pub fn reply_at(&self, floor: usize) -> Option<&Reply> {
        floor.checked_sub(1).and_then(|i| self.replies.get(i))
    }

    fn push_reply(&mut self, author: &str, content: &str) {
        if self
            .replies
            .iter()
            .any(|r| r.author == author && r.content == content)
        {
            return;
        }
        self.replies.push(Reply {
            floor: self.replies.len() + 1,
            author: author.to_string(),
            content: content.to_string(),
            sub_replies: Vec::new(),
        });
    }

    fn attach_sub_reply(&mut self, author: &str, parent_ref: &str, content: &str) {
        let target = parse_floor(parent_ref)
            .filter(|floor| *floor >= 1 && *floor <= self.replies.len())
            .map(|floor| floor - 1)
            // Compatibility shim: older generations name the parent's author.
            .or_else(|| self.replies.iter().rposition(|r| r.author == parent_ref));

        let Some(index) = target else {
            tracing::debug!(
                "Sub-reply in thread {} has no parent '{}', keeping it as a reply",
                self.id,
                parent_ref
            );
            self.push_reply(author, content);
            return;
        };

        let reply = &mut self.replies[index];
        if reply
            .sub_replies
            .iter()
            .any(|s| s.author == author && s.content == content)
        {
            return;
        }
        reply.sub_replies.push(SubReply {
            author: author.to_string(),
            parent_ref: parent_ref.to_string(),
            content: content.to_string(),
        });
    }
}

impl Reconcile for Thread {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn absorb(&mut self, incoming: Self, _policy: MergePolicy) {
        for (slot, value) in [
            (&mut self.author, incoming.author),
            (&mut self.title, incoming.title),
            (&mut self.body, incoming.body),
        ] {
            if !value.is_empty() {
                *slot = value;
            }
        }
    }
}

/// Explicit floor reference: `3`, `#3`, `第3楼`, `3楼`, `3L`, `3F`.
pub fn parse_floor(raw: &str) -> Option<usize> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('#').unwrap_or(trimmed);
    let trimmed = trimmed.strip_prefix('第').unwrap_or(trimmed);
    let trimmed = trimmed
        .strip_suffix('楼')
        .or_else(|| trimmed.strip_suffix(['L', 'l', 'F', 'f']))
        .unwrap_or(trimmed);
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok()
}

/// Next free numeric thread id.
pub fn next_thread_id(threads: &[Thread]) -> String {
    let max = threads
        .iter()
        .filter_map(|t| t.id.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    (max + 1).to_string()
}

fn thread_entry<'a>(threads: &'a mut KeyedMerge<Thread>, id: &str) -> Option<&'a mut Thread> {
    let key = id.to_string();
    if threads.get_mut(&key).is_none() {
        threads.insert(Thread::stub(id));
    }
    threads.get_mut(&key)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Forum;

impl Domain for Forum {
    type Entity = Thread;

    fn name(&self) -> &'static str {
        "forum"
    }

    fn kinds(&self) -> &'static [TokenKind] {
        &[TokenKind::Thread, TokenKind::Reply, TokenKind::SubReply]
    }

    fn reconcile(&self, _text: &str, tokens: &[Token]) -> Snapshot<Thread> {
        let mut threads = KeyedMerge::new(MergePolicy::LastWriteWins);

        for token in tokens {
            let thread_id = token.field(1);
            if thread_id.is_empty() {
                continue;
            }
            match token.kind {
                TokenKind::Thread => threads.insert(Thread {
                    id: thread_id.to_string(),
                    author: token.field(0).to_string(),
                    title: token.field(2).to_string(),
                    body: token.field(3).to_string(),
                    replies: Vec::new(),
                }),
                TokenKind::Reply => {
                    if let Some(thread) = thread_entry(&mut threads, thread_id) {
                        thread.push_reply(token.field(0), token.field(2));
                    }
                }
                TokenKind::SubReply => {
                    if let Some(thread) = thread_entry(&mut threads, thread_id) {
                        thread.attach_sub_reply(token.field(0), token.field(2), token.field(3));
                    }
                }
                _ => {}
            }
        }

        threads.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReconcilingExtractor;
    use crate::grammar::TokenGrammar;
    use std::sync::Arc;

    fn extract(text: &str) -> Vec<Thread> {
        ReconcilingExtractor::new(Arc::new(TokenGrammar::standard().unwrap()), Forum).extract(text)
    }

    #[test]
    fn replies_are_bucketed_by_thread() {
        let text = "[标题|楼主|1|今天吃什么|求推荐]\n[标题|阿强|2|周末去哪|无聊]\n\
                    [回复|小明|1|火锅][回复|小红|2|爬山][回复|小刚|1|烧烤]";
        let threads = extract(text);

        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].replies.len(), 2);
        assert_eq!(threads[0].replies[1].floor, 2);
        assert_eq!(threads[0].replies[1].content, "烧烤");
        assert_eq!(threads[1].replies[0].author, "小红");
    }

    #[test]
    fn sub_replies_attach_by_floor_then_author() {
        let text = "[标题|楼主|1|t|b][回复|小明|1|火锅][回复|小红|1|烧烤]\
                    [楼中楼|阿强|1|2楼|烧烤好][楼中楼|阿珍|1|小明|火锅也行]";
        let threads = extract(text);
        let replies = &threads[0].replies;

        assert_eq!(replies[1].sub_replies.len(), 1);
        assert_eq!(replies[1].sub_replies[0].author, "阿强");
        assert_eq!(replies[0].sub_replies[0].content, "火锅也行");
    }

    #[test]
    fn orphan_sub_reply_becomes_reply() {
        let threads = extract("[标题|楼主|1|t|b][回复|小明|1|火锅][楼中楼|阿强|1|9楼|在吗]");
        let replies = &threads[0].replies;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[1].author, "阿强");
        assert_eq!(replies[1].floor, 2);
    }

    #[test]
    fn early_replies_create_a_stub_that_title_fills() {
        let threads = extract("[回复|小明|5|沙发][标题|楼主|5|新帖|正文]");
        assert_eq!(threads.len(), 1);
        assert!(!threads[0].is_stub());
        assert_eq!(threads[0].title, "新帖");
        assert_eq!(threads[0].replies.len(), 1);
    }

    #[test]
    fn repeated_replies_collapse() {
        let threads = extract("[标题|楼主|1|t|b][回复|小明|1|火锅]\n[标题|楼主|1|t|b][回复|小明|1|火锅]");
        assert_eq!(threads[0].replies.len(), 1);
    }

    #[test]
    fn floor_references() {
        assert_eq!(parse_floor("3"), Some(3));
        assert_eq!(parse_floor("#4"), Some(4));
        assert_eq!(parse_floor("第2楼"), Some(2));
        assert_eq!(parse_floor("7L"), Some(7));
        assert_eq!(parse_floor("小明"), None);
        assert_eq!(parse_floor("楼"), None);
    }

    #[test]
    fn next_id_follows_numeric_max() {
        let threads = extract("[标题|a|3|t|b][标题|b|abc|t|b][标题|c|12|t|b]");
        assert_eq!(next_thread_id(&threads), "13");
        assert_eq!(next_thread_id(&[]), "1");
    }
}
