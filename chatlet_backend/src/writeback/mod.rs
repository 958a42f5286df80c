//! Turning user actions into text appended to the chat.
//!
//! The formatter is pure: it renders the sentence and tokens for one
//! action and lists the older tokens that the action supersedes. The
//! service rewrites the superseded tokens in the local log first, then
//! sends the text through an [`OutboundChannel`]. A send the host rejects
//! puts the patched messages back, and a patch that fails sends nothing.

pub mod channel;

use std::sync::Arc;

use crate::chat_log::{ChatLogSource, PatchableLog};
use crate::domain::backpack::Item;
use crate::domain::forum::Thread;
use crate::domain::shop::Product;
use crate::domain::tasks::{Task, TaskState};
use crate::error::{SourceError, WriteBackError};
use crate::grammar::{format_token, TokenGrammar, TokenKind};

pub use channel::{HostInputChannel, OutboundChannel, RecordingChannel};

const QUOTE_MAX_CHARS: usize = 30;

/// A user-initiated change, carrying the entity it acts on.
#[derive(Debug, Clone)]
pub enum WriteAction {
    UseItem { item: Item, amount: u32 },
    BuyProduct { product: Product, quantity: u32 },
    AcceptTask { task: Task },
    CompleteTask { task: Task },
    PostThread { thread_id: String, title: String, body: String },
    ReplyThread { thread: Thread, content: String },
    ReplyFloor { thread: Thread, floor: usize, content: String },
}

/// Rewrite every earlier `from` token whose leading fields equal `key`
/// into a `to` token with the same body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supersede {
    pub from: TokenKind,
    pub to: TokenKind,
    pub key: Vec<String>,
}

impl Supersede {
    fn matches(&self, fields: &[String]) -> bool {
        fields.len() >= self.key.len() && fields.iter().zip(&self.key).all(|(a, b)| a == b)
    }

    /// The rewritten message, or `None` when nothing in it matched.
    pub fn rewrite(&self, grammar: &TokenGrammar, text: &str) -> Option<String> {
        let targets: Vec<_> = grammar
            .scan_raw(text)
            .into_iter()
            .filter(|token| token.kind == self.from && self.matches(&token.fields))
            .collect();
        if targets.is_empty() {
            return None;
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for token in targets {
            let raw = &text[token.span.clone()];
            let Some(bar) = raw.find('|') else {
                continue;
            };
            out.push_str(&text[cursor..token.span.start]);
            out.push('[');
            out.push_str(self.to.label());
            out.push_str(&raw[bar..]);
            cursor = token.span.end;
        }
        out.push_str(&text[cursor..]);
        Some(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBack {
    /// Appended to the host input as-is.
    pub text: String,
    pub supersede: Vec<Supersede>,
}

impl WriteBack {
    fn plain(text: String) -> Self {
        Self {
            text,
            supersede: Vec::new(),
        }
    }
}

pub struct WriteBackFormatter {
    user_name: String,
}

impl WriteBackFormatter {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
        }
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn format(&self, action: &WriteAction) -> Result<WriteBack, WriteBackError> {
        let user = &self.user_name;
        match action {
            WriteAction::UseItem { item, amount } => {
                if *amount == 0 || *amount > item.quantity {
                    return Err(WriteBackError::InvalidAction(format!(
                        "cannot use {} of {} (have {})",
                        amount, item.name, item.quantity
                    )));
                }
                let mut text = format!("{}使用了{}个{}。", user, amount, item.name);
                let remaining = item.quantity - amount;
                if remaining > 0 {
                    text.push_str(&format_token(
                        TokenKind::Item,
                        &[
                            item.name.as_str(),
                            item.item_type.as_str(),
                            item.description.as_str(),
                            &remaining.to_string(),
                        ],
                    ));
                }
                Ok(WriteBack {
                    text,
                    supersede: vec![Supersede {
                        from: TokenKind::Item,
                        to: TokenKind::Used,
                        key: vec![item.name.clone(), item.item_type.clone()],
                    }],
                })
            }
            WriteAction::BuyProduct { product, quantity } => {
                if *quantity == 0 {
                    return Err(WriteBackError::InvalidAction(format!(
                        "cannot buy 0 of {}",
                        product.name
                    )));
                }
                let total = product.price * f64::from(*quantity);
                let mut text = format!(
                    "{}购买了{}个{}，花费{}。",
                    user, quantity, product.name, total
                );
                text.push_str(&format_token(
                    TokenKind::Item,
                    &[
                        product.name.as_str(),
                        product.product_type.as_str(),
                        product.description.as_str(),
                        &quantity.to_string(),
                    ],
                ));
                Ok(WriteBack::plain(text))
            }
            WriteAction::AcceptTask { task } => {
                if task.state != TaskState::Available {
                    return Err(WriteBackError::InvalidAction(format!(
                        "task {} is already {:?}",
                        task.id, task.state
                    )));
                }
                let mut text = format!("{}接受了任务「{}」。", user, task.name);
                text.push_str(&format_token(TokenKind::TaskAccept, &task.defining_fields()));
                Ok(WriteBack::plain(text))
            }
            WriteAction::CompleteTask { task } => {
                if task.state != TaskState::Accepted {
                    return Err(WriteBackError::InvalidAction(format!(
                        "task {} is {:?}, not accepted",
                        task.id, task.state
                    )));
                }
                let mut text = format!("{}完成了任务「{}」。", user, task.name);
                text.push_str(&format_token(TokenKind::TaskComplete, &task.defining_fields()));
                Ok(WriteBack::plain(text))
            }
            WriteAction::PostThread {
                thread_id,
                title,
                body,
            } => {
                require_text("title", title)?;
                require_text("body", body)?;
                let mut text = format!("{}在论坛发布了新帖子（编号{}）：", user, thread_id);
                text.push_str(&format_token(
                    TokenKind::Thread,
                    &[user.as_str(), thread_id.as_str(), title.as_str(), body.as_str()],
                ));
                Ok(WriteBack::plain(text))
            }
            WriteAction::ReplyThread { thread, content } => {
                require_text("reply", content)?;
                let mut text = format!(
                    "{}回复了{}的帖子（编号{}）「{}」：",
                    user,
                    thread.author,
                    thread.id,
                    quote(&thread.title)
                );
                text.push_str(&format_token(
                    TokenKind::Reply,
                    &[user.as_str(), thread.id.as_str(), content.as_str()],
                ));
                Ok(WriteBack::plain(text))
            }
            WriteAction::ReplyFloor {
                thread,
                floor,
                content,
            } => {
                require_text("reply", content)?;
                let parent = thread.reply_at(*floor).ok_or_else(|| {
                    WriteBackError::InvalidAction(format!(
                        "thread {} has no floor {}",
                        thread.id, floor
                    ))
                })?;
                let mut text = format!(
                    "{}回复了帖子（编号{}）{}楼{}的评论「{}」：",
                    user,
                    thread.id,
                    floor,
                    parent.author,
                    quote(&parent.content)
                );
                text.push_str(&format_token(
                    TokenKind::SubReply,
                    &[
                        user.as_str(),
                        thread.id.as_str(),
                        &format!("{}楼", floor),
                        content.as_str(),
                    ],
                ));
                Ok(WriteBack::plain(text))
            }
        }
    }
}

fn require_text(what: &str, value: &str) -> Result<(), WriteBackError> {
    if value.trim().is_empty() {
        return Err(WriteBackError::InvalidAction(format!("{} is empty", what)));
    }
    Ok(())
}

fn quote(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(QUOTE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

/// Rewrite superseded tokens in messages `[0, upto)`, recording each
/// changed message as `(new, old)` in `patched`.
pub fn apply_supersede(
    log: &dyn PatchableLog,
    grammar: &TokenGrammar,
    supersede: &Supersede,
    upto: usize,
    patched: &mut Vec<(String, String)>,
) -> Result<usize, SourceError> {
    log.patch_messages(upto, &mut |text| {
        let new = supersede.rewrite(grammar, text)?;
        patched.push((new.clone(), text.to_string()));
        Some(new)
    })
}

/// Formats actions, hands them to the host and patches the local log.
pub struct WriteBackService {
    formatter: WriteBackFormatter,
    grammar: Arc<TokenGrammar>,
    source: Arc<dyn ChatLogSource>,
    log: Arc<dyn PatchableLog>,
    channel: Arc<dyn OutboundChannel>,
}

impl WriteBackService {
    pub fn new(
        formatter: WriteBackFormatter,
        grammar: Arc<TokenGrammar>,
        source: Arc<dyn ChatLogSource>,
        log: Arc<dyn PatchableLog>,
        channel: Arc<dyn OutboundChannel>,
    ) -> Self {
        Self {
            formatter,
            grammar,
            source,
            log,
            channel,
        }
    }

    pub fn formatter(&self) -> &WriteBackFormatter {
        &self.formatter
    }

    pub async fn perform(&self, action: &WriteAction) -> Result<WriteBack, WriteBackError> {
        let write_back = self.formatter.format(action)?;

        let mut patched = Vec::new();
        let mut upto = 0;
        if !write_back.supersede.is_empty() {
            upto = self.source.read_count()?;
            if let Err(e) = self.supersede_all(&write_back.supersede, upto, &mut patched) {
                tracing::warn!("Write-back aborted before sending: {}", e);
                self.roll_back(upto, &patched);
                return Err(e.into());
            }
        }

        if let Err(e) = self.channel.submit(&write_back.text).await {
            tracing::warn!("Write-back rejected: {}", e);
            self.roll_back(upto, &patched);
            return Err(e);
        }

        tracing::info!("Wrote back: {}", write_back.text);
        Ok(write_back)
    }

    fn supersede_all(
        &self,
        supersedes: &[Supersede],
        upto: usize,
        patched: &mut Vec<(String, String)>,
    ) -> Result<(), SourceError> {
        for supersede in supersedes {
            let n = apply_supersede(self.log.as_ref(), &self.grammar, supersede, upto, patched)?;
            if n > 0 {
                tracing::debug!(
                    "Marked {:?} tokens for {:?} as {} in {} message(s)",
                    supersede.from,
                    supersede.key,
                    supersede.to.label(),
                    n
                );
            }
        }
        Ok(())
    }

    fn roll_back(&self, upto: usize, patched: &[(String, String)]) {
        if patched.is_empty() {
            return;
        }
        let restore = self.log.patch_messages(upto, &mut |text| {
            let mut current = text.to_string();
            let mut restored = false;
            for (new, old) in patched.iter().rev() {
                if *new == current {
                    current = old.clone();
                    restored = true;
                }
            }
            restored.then_some(current)
        });
        if let Err(e) = restore {
            tracing::error!("Could not restore {} patched message(s): {}", patched.len(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_log::{ChatMessage, InMemoryChatLog};
    use crate::domain::backpack::Backpack;
    use crate::domain::forum::Forum;
    use crate::domain::tasks::TaskBoard;
    use crate::domain::ReconcilingExtractor;
    use crate::host::InMemoryHost;
    use std::time::Duration;

    fn grammar() -> Arc<TokenGrammar> {
        Arc::new(TokenGrammar::standard().unwrap())
    }

    fn potion(quantity: u32) -> Item {
        let grammar = grammar();
        let text = format!("[背包|药水|药品|恢复50HP|{}]", quantity);
        ReconcilingExtractor::new(grammar, Backpack).extract(&text)[0].clone()
    }

    fn task(state: &str) -> Task {
        let text = format!("[任务|T1|采药|采十株草药|药师|50金币]{}", state);
        ReconcilingExtractor::new(grammar(), TaskBoard).extract(&text)[0].clone()
    }

    #[test]
    fn partial_use_keeps_the_remainder() {
        let formatter = WriteBackFormatter::new("旅人");
        let wb = formatter
            .format(&WriteAction::UseItem {
                item: potion(3),
                amount: 1,
            })
            .unwrap();

        assert_eq!(wb.text, "旅人使用了1个药水。[背包|药水|药品|恢复50HP|2]");
        assert_eq!(wb.supersede[0].key, vec!["药水", "药品"]);
    }

    #[test]
    fn using_everything_emits_no_item_token() {
        let formatter = WriteBackFormatter::new("旅人");
        let wb = formatter
            .format(&WriteAction::UseItem {
                item: potion(2),
                amount: 2,
            })
            .unwrap();
        assert_eq!(wb.text, "旅人使用了2个药水。");

        let err = formatter
            .format(&WriteAction::UseItem {
                item: potion(2),
                amount: 3,
            })
            .unwrap_err();
        assert!(matches!(err, WriteBackError::InvalidAction(_)));
    }

    #[test]
    fn task_markers_echo_the_definition() {
        let formatter = WriteBackFormatter::new("旅人");
        let wb = formatter
            .format(&WriteAction::AcceptTask { task: task("") })
            .unwrap();
        assert!(wb
            .text
            .ends_with("[接受任务|T1|采药|采十株草药|药师|50金币]"));

        assert!(formatter
            .format(&WriteAction::CompleteTask { task: task("") })
            .is_err());
        assert!(formatter
            .format(&WriteAction::CompleteTask {
                task: task("[接受任务|T1]")
            })
            .is_ok());
    }

    #[test]
    fn floor_reply_quotes_its_parent() {
        let thread = ReconcilingExtractor::new(grammar(), Forum)
            .extract("[标题|楼主|7|周末去哪|无聊][回复|小明|7|爬山]")[0]
            .clone();
        let formatter = WriteBackFormatter::new("旅人");

        let wb = formatter
            .format(&WriteAction::ReplyFloor {
                thread: thread.clone(),
                floor: 1,
                content: "同去".to_string(),
            })
            .unwrap();
        assert!(wb.text.contains("小明的评论「爬山」"));
        assert!(wb.text.ends_with("[楼中楼|旅人|7|1楼|同去]"));

        assert!(formatter
            .format(&WriteAction::ReplyFloor {
                thread,
                floor: 4,
                content: "同去".to_string(),
            })
            .is_err());
    }

    #[test]
    fn field_separators_in_user_text_are_neutralised() {
        let formatter = WriteBackFormatter::new("旅人");
        let wb = formatter
            .format(&WriteAction::PostThread {
                thread_id: "3".to_string(),
                title: "a|b".to_string(),
                body: "[x]".to_string(),
            })
            .unwrap();
        let threads = ReconcilingExtractor::new(grammar(), Forum).extract(&wb.text);
        assert_eq!(threads[0].title, "a｜b");
        assert_eq!(threads[0].body, "［x］");
    }

    #[test]
    fn supersede_rewrites_only_matching_tokens() {
        let supersede = Supersede {
            from: TokenKind::Item,
            to: TokenKind::Used,
            key: vec!["药水".to_string(), "药品".to_string()],
        };
        let text = "拿到[背包|药水|药品|恢复50HP|3]和[背包|面包|食品|充饥|1]";
        assert_eq!(
            supersede.rewrite(&grammar(), text).unwrap(),
            "拿到[已使用|药水|药品|恢复50HP|3]和[背包|面包|食品|充饥|1]"
        );
        assert_eq!(supersede.rewrite(&grammar(), "[背包|面包|食品|充饥|1]"), None);
    }

    #[tokio::test]
    async fn using_an_item_updates_the_next_scan() {
        let grammar = grammar();
        let log = InMemoryChatLog::from_messages(vec![
            ChatMessage::from_host("你获得了[背包|药水|药品|恢复50HP|3]"),
            ChatMessage::from_host("又获得了[背包|药水|药品|恢复50HP|2]"),
        ]);
        let host = Arc::new(InMemoryHost::new(log.clone()));
        let channel = HostInputChannel::new(host, Duration::from_millis(0));
        let service = WriteBackService::new(
            WriteBackFormatter::new("旅人"),
            grammar.clone(),
            Arc::new(log.clone()),
            Arc::new(log.clone()),
            Arc::new(channel),
        );

        service
            .perform(&WriteAction::UseItem {
                item: potion(5),
                amount: 2,
            })
            .await
            .unwrap();

        let items =
            ReconcilingExtractor::new(grammar, Backpack).extract_messages(&log.get_all_messages());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 3);
    }

    /// Patches always fail; reads go to the wrapped log.
    struct LockedLog;

    impl PatchableLog for LockedLog {
        fn patch_messages(
            &self,
            _upto: usize,
            _patch: &mut dyn FnMut(&str) -> Option<String>,
        ) -> Result<usize, SourceError> {
            Err(SourceError::Unavailable("read-only".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_patch_sends_nothing() {
        let grammar = grammar();
        let log = InMemoryChatLog::from_messages(vec![ChatMessage::from_host(
            "[背包|药水|药品|恢复50HP|5]",
        )]);
        let channel = RecordingChannel::new();
        let service = WriteBackService::new(
            WriteBackFormatter::new("旅人"),
            grammar.clone(),
            Arc::new(log.clone()),
            Arc::new(LockedLog),
            Arc::new(channel.clone()),
        );

        let err = service
            .perform(&WriteAction::UseItem {
                item: potion(5),
                amount: 2,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WriteBackError::Patch(_)));
        assert!(channel.sent().is_empty());
        let items =
            ReconcilingExtractor::new(grammar, Backpack).extract_messages(&log.get_all_messages());
        assert_eq!(items[0].quantity, 5);
    }

    #[tokio::test]
    async fn unavailable_log_sends_nothing() {
        let log = InMemoryChatLog::from_messages(vec![ChatMessage::from_host(
            "[背包|药水|药品|恢复50HP|5]",
        )]);
        log.set_available(false);
        let channel = RecordingChannel::new();
        let service = WriteBackService::new(
            WriteBackFormatter::new("旅人"),
            grammar(),
            Arc::new(log.clone()),
            Arc::new(log.clone()),
            Arc::new(channel.clone()),
        );

        let err = service
            .perform(&WriteAction::UseItem {
                item: potion(5),
                amount: 2,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WriteBackError::Patch(SourceError::Unavailable(_))));
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn rejected_send_leaves_the_log_untouched() {
        let log = InMemoryChatLog::from_messages(vec![ChatMessage::from_host(
            "[背包|药水|药品|恢复50HP|3]",
        )]);
        let channel = RecordingChannel::new();
        channel.set_rejecting(true);
        let service = WriteBackService::new(
            WriteBackFormatter::new("旅人"),
            grammar(),
            Arc::new(log.clone()),
            Arc::new(log.clone()),
            Arc::new(channel.clone()),
        );

        let err = service
            .perform(&WriteAction::UseItem {
                item: potion(3),
                amount: 3,
            })
            .await
            .unwrap_err();

        assert_eq!(err, WriteBackError::SendDisabled);
        assert!(channel.sent().is_empty());
        assert_eq!(log.get_all_messages()[0].text, "[背包|药水|药品|恢复50HP|3]");
    }
}
