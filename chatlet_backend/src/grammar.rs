//! Bracket-delimited token grammar.
//!
//! Every widget record travels through the chat as `[Label|f1|f2|...|fN]`.
//! Kinds with a fixed arity let the final field run up to the closing
//! bracket; marker kinds (task accept/complete) take however many fields
//! follow the id. There is no escaping inside field values.

use std::borrow::Cow;
use std::ops::Range;

use anyhow::{Context, Result};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ParseSkip;

/// `[label|body]` where neither part may contain another bracket.
const TOKEN_PATTERN: &str = r"\[([^\[\]|]+)\|([^\[\]]*)\]";

pub const DEFAULT_THINKING_MARKERS: &[(&str, &str)] =
    &[("<thinking>", "</thinking>"), ("<think>", "</think>")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    Item,
    Used,
    Product,
    Task,
    TaskAccept,
    TaskComplete,
    Thread,
    Reply,
    SubReply,
    Friend,
    Group,
}

impl TokenKind {
    pub const ALL: [TokenKind; 11] = [
        TokenKind::Item,
        TokenKind::Used,
        TokenKind::Product,
        TokenKind::Task,
        TokenKind::TaskAccept,
        TokenKind::TaskComplete,
        TokenKind::Thread,
        TokenKind::Reply,
        TokenKind::SubReply,
        TokenKind::Friend,
        TokenKind::Group,
    ];

    /// Label as it appears on the wire.
    pub fn label(self) -> &'static str {
        match self {
            TokenKind::Item => "背包",
            TokenKind::Used => "已使用",
            TokenKind::Product => "商品",
            TokenKind::Task => "任务",
            TokenKind::TaskAccept => "接受任务",
            TokenKind::TaskComplete => "完成任务",
            TokenKind::Thread => "标题",
            TokenKind::Reply => "回复",
            TokenKind::SubReply => "楼中楼",
            TokenKind::Friend => "好友id",
            TokenKind::Group => "群聊",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.label() == label)
    }

    /// Minimum field count. For fixed-arity kinds this is also the maximum.
    pub fn arity(self) -> usize {
        match self {
            TokenKind::Item | TokenKind::Used | TokenKind::Product => 4,
            TokenKind::Task => 5,
            TokenKind::TaskAccept | TokenKind::TaskComplete => 1,
            TokenKind::Thread => 4,
            TokenKind::Reply => 3,
            TokenKind::SubReply => 4,
            TokenKind::Friend => 2,
            TokenKind::Group => 3,
        }
    }

    fn open_ended(self) -> bool {
        matches!(self, TokenKind::TaskAccept | TokenKind::TaskComplete)
    }
}

/// One parsed record. `span` is the byte range of the whole bracket pair
/// in the text that was scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub fields: Vec<String>,
    pub span: Range<usize>,
}

impl Token {
    pub fn field(&self, index: usize) -> &str {
        self.fields.get(index).map(String::as_str).unwrap_or("")
    }

    /// Integer field, `1` when the value is not a number.
    pub fn count(&self, index: usize) -> u32 {
        parse_count(self.field(index))
    }

    /// Decimal field, `0` when the value is not a number.
    pub fn amount(&self, index: usize) -> f64 {
        parse_amount(self.field(index))
    }

    pub fn to_wire(&self) -> String {
        format_token(self.kind, &self.fields)
    }
}

/// Parse the inside of one bracket pair.
pub fn parse_fragment(label: &str, body: &str, span: Range<usize>) -> Result<Token, ParseSkip> {
    let label = label.trim();
    let kind =
        TokenKind::from_label(label).ok_or_else(|| ParseSkip::UnknownLabel(label.to_string()))?;

    let fields: Vec<String> = if kind.open_ended() {
        body.split('|').map(|f| f.trim().to_string()).collect()
    } else {
        body.splitn(kind.arity(), '|')
            .map(|f| f.trim().to_string())
            .collect()
    };

    if fields.len() < kind.arity() {
        return Err(ParseSkip::MissingFields {
            label: label.to_string(),
            expected: kind.arity(),
            found: fields.len(),
        });
    }

    Ok(Token { kind, fields, span })
}

/// Render a token. Characters that would break the grammar are replaced
/// with their full-width forms so the output always parses back.
pub fn format_token<S: AsRef<str>>(kind: TokenKind, fields: &[S]) -> String {
    let mut out = String::from("[");
    out.push_str(kind.label());
    for field in fields {
        out.push('|');
        out.push_str(&sanitize_field(field.as_ref()));
    }
    out.push(']');
    out
}

fn sanitize_field(raw: &str) -> Cow<'_, str> {
    let raw = raw.trim();
    if !raw.contains(['|', '[', ']']) {
        return Cow::Borrowed(raw);
    }
    Cow::Owned(
        raw.chars()
            .map(|c| match c {
                '|' => '｜',
                '[' => '［',
                ']' => '］',
                other => other,
            })
            .collect(),
    )
}

/// Leading-digit integer parse (`"3个"` is 3), falling back to 1.
pub fn parse_count(raw: &str) -> u32 {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(1)
}

/// Leading-number decimal parse (`"12.5金币"` is 12.5), falling back to 0.
pub fn parse_amount(raw: &str) -> f64 {
    let number: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    number.trim_end_matches('.').parse().unwrap_or(0.0)
}

pub struct TokenGrammar {
    pattern: Regex,
    thinking_markers: Vec<(String, String)>,
}

impl TokenGrammar {
    pub fn new<I, S>(thinking_markers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let pattern = Regex::new(TOKEN_PATTERN).context("Failed to compile token pattern")?;
        let thinking_markers = thinking_markers
            .into_iter()
            .map(|(start, end)| (start.into(), end.into()))
            .filter(|(start, end): &(String, String)| !start.is_empty() && !end.is_empty())
            .collect();
        Ok(Self {
            pattern,
            thinking_markers,
        })
    }

    /// Grammar with the default `<thinking>` / `<think>` markers.
    pub fn standard() -> Result<Self> {
        Self::new(DEFAULT_THINKING_MARKERS.iter().copied())
    }

    /// Remove every thinking span. A span that never closes runs to the end
    /// of `text`.
    pub fn strip_thinking<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out: Option<String> = None;
        let mut rest = text;

        loop {
            let next = self
                .thinking_markers
                .iter()
                .filter_map(|(open, close)| rest.find(open.as_str()).map(|at| (at, open, close)))
                .min_by_key(|(at, _, _)| *at);
            let Some((start, open, close)) = next else {
                break;
            };

            out.get_or_insert_with(String::new)
                .push_str(&rest[..start]);
            let inside = &rest[start + open.len()..];
            match inside.find(close.as_str()) {
                Some(end) => rest = &inside[end + close.len()..],
                None => {
                    rest = "";
                    break;
                }
            }
        }

        match out {
            Some(mut stripped) => {
                stripped.push_str(rest);
                Cow::Owned(stripped)
            }
            None => Cow::Borrowed(text),
        }
    }

    /// Every well-formed token in `text`, in document order, without
    /// stripping thinking spans. Spans index into `text` itself.
    pub fn scan_raw(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        for caps in self.pattern.captures_iter(text) {
            let (Some(whole), Some(label), Some(body)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            match parse_fragment(label.as_str(), body.as_str(), whole.range()) {
                Ok(token) => tokens.push(token),
                Err(ParseSkip::UnknownLabel(_)) => {}
                Err(skip) => tracing::debug!("Skipping token fragment: {}", skip),
            }
        }
        tokens
    }

    /// Tokens of the requested kinds in document order, after thinking
    /// spans are removed. Spans index into the stripped text.
    pub fn parse_kinds(&self, text: &str, kinds: &[TokenKind]) -> Vec<Token> {
        let visible = self.strip_thinking(text);
        self.scan_raw(&visible)
            .into_iter()
            .filter(|token| kinds.contains(&token.kind))
            .collect()
    }

    pub fn parse_all(&self, text: &str, kind: TokenKind) -> Vec<Token> {
        self.parse_kinds(text, &[kind])
    }

    pub fn format<S: AsRef<str>>(&self, kind: TokenKind, fields: &[S]) -> String {
        format_token(kind, fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grammar() -> TokenGrammar {
        TokenGrammar::standard().unwrap()
    }

    #[test]
    fn finds_several_kinds_on_one_line() {
        let text = "获得了[背包|药水|药品|恢复50HP|3]，商店上架[商品|铁剑|武器|锋利|120]";
        let tokens = grammar().parse_kinds(text, &[TokenKind::Item, TokenKind::Product]);

        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].kind, TokenKind::Item);
        assert_eq!(tokens[0].fields, vec!["药水", "药品", "恢复50HP", "3"]);
        assert_eq!(tokens[1].kind, TokenKind::Product);
        assert_eq!(tokens[1].amount(3), 120.0);
    }

    #[test]
    fn marker_labels_do_not_match_their_suffix_kind() {
        let text = "[接受任务|T1|寻找猫咪][任务|T2|送信|把信送到村口|村长|50金币]";
        let tasks = grammar().parse_all(text, TokenKind::Task);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].field(0), "T2");

        let accepts = grammar().parse_all(text, TokenKind::TaskAccept);
        assert_eq!(accepts.len(), 1);
        assert_eq!(accepts[0].fields, vec!["T1", "寻找猫咪"]);
    }

    #[test]
    fn last_field_keeps_extra_pipes() {
        let tokens = grammar().parse_all("[回复|小明|7|我觉得|可以]", TokenKind::Reply);
        assert_eq!(tokens[0].fields, vec!["小明", "7", "我觉得|可以"]);
    }

    #[test]
    fn short_tokens_and_unknown_labels_are_skipped() {
        let text = "[背包|药水|药品] [天气|晴] [[背包|面包|食品|香|2]";
        let tokens = grammar().scan_raw(text);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].field(0), "面包");
    }

    #[test]
    fn numeric_fields_fall_back_to_defaults() {
        assert_eq!(parse_count("3个"), 3);
        assert_eq!(parse_count("很多"), 1);
        assert_eq!(parse_count(" 12 "), 12);
        assert_eq!(parse_amount("12.5金币"), 12.5);
        assert_eq!(parse_amount("免费"), 0.0);
        assert_eq!(parse_amount("30."), 30.0);
    }

    #[test]
    fn thinking_spans_are_removed_before_matching() {
        let text = "<thinking>也许给他[背包|金条|材料|闪亮|99]</thinking>你得到了[背包|木棍|材料|普通|1]";
        let tokens = grammar().parse_all(text, TokenKind::Item);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].field(0), "木棍");
    }

    #[test]
    fn unterminated_thinking_span_hides_the_rest() {
        let g = grammar();
        assert_eq!(g.strip_thinking("前文<think>还在想[背包|a|b|c|1]"), "前文");
        assert_eq!(g.strip_thinking("没有标记"), "没有标记");
        assert!(matches!(g.strip_thinking("plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn formatting_replaces_grammar_characters() {
        let wire = format_token(TokenKind::Reply, &["小明", "3", "看[这里]|那里"]);
        assert_eq!(wire, "[回复|小明|3|看［这里］｜那里]");

        let parsed = grammar().scan_raw(&wire);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].field(2), "看［这里］｜那里");
    }
}
