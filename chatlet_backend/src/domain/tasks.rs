//! Task board: `[任务|id|name|description|publisher|reward]` plus the
//! `[接受任务|id|...]` and `[完成任务|id|...]` markers.
//!
//! State only ever moves forward. A repeated definition replaces every
//! field it carries. Markers usually echo the task's fields: the echo only
//! fills fields the definitions left empty, and a marker whose base token
//! is gone still yields a task.

use serde::{Deserialize, Serialize};

use super::{Domain, KeyedMerge, MergePolicy, Reconcile, Snapshot};
use crate::grammar::{Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Available,
    Accepted,
    Completed,
}

impl TaskState {
    fn from_kind(kind: TokenKind) -> Self {
        match kind {
            TokenKind::TaskAccept => TaskState::Accepted,
            TokenKind::TaskComplete => TaskState::Completed,
            _ => TaskState::Available,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    pub publisher: String,
    pub reward: String,
    pub state: TaskState,
}

impl Task {
    pub fn from_token(token: &Token) -> Self {
        Self {
            id: token.field(0).to_string(),
            name: token.field(1).to_string(),
            description: token.field(2).to_string(),
            publisher: token.field(3).to_string(),
            reward: token.field(4).to_string(),
            state: TaskState::from_kind(token.kind),
        }
    }

    /// Fields in wire order, id first.
    pub fn defining_fields(&self) -> [&str; 5] {
        [
            self.id.as_str(),
            self.name.as_str(),
            self.description.as_str(),
            self.publisher.as_str(),
            self.reward.as_str(),
        ]
    }
}

impl Reconcile for Task {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn absorb(&mut self, incoming: Self, policy: MergePolicy) {
        if policy == MergePolicy::StateMachine {
            self.state = self.state.max(incoming.state);
        }
        for (slot, value) in self.text_slots(incoming) {
            if !value.is_empty() {
                *slot = value;
            }
        }
    }
}

impl Task {
    fn text_slots(&mut self, other: Task) -> [(&mut String, String); 4] {
        [
            (&mut self.name, other.name),
            (&mut self.description, other.description),
            (&mut self.publisher, other.publisher),
            (&mut self.reward, other.reward),
        ]
    }

    fn fill_from_echo(&mut self, echo: Task) {
        for (slot, value) in self.text_slots(echo) {
            if slot.is_empty() && !value.is_empty() {
                *slot = value;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskBoard;

impl Domain for TaskBoard {
    type Entity = Task;

    fn name(&self) -> &'static str {
        "tasks"
    }

    fn kinds(&self) -> &'static [TokenKind] {
        &[TokenKind::Task, TokenKind::TaskAccept, TokenKind::TaskComplete]
    }

    fn reconcile(&self, _text: &str, tokens: &[Token]) -> Snapshot<Task> {
        let mut merge = KeyedMerge::new(MergePolicy::StateMachine);

        // Definitions first so marker echoes never decide the listing order.
        for token in tokens.iter().filter(|t| t.kind == TokenKind::Task) {
            if !token.field(0).is_empty() {
                merge.insert(Task::from_token(token));
            }
        }

        for token in tokens
            .iter()
            .filter(|t| matches!(t.kind, TokenKind::TaskAccept | TokenKind::TaskComplete))
        {
            if token.field(0).is_empty() {
                continue;
            }
            if let Some(task) = merge.get_mut(&token.field(0).to_string()) {
                task.state = task.state.max(TaskState::from_kind(token.kind));
                task.fill_from_echo(Task::from_token(token));
            } else if token.fields.len() > 1 {
                merge.insert(Task::from_token(token));
            } else {
                tracing::debug!("Marker for unknown task '{}' ignored", token.field(0));
            }
        }

        merge.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReconcilingExtractor;
    use crate::grammar::TokenGrammar;
    use std::sync::Arc;

    fn extract(text: &str) -> Vec<Task> {
        ReconcilingExtractor::new(Arc::new(TokenGrammar::standard().unwrap()), TaskBoard)
            .extract(text)
    }

    #[test]
    fn markers_promote_state() {
        let tasks = extract(
            "[任务|1|找猫|找到走失的猫|王婆|10金币][任务|2|送信|送到村口|村长|5金币]\n[接受任务|1|找猫]",
        );
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].state, TaskState::Accepted);
        assert_eq!(tasks[1].state, TaskState::Available);
    }

    #[test]
    fn complete_without_accept_is_completed() {
        let tasks = extract("[任务|1|找猫|desc|王婆|10金币][完成任务|1]");
        assert_eq!(tasks[0].state, TaskState::Completed);
    }

    #[test]
    fn state_never_regresses() {
        let tasks = extract("[完成任务|1][任务|1|找猫|desc|王婆|10][接受任务|1][接受任务|1]");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].state, TaskState::Completed);
    }

    #[test]
    fn later_definitions_replace_earlier_text() {
        let tasks = extract("[任务|1|找猫|旧描述|王婆|10金币]\n[任务|1|找猫|新描述||99金币]");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "新描述");
        assert_eq!(tasks[0].reward, "99金币");
        assert_eq!(tasks[0].publisher, "王婆");
    }

    #[test]
    fn marker_echo_only_fills_gaps() {
        let tasks = extract("[任务|1|找猫||王婆|10金币][接受任务|1|找狗|走失的猫|李四|1金币]");
        assert_eq!(tasks[0].name, "找猫");
        assert_eq!(tasks[0].publisher, "王婆");
        assert_eq!(tasks[0].description, "走失的猫");
        assert_eq!(tasks[0].state, TaskState::Accepted);
    }

    #[test]
    fn echoed_marker_recreates_missing_task() {
        let tasks = extract("[接受任务|9|护送|护送商队|镖局|100金币][接受任务|10]");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "9");
        assert_eq!(tasks[0].publisher, "镖局");
        assert_eq!(tasks[0].state, TaskState::Accepted);
    }
}
