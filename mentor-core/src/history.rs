//! Dialogue modes and the history window sent to the model.
//!
//! The window builder is a pure function: fixed system instruction for the
//! session's mode first, then the most recent `max_turns` user/assistant
//! pairs in their original order. Nothing here touches the database or the
//! provider, so every call with the same input produces the same window.

use crate::config::ChatConfig;
use crate::llm::{PromptMessage, PromptRole};
use crate::models::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Response style of a session, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueMode {
    /// Socratic style: guide with questions, never answer outright.
    GuidedQuestioning,
    /// Plain tutoring: short, precise, direct answers.
    DirectAnswer,
}

impl DialogueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogueMode::GuidedQuestioning => "guided_questioning",
            DialogueMode::DirectAnswer => "direct_answer",
        }
    }

    pub fn system_prompt(&self, course_material: &str) -> String {
        match self {
            DialogueMode::GuidedQuestioning => format!(
                "You are a Socratic tutor for {0}. Never give the answer outright. \
                 Respond with short, insightful guiding questions that lead the student \
                 to work the answer out on their own, building on what the student has \
                 already said. If the student asks about anything unrelated to {0}, \
                 politely decline and steer the conversation back to the material.",
                course_material
            ),
            DialogueMode::DirectAnswer => format!(
                "You are a tutor answering student questions about {0}. Give correct, \
                 precise and concise answers grounded in the material, quoting the \
                 relevant concept where it helps. If the student asks about anything \
                 unrelated to {0}, politely decline and steer the conversation back \
                 to the material.",
                course_material
            ),
        }
    }

    pub fn temperature(&self, config: &ChatConfig) -> f32 {
        match self {
            DialogueMode::GuidedQuestioning => config.guided_temperature,
            DialogueMode::DirectAnswer => config.direct_temperature,
        }
    }
}

impl fmt::Display for DialogueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DialogueMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guided_questioning" => Ok(DialogueMode::GuidedQuestioning),
            "direct_answer" => Ok(DialogueMode::DirectAnswer),
            other => Err(format!("unknown dialogue mode: {}", other)),
        }
    }
}

/// Build the provider message window for one turn.
///
/// Keeps the last `2 * max_turns` entries of `history` (all of it when
/// shorter) and prepends the mode's system instruction.
pub fn build_window(
    mode: DialogueMode,
    course_material: &str,
    history: &[Message],
    max_turns: usize,
) -> Vec<PromptMessage> {
    let keep = max_turns.saturating_mul(2);
    let start = history.len().saturating_sub(keep);

    let mut window = Vec::with_capacity(history.len() - start + 1);
    window.push(PromptMessage {
        role: PromptRole::System,
        content: mode.system_prompt(course_material),
    });
    for message in &history[start..] {
        window.push(PromptMessage {
            role: message.role.into(),
            content: message.content.clone(),
        });
    }
    window
}
