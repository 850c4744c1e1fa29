//! Memory compactor (spec.md §4.5): folds older conversation messages into
//! a model-generated summary once the running token estimate exceeds
//! budget. No corpus repo implements this algorithm; built from the spec
//! in the style of the rest of `polos-core` (message/token shapes from
//! `polos_contracts::message`, LLM call shape from `traits`).

use polos_contracts::{ConversationMessage, MessageRole};

use crate::error::{CoreError, Result};
use crate::traits::{LlmCallConfig, LlmMessage, LlmMessageRole, LlmProvider};

pub const SUMMARY_PREFIX: &str = "[Prior conversation summary]";
const SUMMARY_ACK: &str = "Understood, I have the prior context.";

#[derive(Debug, Clone)]
pub struct CompactionOptions {
    pub max_conversation_tokens: u64,
    pub min_recent_messages: usize,
    pub max_summary_tokens: u64,
    pub compaction_model: String,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            max_conversation_tokens: 8_000,
            min_recent_messages: 4,
            max_summary_tokens: 500,
            compaction_model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub compacted: bool,
    pub messages: Vec<ConversationMessage>,
}

/// char-length / 4 rounded up; non-string content is JSON-stringified first.
pub fn estimate_tokens(message: &ConversationMessage) -> u64 {
    let text = message
        .text()
        .map(|s| s.to_string())
        .unwrap_or_else(|| message.content.to_llm_string());
    ((text.len() as u64) + 3) / 4
}

fn total_tokens(messages: &[ConversationMessage]) -> u64 {
    messages.iter().map(estimate_tokens).sum()
}

fn is_summary_pair(messages: &[ConversationMessage], at: usize) -> bool {
    let (Some(user), Some(assistant)) = (messages.get(at), messages.get(at + 1)) else {
        return false;
    };
    user.role == MessageRole::User
        && assistant.role == MessageRole::Assistant
        && user
            .text()
            .map(|t| t.starts_with(SUMMARY_PREFIX))
            .unwrap_or(false)
        && assistant.text() == Some(SUMMARY_ACK)
}

/// Detects an existing summary pair at the front of `messages`, returning
/// the summary text (stripped of the prefix) if present.
pub fn existing_summary(messages: &[ConversationMessage]) -> Option<String> {
    if is_summary_pair(messages, 0) {
        messages[0]
            .text()
            .map(|t| t.trim_start_matches(SUMMARY_PREFIX).trim().to_string())
    } else {
        None
    }
}

fn naive_truncate(
    messages: Vec<ConversationMessage>,
    min_recent: usize,
    existing: Option<&ConversationMessage>,
    existing_ack: Option<&ConversationMessage>,
) -> Vec<ConversationMessage> {
    let tail_start = messages.len().saturating_sub(min_recent);
    let mut out = Vec::new();
    if let (Some(u), Some(a)) = (existing, existing_ack) {
        out.push(u.clone());
        out.push(a.clone());
    }
    out.extend(messages[tail_start..].iter().cloned());
    out
}

fn build_prompt(existing_summary: &str, to_fold: &[ConversationMessage]) -> String {
    let folded: String = to_fold
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content.to_llm_string()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Summarize the following conversation, incorporating any existing summary.\n\n\
         {{existing_summary}}: {existing_summary}\n{{messages_to_fold}}:\n{folded}"
    )
}

/// Folds `messages` into a summary pair if the running token estimate
/// exceeds `opts.max_conversation_tokens`. No-ops (returning the input by
/// reference-equal content) if under budget or if there are fewer
/// candidates than `min_recent_messages` to fold.
pub async fn compact_if_needed(
    messages: Vec<ConversationMessage>,
    opts: &CompactionOptions,
    provider: &dyn LlmProvider,
) -> Result<CompactionResult> {
    if total_tokens(&messages) <= opts.max_conversation_tokens {
        return Ok(CompactionResult {
            compacted: false,
            messages,
        });
    }

    let has_existing = is_summary_pair(&messages, 0);
    let (existing_pair, rest) = if has_existing {
        (Some((messages[0].clone(), messages[1].clone())), &messages[2..])
    } else {
        (None, &messages[..])
    };

    if rest.len() <= opts.min_recent_messages {
        return Ok(CompactionResult {
            compacted: false,
            messages,
        });
    }

    let fold_count = rest.len() - opts.min_recent_messages;
    let to_fold = &rest[..fold_count];
    let recent = &rest[fold_count..];

    let existing_text = existing_pair
        .as_ref()
        .map(|(u, _)| u.text().unwrap_or("").trim_start_matches(SUMMARY_PREFIX).trim().to_string())
        .unwrap_or_default();

    let summary = match summarize(&existing_text, to_fold, opts, provider).await {
        Ok(summary) => summary,
        Err(_) => {
            let (eu, ea) = existing_pair
                .as_ref()
                .map(|(u, a)| (Some(u), Some(a)))
                .unwrap_or((None, None));
            return Ok(CompactionResult {
                compacted: true,
                messages: naive_truncate(messages, opts.min_recent_messages, eu, ea),
            });
        }
    };

    let summary = if estimate_text_tokens(&summary) > opts.max_summary_tokens {
        resummarize(summary, opts, provider).await?
    } else {
        summary
    };

    let mut out = Vec::with_capacity(2 + recent.len());
    out.push(ConversationMessage::user(format!("{SUMMARY_PREFIX} {summary}")));
    out.push(ConversationMessage::assistant(SUMMARY_ACK));
    out.extend(recent.iter().cloned());

    Ok(CompactionResult {
        compacted: true,
        messages: out,
    })
}

fn estimate_text_tokens(text: &str) -> u64 {
    ((text.len() as u64) + 3) / 4
}

async fn summarize(
    existing_summary: &str,
    to_fold: &[ConversationMessage],
    opts: &CompactionOptions,
    provider: &dyn LlmProvider,
) -> Result<String> {
    let prompt = build_prompt(existing_summary, to_fold);
    let response = provider
        .chat_completion(
            vec![LlmMessage::text(LlmMessageRole::User, prompt)],
            &LlmCallConfig {
                model: opts.compaction_model.clone(),
                temperature: Some(0.0),
                max_tokens: Some(opts.max_summary_tokens as u32 * 2),
                tools: Vec::new(),
            },
        )
        .await
        .map_err(|e| CoreError::Internal(anyhow::anyhow!(e.to_string())))?;
    Ok(response.text)
}

async fn resummarize(
    summary: String,
    opts: &CompactionOptions,
    provider: &dyn LlmProvider,
) -> Result<String> {
    let folded = vec![ConversationMessage::assistant(summary)];
    summarize("", &folded, opts, provider).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLlmProvider;

    fn msg(role: MessageRole, text: &str) -> ConversationMessage {
        match role {
            MessageRole::User => ConversationMessage::user(text),
            MessageRole::Assistant => ConversationMessage::assistant(text),
            MessageRole::System => ConversationMessage::system(text),
            MessageRole::Tool => ConversationMessage::tool_result("x", None, Some(text.into())),
        }
    }

    #[tokio::test]
    async fn under_budget_is_a_no_op() {
        let messages = vec![msg(MessageRole::User, "hi"), msg(MessageRole::Assistant, "hello")];
        let opts = CompactionOptions {
            max_conversation_tokens: 10_000,
            ..CompactionOptions::default()
        };
        let provider = FakeLlmProvider::with_text("unused");
        let result = compact_if_needed(messages.clone(), &opts, &provider).await.unwrap();
        assert!(!result.compacted);
        assert_eq!(result.messages.len(), messages.len());
    }

    #[tokio::test]
    async fn scenario_e_eight_messages_compact_to_summary_pair_plus_two() {
        // 8 messages of ~20 chars (~5 tokens) each, max_conversation_tokens=10,
        // min_recent_messages=2: expect 4 output messages (summary pair + last 2).
        let mut messages = Vec::new();
        for i in 0..8 {
            let role = if i % 2 == 0 { MessageRole::User } else { MessageRole::Assistant };
            messages.push(msg(role, "twenty character text!!"));
        }
        let opts = CompactionOptions {
            max_conversation_tokens: 10,
            min_recent_messages: 2,
            max_summary_tokens: 500,
            compaction_model: "fake".into(),
        };
        let provider = FakeLlmProvider::with_text("summary");
        let result = compact_if_needed(messages.clone(), &opts, &provider).await.unwrap();

        assert!(result.compacted);
        assert_eq!(result.messages.len(), 4);
        assert!(is_summary_pair(&result.messages, 0));
        assert_eq!(result.messages[2].text(), messages[6].text());
        assert_eq!(result.messages[3].text(), messages[7].text());
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_naive_truncation() {
        let mut messages = Vec::new();
        for i in 0..8 {
            let role = if i % 2 == 0 { MessageRole::User } else { MessageRole::Assistant };
            messages.push(msg(role, "twenty character text!!"));
        }
        let opts = CompactionOptions {
            max_conversation_tokens: 10,
            min_recent_messages: 2,
            max_summary_tokens: 500,
            compaction_model: "fake".into(),
        };
        let provider = FakeLlmProvider::failing();
        let result = compact_if_needed(messages.clone(), &opts, &provider).await.unwrap();

        assert!(result.compacted);
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.messages[0].text(), messages[6].text());
        assert_eq!(result.messages[1].text(), messages[7].text());
    }

    #[test]
    fn not_enough_candidates_is_detected_as_summary_pair_absent() {
        let messages = vec![msg(MessageRole::User, "a"), msg(MessageRole::Assistant, "b")];
        assert!(!is_summary_pair(&messages, 0));
    }
}
