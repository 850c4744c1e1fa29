//! Built-in stop conditions (spec.md §4.4) and the pure history snapshot
//! they evaluate against. `StopCondition::simple`/`::parametric` replace
//! the source language's `fn.length`-based overload dispatch (DESIGN.md
//! Open Question #5) with two explicit constructors.

use std::sync::Arc;

/// Accumulated state of one agent run, rebuilt fresh each iteration and
/// handed to every stop condition. Evaluation must be a pure function of
/// this snapshot: no IO, no mutation, same input always yields the same
/// verdict (testable property: stop-condition purity).
#[derive(Debug, Clone, Default)]
pub struct AgentStepHistory {
    pub steps: u32,
    pub total_tokens: u64,
    pub assistant_text: String,
    pub executed_tools: Vec<String>,
}

#[derive(Clone)]
pub struct StopCondition {
    name: &'static str,
    predicate: Arc<dyn Fn(&AgentStepHistory) -> bool + Send + Sync>,
}

impl StopCondition {
    /// A stop condition with no configuration, e.g. a fixed rule.
    pub fn simple(
        name: &'static str,
        predicate: impl Fn(&AgentStepHistory) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            predicate: Arc::new(predicate),
        }
    }

    /// A stop condition parameterized by data captured in the closure.
    pub fn parametric<P: Clone + Send + Sync + 'static>(
        name: &'static str,
        params: P,
        predicate: impl Fn(&AgentStepHistory, &P) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            predicate: Arc::new(move |history| predicate(history, &params)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn evaluate(&self, history: &AgentStepHistory) -> bool {
        (self.predicate)(history)
    }

    pub fn max_steps(count: u32) -> Self {
        Self::parametric("max_steps", count, |h, count| h.steps >= *count)
    }

    pub fn max_tokens(limit: u64) -> Self {
        Self::parametric("max_tokens", limit, |h, limit| h.total_tokens >= *limit)
    }

    /// Stops once every named tool has been called at least once. An
    /// empty set never stops (spec.md's explicit edge case).
    pub fn executed_tool(tool_names: Vec<String>) -> Self {
        Self::parametric("executed_tool", tool_names, |h, names| {
            !names.is_empty() && names.iter().all(|n| h.executed_tools.contains(n))
        })
    }

    /// Stops once the assistant text contains every given substring. An
    /// empty set never stops.
    pub fn has_text(texts: Vec<String>) -> Self {
        Self::parametric("has_text", texts, |h, texts| {
            !texts.is_empty() && texts.iter().all(|t| h.assistant_text.contains(t.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(steps: u32, tokens: u64, text: &str, tools: &[&str]) -> AgentStepHistory {
        AgentStepHistory {
            steps,
            total_tokens: tokens,
            assistant_text: text.to_string(),
            executed_tools: tools.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn max_steps_stops_at_threshold() {
        let cond = StopCondition::max_steps(3);
        assert!(!cond.evaluate(&history(2, 0, "", &[])));
        assert!(cond.evaluate(&history(3, 0, "", &[])));
    }

    #[test]
    fn max_tokens_stops_at_threshold() {
        let cond = StopCondition::max_tokens(100);
        assert!(!cond.evaluate(&history(0, 99, "", &[])));
        assert!(cond.evaluate(&history(0, 100, "", &[])));
    }

    #[test]
    fn executed_tool_requires_every_named_tool() {
        let cond = StopCondition::executed_tool(vec!["a".into(), "b".into()]);
        assert!(!cond.evaluate(&history(0, 0, "", &["a"])));
        assert!(cond.evaluate(&history(0, 0, "", &["a", "b"])));
    }

    #[test]
    fn executed_tool_with_empty_set_never_stops() {
        let cond = StopCondition::executed_tool(vec![]);
        assert!(!cond.evaluate(&history(999, 999_999, "anything", &["a", "b", "c"])));
    }

    #[test]
    fn has_text_requires_every_substring() {
        let cond = StopCondition::has_text(vec!["done".into(), "ok".into()]);
        assert!(!cond.evaluate(&history(0, 0, "done", &[])));
        assert!(cond.evaluate(&history(0, 0, "all done, ok", &[])));
    }

    #[test]
    fn has_text_with_empty_set_never_stops() {
        let cond = StopCondition::has_text(vec![]);
        assert!(!cond.evaluate(&history(0, 0, "anything at all", &[])));
    }

    #[test]
    fn evaluation_is_pure_across_repeated_calls() {
        let cond = StopCondition::max_steps(5);
        let h = history(5, 0, "", &[]);
        let first = cond.evaluate(&h);
        let second = cond.evaluate(&h);
        let third = cond.evaluate(&h);
        assert_eq!(first, second);
        assert_eq!(second, third);
    }
}
