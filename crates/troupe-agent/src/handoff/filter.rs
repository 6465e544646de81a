use std::collections::HashMap;
use std::sync::Arc;

use troupe_core::error::{Result, TroupeError};
use troupe_core::types::{ChatMessage, Role};

type FilterFn = dyn Fn(Vec<ChatMessage>) -> Vec<ChatMessage> + Send + Sync;

/// A named, pure transformation applied to the conversation handed to a
/// handoff target.
#[derive(Clone)]
pub struct InputFilter {
    name: String,
    apply: Arc<FilterFn>,
}

impl std::fmt::Debug for InputFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputFilter").field("name", &self.name).finish()
    }
}

impl InputFilter {
    pub fn new<F>(name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(Vec<ChatMessage>) -> Vec<ChatMessage> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        (self.apply)(messages)
    }
}

/// Remove tool-use and tool-result blocks, dropping messages left empty.
pub fn drop_tool_calls(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .filter_map(|mut msg| {
            msg.content.retain(|b| !b.is_tool_record());
            if msg.content.is_empty() {
                None
            } else {
                Some(msg)
            }
        })
        .collect()
}

/// Keep only the last `n` non-system messages. System messages are kept.
pub fn keep_last(messages: Vec<ChatMessage>, n: usize) -> Vec<ChatMessage> {
    let conversational = messages.iter().filter(|m| m.role != Role::System).count();
    let mut to_skip = conversational.saturating_sub(n);
    messages
        .into_iter()
        .filter(|m| {
            if m.role == Role::System {
                return true;
            }
            if to_skip > 0 {
                to_skip -= 1;
                return false;
            }
            true
        })
        .collect()
}

/// Keep only user messages.
pub fn user_only(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages.into_iter().filter(|m| m.role == Role::User).collect()
}

const KEEP_LAST: &str = "keep_last";

/// Filters addressable by name.
///
/// `keep_last:<n>` is parsed on lookup and needs no registration.
#[derive(Debug, Clone, Default)]
pub struct FilterRegistry {
    filters: HashMap<String, InputFilter>,
}

impl FilterRegistry {
    /// An empty registry. Only `keep_last:<n>` resolves.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `drop_tool_calls` and `user_only` registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(InputFilter::new("drop_tool_calls", drop_tool_calls));
        registry.register(InputFilter::new("user_only", user_only));
        registry
    }

    pub fn register(&mut self, filter: InputFilter) {
        self.filters.insert(filter.name().to_string(), filter);
    }

    pub fn with(mut self, filter: InputFilter) -> Self {
        self.register(filter);
        self
    }

    /// Look up a filter by name.
    pub fn resolve(&self, name: &str) -> Result<InputFilter> {
        if let Some(filter) = self.filters.get(name) {
            return Ok(filter.clone());
        }

        if let Some(arg) = name
            .strip_prefix(KEEP_LAST)
            .and_then(|rest| rest.strip_prefix(':'))
        {
            let n: usize = arg
                .trim()
                .parse()
                .map_err(|_| TroupeError::UnknownFilter(name.to_string()))?;
            return Ok(InputFilter::new(name, move |msgs| keep_last(msgs, n)));
        }

        Err(TroupeError::UnknownFilter(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use troupe_core::types::RawToolCall;

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("you are triage"),
            ChatMessage::user("I want a refund"),
            ChatMessage::assistant_with_tools(
                "",
                &[RawToolCall::new("c1", "lookup_order", json!({"id": 7}))],
            ),
            ChatMessage::tool_result("c1", "order 7: shipped", false),
            ChatMessage::assistant_text("Let me get billing."),
        ]
    }

    #[test]
    fn drop_tool_calls_strips_tool_records() {
        let filtered = drop_tool_calls(conversation());
        assert_eq!(filtered.len(), 3);
        assert!(filtered.iter().all(|m| !m.has_tool_records()));
        assert_eq!(filtered[1].text(), "I want a refund");
    }

    #[test]
    fn drop_tool_calls_keeps_text_beside_tool_use() {
        let msgs = vec![ChatMessage::assistant_with_tools(
            "checking",
            &[RawToolCall::new("c1", "lookup", json!({}))],
        )];
        let filtered = drop_tool_calls(msgs);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].content.len(), 1);
    }

    #[test]
    fn keep_last_counts_non_system() {
        let filtered = keep_last(conversation(), 2);
        assert_eq!(filtered.len(), 3);
        assert_eq!(filtered[0].role, Role::System);
        assert_eq!(filtered[2].text(), "Let me get billing.");
    }

    #[test]
    fn user_only_filter() {
        let filtered = user_only(conversation());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].role, Role::User);
    }

    #[test]
    fn registry_resolution() {
        let registry = FilterRegistry::with_builtins();
        assert!(registry.resolve("drop_tool_calls").is_ok());
        assert_eq!(registry.resolve("keep_last:1").unwrap().apply(conversation()).len(), 2);
        assert!(matches!(
            registry.resolve("keep_last:x").unwrap_err(),
            TroupeError::UnknownFilter(_)
        ));
        assert!(matches!(
            registry.resolve("summarize").unwrap_err(),
            TroupeError::UnknownFilter(_)
        ));
    }

    #[test]
    fn custom_filter() {
        let registry = FilterRegistry::new().with(InputFilter::new("none", |_| Vec::new()));
        assert!(registry.resolve("none").unwrap().apply(conversation()).is_empty());
        assert!(!registry.contains("drop_tool_calls"));
    }
}
