// src/memory/markers.rs

//! Injection markers and dialogue formatting.
//!
//! The same outbound payload may be reprocessed across retries and
//! regenerations, so previously injected memory blocks must be strippable
//! without touching unrelated content. `MemoryMarker` owns the wire format
//! (prefix/suffix pair plus the compiled pattern) so call sites never see
//! the regex.

use anyhow::Result;
use regex::Regex;
use serde_json::Value;

use crate::memory::types::{ChatMessage, ContextMessage, Role};

pub struct MemoryMarker {
    prefix: String,
    suffix: String,
    pattern: Regex,
}

impl MemoryMarker {
    pub fn new(prefix: &str, suffix: &str) -> Result<Self> {
        // Non-greedy, dot-matches-newline: a block is the shortest span
        // between one prefix and the next suffix.
        let pattern = Regex::new(&format!(
            "(?s){}.*?{}",
            regex::escape(prefix),
            regex::escape(suffix)
        ))?;
        Ok(Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            pattern,
        })
    }

    /// Wrap a formatted memory body into one marked block.
    pub fn encode(&self, body: &str) -> String {
        format!("{}\n{}\n{}", self.prefix, body, self.suffix)
    }

    /// Strip marked blocks from user-role messages, keeping the
    /// `keep_last` most recently seen blocks (scan order across all user
    /// messages). Non-string content passes through unmodified.
    pub fn strip_from_messages(
        &self,
        messages: Vec<ContextMessage>,
        keep_last: usize,
    ) -> Vec<ContextMessage> {
        let total: usize = messages
            .iter()
            .filter(|m| m.role == Role::User.as_str())
            .filter_map(|m| m.content.as_str())
            .map(|text| self.pattern.find_iter(text).count())
            .sum();
        let to_strip = total.saturating_sub(keep_last);
        if to_strip == 0 {
            return messages;
        }

        let mut seen = 0usize;
        messages
            .into_iter()
            .map(|mut message| {
                if message.role == Role::User.as_str() {
                    if let Value::String(text) = &message.content {
                        let cleaned = strip_occurrences(&self.pattern, text, &mut seen, to_strip);
                        message.content = Value::String(cleaned);
                    }
                }
                message
            })
            .collect()
    }

    /// Same keep-last stripping applied to a single string (system-prompt
    /// injection).
    pub fn strip_from_text(&self, text: &str, keep_last: usize) -> String {
        let total = self.pattern.find_iter(text).count();
        let to_strip = total.saturating_sub(keep_last);
        if to_strip == 0 {
            return text.to_string();
        }
        let mut seen = 0usize;
        strip_occurrences(&self.pattern, text, &mut seen, to_strip)
    }
}

/// Remove the first `to_strip - seen` matched blocks from `text`,
/// advancing the cross-message occurrence counter.
fn strip_occurrences(pattern: &Regex, text: &str, seen: &mut usize, to_strip: usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0usize;
    for found in pattern.find_iter(text) {
        out.push_str(&text[last..found.start()]);
        if *seen < to_strip {
            *seen += 1;
        } else {
            out.push_str(found.as_str());
        }
        last = found.end();
    }
    out.push_str(&text[last..]);
    out
}

/// Remove the oldest system-role messages beyond `keep_last`, preserving
/// the relative order of everything else (insert-as-system-message
/// injection).
pub fn trim_system_messages(
    messages: Vec<ContextMessage>,
    keep_last: usize,
) -> Vec<ContextMessage> {
    let system_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::System.as_str())
        .map(|(i, _)| i)
        .collect();

    if system_indices.len() <= keep_last {
        return messages;
    }
    let drop_until = system_indices.len() - keep_last;
    let dropped: std::collections::HashSet<usize> =
        system_indices[..drop_until].iter().copied().collect();

    messages
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !dropped.contains(i))
        .map(|(_, m)| m)
        .collect()
}

/// Flatten the newest `length` user/assistant turns into a
/// `"role: content"` line per turn, oldest first. System messages are
/// ignored and do not count toward `length`.
pub fn format_dialogue(history: &[ChatMessage], length: usize) -> String {
    if length == 0 {
        return String::new();
    }

    let mut selected: Vec<String> = Vec::new();
    for message in history.iter().rev() {
        match message.role {
            Role::User | Role::Assistant => {
                selected.insert(0, format!("{}: {}", message.role.as_str(), message.content));
                if selected.len() >= length {
                    break;
                }
            }
            Role::System => {}
        }
    }
    selected.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker() -> MemoryMarker {
        MemoryMarker::new("<long_term_memory>", "</long_term_memory>").unwrap()
    }

    fn user(content: &str) -> ContextMessage {
        ContextMessage::text("user", content)
    }

    #[test]
    fn encode_then_strip_is_identity_on_surroundings() {
        let m = marker();
        let block = m.encode("- [2024-01-01 10:00] user likes tea");
        let text = format!("before {} after", block);
        assert_eq!(m.strip_from_text(&text, 0), "before  after");
    }

    #[test]
    fn strip_keeps_last_n_blocks_across_messages() {
        let m = marker();
        let b1 = m.encode("one");
        let b2 = m.encode("two");
        let b3 = m.encode("three");
        let messages = vec![
            user(&format!("{} q1", b1)),
            ContextMessage::text("assistant", "a1"),
            user(&format!("{} q2", b2)),
            user(&format!("{} q3", b3)),
        ];

        let cleaned = m.strip_from_messages(messages, 1);
        let texts: Vec<&str> = cleaned
            .iter()
            .map(|c| c.content.as_str().unwrap())
            .collect();
        assert_eq!(texts[0], " q1");
        assert_eq!(texts[1], "a1");
        assert_eq!(texts[2], " q2");
        assert!(texts[3].contains("three"));
    }

    #[test]
    fn strip_keeps_duplicate_blocks_by_occurrence_not_value() {
        let m = marker();
        let block = m.encode("same");
        let messages = vec![user(&format!("{} first", block)), user(&format!("{} second", block))];

        let cleaned = m.strip_from_messages(messages, 1);
        let first = cleaned[0].content.as_str().unwrap();
        let second = cleaned[1].content.as_str().unwrap();
        // Only the most recent occurrence survives, even though the block
        // text is identical.
        assert_eq!(first, " first");
        assert!(second.contains("same"));
    }

    #[test]
    fn reinjection_after_strip_yields_exactly_one_block() {
        let m = marker();
        let old = m.encode("old memory");
        let messages = vec![user(&format!("{} hello", old)), user(&format!("{} again", old))];

        let cleaned = m.strip_from_messages(messages, 0);
        for message in &cleaned {
            let text = message.content.as_str().unwrap();
            assert!(!text.contains("old memory"));
        }

        let fresh = m.encode("new memory");
        let prompt = format!("{}\nwhat did I like?", fresh);
        assert_eq!(prompt.matches("<long_term_memory>").count(), 1);
    }

    #[test]
    fn assistant_and_system_content_is_untouched() {
        let m = marker();
        let block = m.encode("mem");
        let messages = vec![
            ContextMessage::text("assistant", &format!("{} reply", block)),
            ContextMessage::text("system", &format!("{} sys", block)),
        ];
        let cleaned = m.strip_from_messages(messages.clone(), 0);
        assert_eq!(cleaned, messages);
    }

    #[test]
    fn non_string_content_passes_through() {
        let m = marker();
        let mut message = user("ignored");
        message.content = serde_json::json!([{"type": "image", "url": "x"}]);
        let cleaned = m.strip_from_messages(vec![message.clone()], 0);
        assert_eq!(cleaned[0], message);
    }

    #[test]
    fn trim_system_keeps_newest_and_preserves_order() {
        let messages = vec![
            ContextMessage::text("system", "s1"),
            user("u1"),
            ContextMessage::text("system", "s2"),
            ContextMessage::text("assistant", "a1"),
            ContextMessage::text("system", "s3"),
        ];
        let trimmed = trim_system_messages(messages, 1);
        let flat: Vec<String> = trimmed
            .iter()
            .map(|m| m.content.as_str().unwrap().to_string())
            .collect();
        assert_eq!(flat, vec!["u1", "a1", "s3"]);
    }

    #[test]
    fn trim_system_zero_removes_all_system_messages() {
        let messages = vec![
            ContextMessage::text("system", "s1"),
            user("u1"),
            ContextMessage::text("system", "s2"),
        ];
        let trimmed = trim_system_messages(messages, 0);
        assert_eq!(trimmed.len(), 1);
        assert_eq!(trimmed[0].role, "user");
    }

    #[test]
    fn format_dialogue_round_trips_by_role_prefix() {
        let history = vec![
            ChatMessage::now(Role::User, "u1"),
            ChatMessage::now(Role::Assistant, "a1"),
            ChatMessage::now(Role::System, "sys"),
            ChatMessage::now(Role::User, "u2"),
            ChatMessage::now(Role::Assistant, "a2"),
        ];

        let formatted = format_dialogue(&history, 3);
        let parsed: Vec<(&str, &str)> = formatted
            .lines()
            .filter_map(|line| line.split_once(": "))
            .collect();
        // Last 3 user/assistant turns, oldest first, system excluded.
        assert_eq!(
            parsed,
            vec![("assistant", "a1"), ("user", "u2"), ("assistant", "a2")]
        );
    }

    #[test]
    fn format_dialogue_zero_length_is_empty() {
        let history = vec![ChatMessage::now(Role::User, "u1")];
        assert_eq!(format_dialogue(&history, 0), "");
    }
}
