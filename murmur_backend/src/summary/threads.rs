use std::collections::HashSet;

use serde_json::Value;

use crate::error::CallError;
use crate::model::{Thread, Timestamp};

/// Parse `{"threads": [...]}` into typed threads. A bare array is accepted as
/// the thread list. Missing or ill-typed fields are validation failures.
pub fn parse_threads(value: &Value) -> Result<Vec<Thread>, CallError> {
    let list = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("threads") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(CallError::Validation(
                    "'threads' must be an array".to_string(),
                ))
            }
            None => {
                return Err(CallError::Validation(
                    "response has no 'threads' field".to_string(),
                ))
            }
        },
        other => {
            return Err(CallError::Validation(format!(
                "expected an object with 'threads', got {}",
                json_kind(other)
            )))
        }
    };

    list.iter()
        .enumerate()
        .map(|(index, item)| parse_thread(index, item))
        .collect()
}

fn parse_thread(index: usize, item: &Value) -> Result<Thread, CallError> {
    let invalid = |what: &str| CallError::Validation(format!("thread {}: {}", index, what));

    let topic_summary = item
        .get("topic_summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("missing 'topic_summary'"))?
        .to_string();

    let keywords = match item.get("keywords") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(words)) => words
            .iter()
            .map(|w| w.as_str().map(|s| s.trim().to_string()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| invalid("'keywords' must contain strings"))?
            .into_iter()
            .filter(|w| !w.is_empty())
            .collect(),
        Some(_) => return Err(invalid("'keywords' must be an array")),
    };

    let message_timestamps = item
        .get("message_timestamps")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing 'message_timestamps'"))?
        .iter()
        .map(Value::as_i64)
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| invalid("'message_timestamps' must contain integers"))?;

    let ongoing = match item.get("ongoing") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(_) => return Err(invalid("'ongoing' must be a boolean")),
    };

    let priority = match item.get("priority") {
        None | Some(Value::Null) => 0,
        Some(value) => value
            .as_i64()
            .ok_or_else(|| invalid("'priority' must be an integer"))?,
    };

    Ok(Thread {
        topic_summary,
        keywords,
        message_timestamps,
        ongoing,
        priority,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Default)]
pub struct Partition {
    pub complete: Vec<Thread>,
    pub incomplete: Vec<Thread>,
    pub dropped: usize,
}

/// Complete threads only reference analyzed messages and are not flagged as
/// still ongoing. Threads with no timestamps carry nothing to persist.
pub fn partition_threads(threads: Vec<Thread>, analyzed: &HashSet<Timestamp>) -> Partition {
    let mut partition = Partition::default();
    for mut thread in threads {
        thread.message_timestamps.sort_unstable();
        thread.message_timestamps.dedup();
        if thread.message_timestamps.is_empty() {
            tracing::warn!(
                "Dropping summary thread without timestamps: {}",
                thread.topic_summary
            );
            partition.dropped += 1;
            continue;
        }

        let covered = thread
            .message_timestamps
            .iter()
            .all(|ts| analyzed.contains(ts));
        if covered && !thread.ongoing {
            partition.complete.push(thread);
        } else {
            if !covered {
                tracing::debug!(
                    "Thread '{}' references messages outside the analyzed set",
                    thread.topic_summary
                );
            }
            partition.incomplete.push(thread);
        }
    }
    partition
}

/// Rewrite standalone first-person pronouns into the agent's name so stored
/// memories read in third person.
pub fn normalize_voice(text: &str, name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return text.to_string();
    }

    let possessive = format!("{}'s", name);
    let rules = [
        (r"(?i)\bI'm\b", format!("{} is", name)),
        (r"(?i)\bI've\b", format!("{} has", name)),
        (r"(?i)\bI'll\b", format!("{} will", name)),
        (r"(?i)\bI'd\b", format!("{} would", name)),
        (r"(?i)\b(my|mine)\b", possessive),
        (r"(?i)\b(myself|me)\b", name.to_string()),
        (r"\bI\b", name.to_string()),
    ];

    let mut out = text.to_string();
    for (pattern, replacement) in rules {
        if let Ok(re) = regex_lite::Regex::new(pattern) {
            out = re
                .replace_all(&out, regex_lite::NoExpand(&replacement))
                .into_owned();
        }
    }
    out
}
