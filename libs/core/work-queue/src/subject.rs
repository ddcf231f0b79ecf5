//! Subject and resource name rules.

use crate::error::QueueError;

const SINGLE_WILDCARD: &str = "*";
const FULL_WILDCARD: &str = ">";

/// Check a stream or durable consumer name.
///
/// Names become tokens of JetStream API subjects, so they may not contain
/// separators, wildcards or whitespace.
pub fn validate_name(kind: &str, name: &str) -> Result<(), QueueError> {
    if name.is_empty() {
        return Err(QueueError::invalid(format!("{kind} name must not be empty")));
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>' | '/' | '\\'))
    {
        return Err(QueueError::invalid(format!(
            "{kind} name '{name}' contains forbidden character {c:?}"
        )));
    }
    Ok(())
}

/// Check a subject that may contain wildcards (stream subjects, filters).
pub fn validate_pattern(subject: &str) -> Result<(), QueueError> {
    if subject.is_empty() {
        return Err(QueueError::invalid("subject must not be empty"));
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(QueueError::invalid(format!(
            "subject '{subject}' contains whitespace"
        )));
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(QueueError::invalid(format!(
                "subject '{subject}' has an empty token"
            )));
        }
        if *token == FULL_WILDCARD && i != last {
            return Err(QueueError::invalid(format!(
                "subject '{subject}' uses '>' before the last token"
            )));
        }
        if token.len() > 1 && (token.contains('*') || token.contains('>')) {
            return Err(QueueError::invalid(format!(
                "subject '{subject}' mixes a wildcard into token '{token}'"
            )));
        }
    }
    Ok(())
}

/// Check a concrete subject a message can be published to.
pub fn validate_publish(subject: &str) -> Result<(), QueueError> {
    validate_pattern(subject)?;
    if subject
        .split('.')
        .any(|t| t == SINGLE_WILDCARD || t == FULL_WILDCARD)
    {
        return Err(QueueError::invalid(format!(
            "cannot publish to wildcard subject '{subject}'"
        )));
    }
    Ok(())
}

/// Whether `subject` (which may itself be a pattern) is covered by `pattern`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(FULL_WILDCARD), Some(_)) => return true,
            (Some(SINGLE_WILDCARD), Some(s)) if s != FULL_WILDCARD => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
