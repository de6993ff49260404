// SPDX-License-Identifier: MPL-2.0

use super::parser::ParseError;

const SHARE_PREFIX: &str = "$share/";

/// Topic names used in PUBLISH must not carry wildcards.
pub fn validate_topic_name(topic: &str) -> Result<(), ParseError> {
    if topic.is_empty() {
        return Err(ParseError::ParseError("Topic name cannot be empty".to_string()));
    }
    if topic.len() > u16::MAX as usize {
        return Err(ParseError::StringTooLong);
    }
    if topic.contains(['+', '#']) {
        return Err(ParseError::ParseError(
            "Topic name must not contain wildcards".to_string(),
        ));
    }
    Ok(())
}

/// Validates MQTT topic filter syntax, including the `$share/{group}/{filter}` form.
pub fn validate_topic_filter(topic_filter: &str) -> Result<(), ParseError> {
    if topic_filter.is_empty() {
        return Err(ParseError::ParseError(
            "Topic filter cannot be empty".to_string(),
        ));
    }
    if topic_filter.len() > u16::MAX as usize {
        return Err(ParseError::StringTooLong);
    }

    let filter = match topic_filter.strip_prefix(SHARE_PREFIX) {
        Some(rest) => {
            let (group, inner) = rest.split_once('/').ok_or_else(|| {
                ParseError::ParseError("Shared subscription without a filter".to_string())
            })?;
            if group.is_empty() || group.contains(['+', '#']) {
                return Err(ParseError::ParseError(
                    "Invalid shared subscription group".to_string(),
                ));
            }
            if inner.is_empty() {
                return Err(ParseError::ParseError(
                    "Shared subscription without a filter".to_string(),
                ));
            }
            inner
        }
        None => topic_filter,
    };

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(ParseError::ParseError(
                "Multi-level wildcard (#) must occupy the whole last level".to_string(),
            ));
        }
        if level.contains('+') && *level != "+" {
            return Err(ParseError::ParseError(
                "Single-level wildcard (+) must occupy a whole level".to_string(),
            ));
        }
    }
    Ok(())
}

/// Matches a topic name against a filter. Shared subscription prefixes are
/// stripped, and names starting with `$` are not matched by a leading wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter = match filter.strip_prefix(SHARE_PREFIX) {
        Some(rest) => match rest.split_once('/') {
            Some((_, inner)) => inner,
            None => return false,
        },
        None => filter,
    };

    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
