//! Topic name and topic filter validation (v3.1.1 section 4.7)

/// Errors from topic validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    /// Topic is empty
    Empty,
    /// Topic name contains a wildcard character
    WildcardInName,
    /// `#` is only allowed as the last level
    MultiWildcardNotLast,
    /// Wildcard character mixed into a level (e.g. `a+` or `a#`)
    WildcardInLevel,
}

impl std::fmt::Display for TopicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "topic is empty"),
            Self::WildcardInName => write!(f, "wildcard in topic name"),
            Self::MultiWildcardNotLast => write!(f, "'#' must be the last level"),
            Self::WildcardInLevel => write!(f, "wildcard must occupy an entire level"),
        }
    }
}

impl std::error::Error for TopicError {}

/// Validate a topic name (PUBLISH / will topic).
/// [MQTT-4.7.3-1] non-empty, [MQTT-4.7.1-1] no wildcards.
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::WildcardInName);
    }
    Ok(())
}

/// Validate a topic filter (SUBSCRIBE / UNSUBSCRIBE).
/// [MQTT-4.7.1-2] `#` only as the last level, [MQTT-4.7.1-3] `+` only as a
/// whole level.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();

        match level {
            "#" => {
                if !is_last {
                    return Err(TopicError::MultiWildcardNotLast);
                }
            }
            "+" => {}
            _ => {
                if level.contains('+') || level.contains('#') {
                    return Err(TopicError::WildcardInLevel);
                }
            }
        }
    }

    Ok(())
}

/// Check whether a concrete topic name matches a topic filter.
/// Used for retained-message lookup at subscribe time.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    // [MQTT-4.7.2-1] wildcards at the root never match $-topics
    if topic.starts_with('$') {
        if let Some(first) = filter_levels.peek() {
            if *first == "+" || *first == "#" {
                return false;
            }
        }
    }

    loop {
        match (topic_levels.next(), filter_levels.next()) {
            // "#" also matches the parent level, so "sport/#" matches "sport"
            (_, Some("#")) => return true,
            (Some(_), Some("+")) => {}
            (Some(t), Some(f)) => {
                if t != f {
                    return false;
                }
            }
            (None, Some(_)) | (Some(_), None) => return false,
            (None, None) => return true,
        }
    }
}
