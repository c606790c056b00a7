//! MQTT-style topic filters.
//!
//! A filter is a `/`-separated list of levels. `+` matches exactly one
//! level, `#` matches any remaining levels and must be the last one.

/// Longest topic accepted, in bytes (MQTT limit).
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Check that `filter` is a well-formed subscription filter.
pub fn validate_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("topic must not be empty".to_string());
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err(format!("topic longer than {MAX_TOPIC_LEN} bytes"));
    }
    if filter.contains('\0') {
        return Err("topic must not contain NUL".to_string());
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(format!("'#' must be a whole level at the end of '{filter}'"));
        }
        if level.contains('+') && *level != "+" {
            return Err(format!("'+' must be a whole level in '{filter}'"));
        }
    }
    Ok(())
}

/// Whether a concrete `topic` matches `filter`.
pub fn matches(filter: &str, topic: &str) -> bool {
    // Wildcards at the first level never match `$`-prefixed system topics.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        match level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            exact => match topic_levels.next() {
                Some(t) if t == exact => {}
                _ => return false,
            },
        }
    }
    topic_levels.next().is_none()
}
