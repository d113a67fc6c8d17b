// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT topic filter matching.
//!
//! `+` matches exactly one level, `#` matches the remaining levels (including
//! none). A `$share/<group>/` prefix on a filter is ignored for matching.

const SHARED_PREFIX: &str = "$share/";

/// Check whether any of the route filters matches the incoming topic.
pub fn matches_any<S: AsRef<str>>(filters: &[S], topic: &str) -> bool {
    filters.iter().any(|f| matches(f.as_ref(), topic))
}

/// Check whether a single topic filter matches the incoming topic.
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter = strip_shared(filter);
    if filter == topic {
        return true;
    }

    let mut levels = filter.split('/');
    let mut segments = topic.split('/');

    loop {
        match (levels.next(), segments.next()) {
            (Some("#"), _) => return true,
            (Some(level), Some(segment)) => {
                if level != "+" && level != segment {
                    return false;
                }
            }
            (None, None) => return true,
            (Some(_), None) | (None, Some(_)) => return false,
        }
    }
}

/// Remove a shared subscription prefix (`$share/<group>/`) from a filter.
pub fn strip_shared(filter: &str) -> &str {
    match filter.strip_prefix(SHARED_PREFIX) {
        Some(rest) => match rest.find('/') {
            Some(pos) => &rest[pos + 1..],
            None => "",
        },
        None => filter,
    }
}

/// Check whether a filter contains wildcards.
pub fn is_wildcard(filter: &str) -> bool {
    strip_shared(filter)
        .split('/')
        .any(|level| level == "+" || level == "#")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(matches_any(&["in"], "in"));
        assert!(!matches_any(&["in"], "out"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches_any(&["input/+/something"], "input/value/something"));
        assert!(!matches_any(
            &["input/+/something"],
            "input/value/something/else"
        ));
        assert!(matches_any(&["input/+/+/+"], "input/one/two/three"));
        assert!(!matches_any(&["input/+/+/+"], "input/one/two"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches_any(
            &["input/+/something/#"],
            "input/value/something/else"
        ));
        assert!(matches("a/#", "a"));
        assert!(matches("a/#", "a/b/c/d"));
        assert!(!matches("a/#", "b/c"));
    }

    #[test]
    fn test_empty_topic_and_filter() {
        assert!(matches("", ""));
        assert!(!matches("", "a"));
        assert!(matches("#", ""));
        assert!(matches("#", "anything/at/all"));
        assert!(!matches("a", ""));
    }

    #[test]
    fn test_empty_levels() {
        assert!(matches("te/+/+/+/+", "te/device/main//"));
        assert!(matches("te/device/main///m/+", "te/device/main///m/env"));
        assert!(!matches("te/device/main///m/+", "te/device/child///m/env"));
    }

    #[test]
    fn test_shared_subscription() {
        assert_eq!(strip_shared("$share/group/a/b"), "a/b");
        assert_eq!(strip_shared("a/b"), "a/b");
        assert!(matches("$share/mappers/sensors/+", "sensors/temp"));
        assert!(!matches("$share/mappers/sensors/+", "mappers/sensors"));
    }

    #[test]
    fn test_any_of_filters() {
        let filters = vec!["a/b".to_string(), "c/+".to_string()];
        assert!(matches_any(&filters, "c/d"));
        assert!(matches_any(&filters, "a/b"));
        assert!(!matches_any(&filters, "a/c"));
        assert!(!matches_any::<String>(&[], "a/b"));
    }

    #[test]
    fn test_is_wildcard() {
        assert!(is_wildcard("a/+/b"));
        assert!(is_wildcard("$share/g/#"));
        assert!(!is_wildcard("a/b+c"));
    }
}
