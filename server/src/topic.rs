//! Topic and filter grammar.
//!
//! Topics are slash-separated paths (`room1/kitchen/sensor1`); filters may
//! additionally contain the MQTT-style wildcards `+` (exactly one path
//! component) and `#` (zero or more trailing components, only at the end).
//! Matching works char-by-char; double slashes are ordinary characters and
//! are not collapsed.

/// Returns true if `topic` is a valid topic name.
///
/// A topic cannot be empty, cannot start or end with `/`, contains only
/// `[A-Za-z0-9_/-]` and no wildcards.
pub fn is_valid_topic(topic: &str) -> bool {
    if topic.is_empty() {
        return false;
    }

    let b = topic.as_bytes();
    if b[0] == b'/' {
        return false;
    }

    if topic.contains('+') || topic.contains('#') {
        return false;
    }

    for (i, &c) in b.iter().enumerate() {
        if !(c.is_ascii_alphanumeric() || matches!(c, b'-' | b'_' | b'/')) {
            return false;
        }

        if i + 1 == b.len() && c == b'/' {
            return false;
        }
    }

    true
}

/// Returns true if `filter` is a valid topic filter.
///
/// A filter must contain at least one wildcard. `#` is only valid as the
/// whole filter or as the final component preceded by `/`. `+` is only
/// valid as a whole component: alone, at the start followed by `/`, between
/// two `/`, or at the end preceded by `/`.
pub fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let b = filter.as_bytes();
    if b[0] == b'/' {
        return false;
    }

    if !filter.contains('+') && !filter.contains('#') {
        return false;
    }

    if let Some(pos) = filter.find('#') {
        if pos + 1 != filter.len() {
            return false;
        }
    }

    for (i, &c) in b.iter().enumerate() {
        if !(c.is_ascii_alphanumeric() || matches!(c, b'-' | b'_' | b'+' | b'#' | b'/')) {
            return false;
        }

        if c == b'+' {
            let starts_component = i == 0 || b[i - 1] == b'/';
            let ends_component = i + 1 == b.len() || b[i + 1] == b'/';
            if !starts_component || !ends_component {
                return false;
            }
        }

        if c == b'#' {
            if b.len() == 1 {
                return true;
            }

            if i == 0 || b[i - 1] != b'/' {
                return false;
            }
        }
    }

    true
}

/// Returns true if the input is either a valid topic or a valid filter.
pub fn is_valid_topic_or_filter(input: &str) -> bool {
    is_valid_topic(input) || is_valid_topic_filter(input)
}

/// Checks whether `filter` matches `topic`.
///
/// `+` matches exactly one path component, `#` at the end matches zero or
/// more trailing components (`a/b/#` also matches the exact topic `a/b`),
/// and a wildcard-free filter matches only by equality.
pub fn is_filter_matched(filter: &str, topic: &str) -> bool {
    let f = filter.as_bytes();
    let t = topic.as_bytes();
    let mut fi = 0usize;
    let mut ti = 0usize;

    while ti < t.len() {
        // Ran out of filter before the topic ended.
        if fi >= f.len() {
            return false;
        }

        // Last topic byte while the filter still has more than one byte left.
        if ti + 1 == t.len() && fi + 1 != f.len() {
            if f[fi] != t[ti] {
                return false;
            }

            // A trailing "/#" also matches the root topic itself:
            // "topic/foo/#" matches "topic/foo".
            if fi + 3 == f.len() && f[fi + 1] == b'/' && f[fi + 2] == b'#' {
                return true;
            }

            return false;
        }

        if f[fi] == t[ti] {
            fi += 1;
            ti += 1;
            continue;
        }

        // A `+` consumes topic bytes up to the end of the current component.
        if f[fi] == b'+' {
            while ti < t.len() && !(ti + 1 < t.len() && t[ti + 1] == b'/') {
                ti += 1;
            }

            if ti == t.len() {
                // Topic ended inside the component; only a match if the
                // filter ends with this `+`.
                return fi + 1 == f.len();
            }

            fi += 1;
            ti += 1;
            continue;
        }

        if f[fi] == b'#' && fi + 1 == f.len() {
            return true;
        }

        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_topics() {
        assert!(is_valid_topic("topic"));
        assert!(is_valid_topic("room1/kitchen/sensor1"));
        assert!(is_valid_topic("a-b_c/d0"));
        // Double slashes are plain characters, not separators to collapse.
        assert!(is_valid_topic("foo//bar"));
    }

    #[test]
    fn invalid_topics() {
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("/leading"));
        assert!(!is_valid_topic("trailing/"));
        assert!(!is_valid_topic("has space"));
        assert!(!is_valid_topic("wild/+"));
        assert!(!is_valid_topic("wild/#"));
        assert!(!is_valid_topic("emoji/😀"));
    }

    #[test]
    fn valid_filters() {
        assert!(is_valid_topic_filter("#"));
        assert!(is_valid_topic_filter("+"));
        assert!(is_valid_topic_filter("a/#"));
        assert!(is_valid_topic_filter("a/+/c"));
        assert!(is_valid_topic_filter("+/test"));
        assert!(is_valid_topic_filter("a/+"));
        assert!(is_valid_topic_filter("a/+/#"));
    }

    #[test]
    fn invalid_filters() {
        assert!(!is_valid_topic_filter(""));
        assert!(!is_valid_topic_filter("/a/#"));
        assert!(!is_valid_topic_filter("plain/topic"));
        assert!(!is_valid_topic_filter("test/+a"));
        assert!(!is_valid_topic_filter("a+/b"));
        assert!(!is_valid_topic_filter("a/#/b"));
        assert!(!is_valid_topic_filter("a#"));
        assert!(!is_valid_topic_filter("#/a"));
    }

    #[test]
    fn topic_and_filter_predicates_are_disjoint() {
        for s in ["topic", "a/b/c", "#", "+", "a/+/#", "foo//bar", "a/+"] {
            assert!(
                !(is_valid_topic(s) && is_valid_topic_filter(s)),
                "{s} classified as both topic and filter"
            );
        }
    }

    #[test]
    fn plus_matches_one_component() {
        assert!(is_filter_matched("+", "foobar"));
        assert!(!is_filter_matched("+", "foobar/baz"));
        assert!(is_filter_matched("room1/+/sensor1", "room1/kitchen/sensor1"));
        assert!(!is_filter_matched("room1/+/sensor1", "room1/kitchen/sensor2"));
        assert!(is_filter_matched("a/+", "a/b"));
        assert!(!is_filter_matched("a/+", "a/b/c"));
    }

    #[test]
    fn hash_matches_trailing_components() {
        assert!(is_filter_matched("a/+/#", "a/x/y/z"));
        assert!(is_filter_matched("topic/foo/#", "topic/foo/bar"));
        // "/#" also matches the root topic itself.
        assert!(is_filter_matched("topic/foo/#", "topic/foo"));
        assert!(!is_filter_matched("topic1/#", "topic2"));
    }

    #[test]
    fn hash_alone_matches_everything() {
        for topic in ["a", "a/b", "room1/kitchen/sensor1", "x/y/z/w"] {
            assert!(is_valid_topic(topic));
            assert!(is_filter_matched("#", topic));
        }
    }

    #[test]
    fn exact_topic_matches_itself() {
        for topic in ["a", "a/b", "room1/kitchen/sensor1"] {
            assert!(is_filter_matched(topic, topic));
        }
        assert!(!is_filter_matched("a/b", "a/c"));
    }
}
