/// Validate a pod name: DNS-safe label, lowercase alphanumeric plus hyphens,
/// 2-63 characters, no leading/trailing hyphen.
pub fn is_valid_pod_name(name: &str) -> bool {
    name.len() >= 2
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// Validate a single stream path segment: alphanumeric plus `-` and `_`.
/// The literal `.config` segment is allowed (system streams); any other
/// dotted segment is not.
pub fn is_valid_stream_segment(segment: &str) -> bool {
    if segment == ".config" {
        return true;
    }
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validate a full stream path (slash-joined segments). `.config` may only
/// appear as the first segment.
pub fn is_valid_stream_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    let mut segments = path.split('/');
    match segments.next() {
        Some(first) if is_valid_stream_segment(first) => {}
        _ => return false,
    }
    segments.all(|s| s != ".config" && is_valid_stream_segment(s))
}

/// Validate a record name: letters, digits, `-`, `_` and `.`, but a name
/// cannot start or end with a dot.
pub fn is_valid_record_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.')
        && !name.ends_with('.')
}

/// True when the stream path addresses a `.config/*` system stream.
pub fn is_system_stream_path(path: &str) -> bool {
    path == ".config" || path.starts_with(".config/")
}

/// Split a URL path into normalized segments, rejecting empty segments
/// (`//`), `.` and `..`.
pub fn split_path(path: &str) -> Option<Vec<&str>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments
        .iter()
        .any(|s| s.is_empty() || *s == "." || *s == "..")
    {
        return None;
    }
    Some(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_names() {
        assert!(is_valid_pod_name("alice"));
        assert!(is_valid_pod_name("my-pod-2"));
        assert!(!is_valid_pod_name("a"));
        assert!(!is_valid_pod_name("Alice"));
        assert!(!is_valid_pod_name("-alice"));
        assert!(!is_valid_pod_name("alice-"));
        assert!(!is_valid_pod_name("al_ice"));
        assert!(!is_valid_pod_name(&"a".repeat(64)));
    }

    #[test]
    fn test_stream_segments() {
        assert!(is_valid_stream_segment("blog"));
        assert!(is_valid_stream_segment("my_stream-2"));
        assert!(is_valid_stream_segment(".config"));
        assert!(!is_valid_stream_segment(".meta"));
        assert!(!is_valid_stream_segment("has.dot"));
        assert!(!is_valid_stream_segment(""));
    }

    #[test]
    fn test_stream_paths() {
        assert!(is_valid_stream_path("blog/posts"));
        assert!(is_valid_stream_path(".config/owner"));
        assert!(!is_valid_stream_path("blog/.config"));
        assert!(!is_valid_stream_path(""));
        assert!(!is_valid_stream_path("blog/po.sts"));
    }

    #[test]
    fn test_record_names() {
        assert!(is_valid_record_name("first"));
        assert!(is_valid_record_name("photo.png"));
        assert!(is_valid_record_name("a_b-c.d"));
        assert!(!is_valid_record_name(".hidden"));
        assert!(!is_valid_record_name("trailing."));
        assert!(!is_valid_record_name("no/slash"));
        assert!(!is_valid_record_name(""));
    }

    #[test]
    fn test_system_stream_detection() {
        assert!(is_system_stream_path(".config"));
        assert!(is_system_stream_path(".config/owner"));
        assert!(!is_system_stream_path("blog/.config"));
        assert!(!is_system_stream_path("blog"));
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/a/b/c"), Some(vec!["a", "b", "c"]));
        assert_eq!(split_path("a"), Some(vec!["a"]));
        assert_eq!(split_path("/"), None);
        assert_eq!(split_path("a//b"), None);
        assert_eq!(split_path("a/../b"), None);
    }
}
