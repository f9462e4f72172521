//! Utility functions for Graham services.

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Works on character boundaries, so CJK and emoji content never splits mid-codepoint.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Strip credentials from a relay address before it is logged.
///
/// `user:pass@10.0.0.1:8080` becomes `***@10.0.0.1:8080`.
pub fn redact_credentials(address: &str) -> String {
    let (scheme, rest) = match address.find("://") {
        Some(idx) => address.split_at(idx + 3),
        None => ("", address),
    };

    match rest.rfind('@') {
        Some(at) => format!("{}***{}", scheme, &rest[at..]),
        None => address.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
        assert_eq!(truncate_with_ellipsis("贵州茅台股份", 2), "贵州...");
        assert_eq!(truncate_with_ellipsis("", 10), "");
    }

    #[test]
    fn test_redact_credentials() {
        assert_eq!(redact_credentials("user:pw@10.0.0.1:8080"), "***@10.0.0.1:8080");
        assert_eq!(
            redact_credentials("socks5://u:p@proxy.local:1080"),
            "socks5://***@proxy.local:1080"
        );
        assert_eq!(redact_credentials("10.0.0.1:8080"), "10.0.0.1:8080");
    }
}
