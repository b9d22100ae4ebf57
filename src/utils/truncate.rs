//! Truncation Utilities
//!
//! Text shortening for log lines and drama messages. Everything here cuts on
//! UTF-8 character boundaries.

/// Longest prefix of `content` that is at most `max_bytes` long.
pub fn prefix(content: &str, max_bytes: usize) -> &str {
    if content.len() <= max_bytes {
        return content;
    }
    let mut end = 0;
    for (idx, c) in content.char_indices() {
        let char_end = idx + c.len_utf8();
        if char_end > max_bytes {
            break;
        }
        end = char_end;
    }
    &content[..end]
}

/// `prefix` followed by `...` when anything was cut.
pub fn excerpt(content: &str, max_bytes: usize) -> String {
    let head = prefix(content, max_bytes);
    if head.len() == content.len() {
        head.to_string()
    } else {
        format!("{}...", head)
    }
}

/// Keep both ends of a long text, eliding the middle.
pub fn truncate_middle(content: &str, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content.to_string();
    }

    if max_bytes == 0 {
        return format!("... [{} chars truncated] ...", content.len());
    }

    let half = max_bytes / 2;
    let prefix_end = prefix(content, half).len();

    let suffix_target = content.len().saturating_sub(half);
    let mut suffix_start = content.len();
    for (idx, _) in content.char_indices().rev() {
        if idx >= suffix_target {
            suffix_start = idx;
        } else {
            break;
        }
    }
    if suffix_start < prefix_end {
        suffix_start = prefix_end;
    }

    let head = &content[..prefix_end];
    let tail = &content[suffix_start..];
    let truncated_count = content.len() - (head.len() + tail.len());

    format!("{} ... [{} chars truncated] ... {}", head, truncated_count, tail)
}
