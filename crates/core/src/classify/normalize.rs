use std::sync::LazyLock;

use regex::Regex;

/// Upper bound on message length kept from an untrusted report.
pub const MAX_MESSAGE_CHARS: usize = 2000;
/// Upper bound on stack / component-stack length.
pub const MAX_STACK_CHARS: usize = 8000;

static ISO_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[?\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?\]?")
        .expect("valid regex")
});

static CLOCK_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\d{1,2}:\d{2}:\d{2}(?:\.\d+)?(?:\s?[AaPp][Mm])?\]").expect("valid regex")
});

static PROGRESS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)%").expect("valid regex"));

/// Prefixes added by transports and consoles rather than by the fault itself.
const TRANSPORT_PREFIXES: &[&str] = &[
    "[preview]",
    "[sandbox]",
    "[vite]",
    "[hmr]",
    "uncaught ",
    "unhandled promise rejection:",
    "console.error:",
    "console.warn:",
];

/// Clean a raw report message: strip embedded log timestamps and transport
/// prefixes, collapse whitespace, cap the length. May return an empty string.
pub fn normalize_message(raw: &str) -> String {
    let without_iso = ISO_TIMESTAMP.replace_all(raw, " ");
    let without_clock = CLOCK_TIMESTAMP.replace_all(&without_iso, " ");
    let collapsed = without_clock.split_whitespace().collect::<Vec<_>>().join(" ");
    let stripped = strip_prefixes(&collapsed);
    truncate_chars(stripped, MAX_MESSAGE_CHARS)
}

fn strip_prefixes(mut s: &str) -> &str {
    loop {
        let before = s;
        for prefix in TRANSPORT_PREFIXES {
            if s.len() >= prefix.len()
                && s.is_char_boundary(prefix.len())
                && s[..prefix.len()].eq_ignore_ascii_case(prefix)
            {
                s = s[prefix.len()..].trim_start();
            }
        }
        if s.len() == before.len() {
            return s;
        }
    }
}

/// First integer immediately preceding a `%`, when it is a valid percentage.
pub fn extract_progress(message: &str) -> Option<u8> {
    let caps = PROGRESS.captures(message)?;
    let value: u32 = caps.get(1)?.as_str().parse().ok()?;
    u8::try_from(value).ok().filter(|v| *v <= 100)
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_iso_and_clock_timestamps() {
        assert_eq!(
            normalize_message("2024-05-01T10:22:13.120Z Cannot read properties of undefined"),
            "Cannot read properties of undefined"
        );
        assert_eq!(
            normalize_message("[10:22:13 PM] build failed [10:22:14]"),
            "build failed"
        );
    }

    #[test]
    fn strips_stacked_transport_prefixes() {
        assert_eq!(normalize_message("[preview] Uncaught TypeError: x is null"), "TypeError: x is null");
        assert_eq!(
            normalize_message("Unhandled Promise Rejection: fetch failed"),
            "fetch failed"
        );
    }

    #[test]
    fn collapses_whitespace_and_can_be_empty() {
        assert_eq!(normalize_message("  a \n\t b  "), "a b");
        assert_eq!(normalize_message("   [preview]   "), "");
    }

    #[test]
    fn caps_length_on_char_boundary() {
        let long = "é".repeat(MAX_MESSAGE_CHARS + 10);
        assert_eq!(normalize_message(&long).chars().count(), MAX_MESSAGE_CHARS);
    }

    #[test]
    fn progress_takes_first_percentage() {
        assert_eq!(extract_progress("bundling 42% (12/30 modules), 80% cached"), Some(42));
        assert_eq!(extract_progress("no progress here"), None);
        assert_eq!(extract_progress("ratio 250%"), None);
        assert_eq!(extract_progress("100% done"), Some(100));
    }
}
