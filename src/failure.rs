/// Non-resumable failure detection: scan the tail of an attempt's output for
/// errors that no amount of restarting can fix.
///
/// Looks for patterns like:
/// - `pull model manifest: file does not exist`
/// - `invalid model name`
/// - `401`/`unauthorized`, `permission denied`
/// - `no space left on device`
use regex::Regex;
use std::sync::LazyLock;

/// Compiled patterns for non-resumable errors.
static NON_RESUMABLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)file does not exist").unwrap(),
        Regex::new(r"(?i)invalid model name").unwrap(),
        Regex::new(r"(?i)model .* not found").unwrap(),
        Regex::new(r"(?i)manifest unknown").unwrap(),
        Regex::new(r"(?i)unauthorized|authentication required").unwrap(),
        Regex::new(r"(?i)permission denied").unwrap(),
        Regex::new(r"(?i)no space left on device").unwrap(),
    ]
});

/// Check output text for a non-resumable error.
///
/// Returns the first matching line, trimmed, so it can be reported.
pub fn detect_non_resumable<'a, I>(lines: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    for line in lines {
        for pattern in NON_RESUMABLE_PATTERNS.iter() {
            if pattern.is_match(line) {
                tracing::debug!(pattern = %pattern, line, "non-resumable pattern matched");
                return Some(line.trim().to_string());
            }
        }
    }
    None
}
