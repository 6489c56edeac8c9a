//! Script-content guard for world-executed macro commands.
//!
//! A pure predicate over the raw command text. The dispatcher rejects a
//! macro creation before any envelope is sent when the command touches
//! browser storage or dynamic evaluation.

/// Substrings that disqualify a macro command.
const FORBIDDEN_PATTERNS: &[&str] = &["localStorage", "sessionStorage", "eval("];

/// Error message returned to REST callers on rejection.
pub const FORBIDDEN_SCRIPT_ERROR: &str = "Script contains forbidden patterns";

/// Remediation hint returned alongside the error.
pub const FORBIDDEN_SCRIPT_SUGGESTION: &str =
    "Ensure the script does not access localStorage, sessionStorage, or eval()";

/// Returns the first forbidden pattern found in `command`, or `None` when
/// the command is clean.
pub fn forbidden_pattern(command: &str) -> Option<&'static str> {
    FORBIDDEN_PATTERNS
        .iter()
        .find(|pattern| command.contains(*pattern))
        .copied()
}
