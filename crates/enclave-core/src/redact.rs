//! Error sanitization for everything that leaves the enclave.
//!
//! Messages surfaced in execution results and audit events must never carry
//! script source positions, host paths, connection details, credentials, or
//! stack frames. [`sanitize_error_message`] strips those and bounds the length.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum length, in bytes, of a sanitized message.
pub const MAX_ERROR_MESSAGE_BYTES: usize = 512;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[a-z][a-z0-9+.\-]*://[^\s'")\]}>]+"#).unwrap());

static IP_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(:\d+)?\b").unwrap());

static UNIX_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(home|Users|etc|var|tmp|opt|usr|root|mnt|srv|proc|sys|dev|run|boot|snap|nix)(/[\w.\-]+)+").unwrap()
});

/// Relative or absolute paths ending in a file name with an extension.
static FILE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\.{1,2}/|/)(?:[\w.\-]+/)*[\w\-]+\.\w+").unwrap());

static WINDOWS_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z]:\\[\w.\\\-]+").unwrap());

/// Internal script specifiers such as `enclave:script` or `[enclave:harness]`.
static SPECIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[?enclave:[\w\-]+\]?").unwrap());

/// `:12:5` suffixes, `(12:5)` pairs and `line 12 column 5` phrases.
static LINE_COL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?::\d+){1,2}\b|\(\d+:\d+\)|\bline\s+\d+(?:,?\s*col(?:umn)?\s+\d+)?").unwrap()
});

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(Bearer\s+\S+|api_key\s*=\s*\S+|token\s*=\s*\S+|password\s*=\s*\S+|secret\s*=\s*\S+)",
    )
    .unwrap()
});

static AWS_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:AKIA|ABIA|ACCA|ASIA)[0-9A-Z]{16}").unwrap());

static JWT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+").unwrap());

static HEX_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{64,}\b").unwrap());

static STACK_FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(at\s+.+|Caused by:.*|\.{3}\s*\d+\s*more)$").unwrap()
});

/// Sanitize a message for results and audit events.
///
/// Stack frames are dropped, then credentials, URLs, addresses, paths,
/// internal specifiers and line:column references are replaced, and the
/// remaining lines are joined and truncated to [`MAX_ERROR_MESSAGE_BYTES`].
pub fn sanitize_error_message(message: &str) -> String {
    let mut msg = STACK_FRAME_RE.replace_all(message, "").into_owned();

    msg = JWT_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = AWS_KEY_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = CREDENTIAL_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = HEX_TOKEN_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = URL_RE.replace_all(&msg, "[url]").into_owned();
    msg = IP_PORT_RE.replace_all(&msg, "[addr]").into_owned();
    msg = WINDOWS_PATH_RE.replace_all(&msg, "[path]").into_owned();
    msg = UNIX_PATH_RE.replace_all(&msg, "[path]").into_owned();
    msg = FILE_PATH_RE.replace_all(&msg, "[path]").into_owned();
    msg = SPECIFIER_RE.replace_all(&msg, "").into_owned();
    msg = LINE_COL_RE.replace_all(&msg, "").into_owned();

    let joined = msg
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    truncate_to(joined.trim(), MAX_ERROR_MESSAGE_BYTES)
}

/// Prefix a tool failure with the tool name and sanitize the rest.
pub fn sanitize_tool_error(tool: &str, error: &str) -> String {
    sanitize_error_message(&format!("tool '{tool}' failed: {error}"))
}

fn truncate_to(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    const ELLIPSIS: &str = "...";
    let mut end = max - ELLIPSIS.len();
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{ELLIPSIS}", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_line_and_column_references() {
        let result = sanitize_error_message("ReferenceError: x is not defined at script.js:3:14");
        assert!(!result.contains(":3:14"), "{result}");
        assert!(result.contains("x is not defined"), "{result}");
    }

    #[test]
    fn strips_v8_stack_frames() {
        let msg = "Error: boom\n    at __ag_main (enclave:script:4:11)\n    at async enclave:harness:2:22";
        let result = sanitize_error_message(msg);
        assert_eq!(result, "Error: boom");
    }

    #[test]
    fn strips_internal_specifiers() {
        let result = sanitize_error_message("SyntaxError in [enclave:script] near token");
        assert!(!result.contains("enclave:script"), "{result}");
    }

    #[test]
    fn strips_unix_and_relative_paths() {
        let result = sanitize_error_message("cannot open /home/alice/.ssh/id_rsa");
        assert!(!result.contains("alice"), "{result}");
        let result = sanitize_error_message("failed loading ./lib/secret.json");
        assert!(!result.contains("secret.json"), "{result}");
    }

    #[test]
    fn strips_windows_paths() {
        let result = sanitize_error_message(r"missing C:\Users\admin\config.toml");
        assert!(result.contains("[path]"), "{result}");
    }

    #[test]
    fn strips_urls_and_addresses() {
        let result =
            sanitize_error_message("connect https://db.internal:5432/x failed via 10.0.0.7:8080");
        assert!(!result.contains("db.internal"), "{result}");
        assert!(!result.contains("10.0.0.7"), "{result}");
    }

    #[test]
    fn strips_credentials() {
        let result = sanitize_error_message("auth failed: Bearer abc.def and password=hunter2");
        assert!(!result.contains("abc.def"), "{result}");
        assert!(!result.contains("hunter2"), "{result}");
    }

    #[test]
    fn truncates_long_messages_on_char_boundary() {
        let msg = "é".repeat(600);
        let result = sanitize_error_message(&msg);
        assert!(result.len() <= MAX_ERROR_MESSAGE_BYTES);
        assert!(result.ends_with("..."));
    }

    #[test]
    fn preserves_plain_messages() {
        let msg = "expected string, got number for field 'count'";
        assert_eq!(sanitize_error_message(msg), msg);
    }

    #[test]
    fn preserves_dotted_tool_names() {
        let msg = "tool 'files.read' failed: not found";
        assert_eq!(sanitize_error_message(msg), msg);
    }

    #[test]
    fn tool_error_prefix() {
        let result = sanitize_tool_error("x.y", "upstream at /var/run/x.sock");
        assert!(result.starts_with("tool 'x.y' failed:"), "{result}");
        assert!(!result.contains("/var/run"), "{result}");
    }
}
