// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scrubbing for text that is about to cross into a client-facing error
//! frame: the caller's home directory is tilde-prefixed and substrings that
//! look like a credential assignment are replaced with a placeholder.

const REDACTED: &str = "***";

/// Replaces a leading `$HOME` prefix with `~`, the same shorthand a shell
/// would print. Falls back to `text` unchanged when `HOME` is unset or isn't
/// actually a prefix of `text`.
pub fn tilde_home(text: &str) -> String {
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() && text.starts_with(&home) => {
            format!("~{}", &text[home.len()..])
        }
        _ => text.to_string(),
    }
}

/// Finds `key` case-insensitively and replaces whatever non-whitespace token
/// follows its `=`/`:`/whitespace separator with [`REDACTED`]. Assumes ASCII
/// text, which is what subprocess stderr and our own error messages are.
fn redact_key(text: &str, key: &str) -> String {
    let lower = text.to_lowercase();
    let key_lower = key.to_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0usize;

    while let Some(found) = lower[pos..].find(&key_lower) {
        let key_start = pos + found;
        let key_end = key_start + key.len();
        out.push_str(&text[pos..key_end]);

        let after = &text[key_end..];
        let sep_len = after.chars().take_while(|c| *c == '=' || *c == ':' || c.is_whitespace()).count();
        out.push_str(&after[..sep_len]);

        let value = &after[sep_len..];
        let value_len = value.chars().take_while(|c| !c.is_whitespace()).count();
        if value_len > 0 {
            out.push_str(REDACTED);
        }

        pos = key_end + sep_len + value_len;
    }
    out.push_str(&text[pos..]);
    out
}

/// Scrubs substrings that look like a `password=`, `token:`, `secret=`, or
/// `Bearer ` credential out of free-form text before it reaches a
/// client-facing error detail.
pub fn redact_secrets(text: &str) -> String {
    let mut scrubbed = redact_key(text, "password");
    scrubbed = redact_key(&scrubbed, "token");
    scrubbed = redact_key(&scrubbed, "secret");
    scrubbed = redact_key(&scrubbed, "bearer");
    scrubbed
}

/// Applies both scrubs: home-path tilde-prefixing, then secret redaction.
pub fn sanitize(text: &str) -> String {
    redact_secrets(&tilde_home(text))
}
