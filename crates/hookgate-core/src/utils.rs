use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};

/// Short, stable fingerprint of an access token for logs.
///
/// Raw tokens never go to the log stream.
pub fn token_fingerprint(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    let digest = h.finalize();
    hex_prefix(&digest, 12)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(len);
    for b in bytes {
        if out.len() >= len {
            break;
        }
        let _ = write!(out, "{b:02x}");
    }
    out.truncate(len);
    out
}

/// Calendar day used for usage accounting.
pub fn usage_day_utc() -> NaiveDate {
    Utc::now().date_naive()
}

/// Keep only characters that are safe inside a file name.
pub fn sanitize_file_stem(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_short_and_stable() {
        let a = token_fingerprint("secret-token");
        let b = token_fingerprint("secret-token");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(!a.contains("secret"));
        assert_ne!(a, token_fingerprint("other-token"));
    }

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_file_stem("3EB0ABC"), "3EB0ABC");
        assert_eq!(sanitize_file_stem("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_file_stem(""), "unnamed");
    }
}
