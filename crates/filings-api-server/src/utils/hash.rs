use sha2::{Digest, Sha256};

/// Normalize `\r\n` and lone `\r` to `\n` so the same text hashed on
/// different platforms produces the same digest.
pub fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\r' {
            if chars.peek() == Some(&'\n') {
                chars.next();
            }
            out.push('\n');
        } else {
            out.push(c);
        }
    }

    out
}

/// Content hash used as the upsert change-detection key:
/// SHA-256 over the UTF-8 bytes of the line-ending-normalized text, hex encoded.
pub fn chunk_hash(text: &str) -> String {
    let normalized = normalize_line_endings(text);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_crlf_and_cr() {
        assert_eq!(normalize_line_endings("a\r\nb"), "a\nb");
        assert_eq!(normalize_line_endings("a\rb"), "a\nb");
        assert_eq!(normalize_line_endings("a\nb"), "a\nb");
        assert_eq!(normalize_line_endings("a\r\r\nb"), "a\n\nb");
    }

    #[test]
    fn test_hash_is_line_ending_invariant() {
        assert_eq!(chunk_hash("line one\r\nline two"), chunk_hash("line one\nline two"));
        assert_eq!(chunk_hash("line one\rline two"), chunk_hash("line one\nline two"));
    }

    #[test]
    fn test_hash_differs_on_content_change() {
        assert_ne!(chunk_hash("revenue grew 4%"), chunk_hash("revenue grew 5%"));
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let digest = chunk_hash("");
        assert_eq!(digest.len(), 64);
        // SHA-256 of the empty string is a well-known constant.
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
