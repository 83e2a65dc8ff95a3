//! Allow-list validation for client supplied strings.
//!
//! Every check rejects NUL bytes and the parent-directory token `..` before
//! looking at the character set.

/// Kind of input being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Portal username: `[A-Za-z0-9_-]{1,64}`.
    Username,
    /// Portal key: `[A-Za-z0-9._:/?#@!$&'()*+,;=-]{12,64}`.
    Key,
    /// Request path (raw, as sent on the wire).
    Path,
    /// Request host: dot separated DNS labels, lower case.
    Host,
}

const KEY_PUNCTUATION: &str = "._:/?#@!$&'()*+,;=-";
const PATH_PUNCTUATION: &str = "._~:/?#[]@!$&'()*+,;=-";

/// Validate `input` against the allow-list for `kind`.
pub fn validate_input(input: &str, kind: InputKind) -> bool {
    if input.contains('\0') || input.contains("..") {
        return false;
    }

    match kind {
        InputKind::Username => {
            (1..=64).contains(&input.len())
                && input
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        InputKind::Key => {
            (12..=64).contains(&input.len())
                && input
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || KEY_PUNCTUATION.contains(c))
        }
        InputKind::Path => valid_path(input),
        InputKind::Host => valid_host(input),
    }
}

fn valid_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'%' {
            // Only well formed escapes, and never ones that decode to a NUL,
            // a dot or a slash (encoded traversal).
            let Some(decoded) = decode_escape(bytes.get(i + 1..i + 3)) else {
                return false;
            };
            if matches!(decoded, 0 | b'.' | b'/' | b'\\') {
                return false;
            }
            i += 3;
            continue;
        }
        let ok = c.is_ascii_alphanumeric()
            || c == b' '
            || c == b'\t'
            || PATH_PUNCTUATION.as_bytes().contains(&c);
        if !ok {
            return false;
        }
        i += 1;
    }
    true
}

fn decode_escape(hex: Option<&[u8]>) -> Option<u8> {
    let hex = hex?;
    if !hex.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()
}

fn valid_host(host: &str) -> bool {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    labels.iter().all(|label| {
        let bytes = label.as_bytes();
        (1..=63).contains(&bytes.len())
            && bytes
                .iter()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
            && bytes.first() != Some(&b'-')
            && bytes.last() != Some(&b'-')
    })
}
