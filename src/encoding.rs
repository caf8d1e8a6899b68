//! Reversible encoding of arbitrary key/value bytes into backend-safe tokens.
//!
//! [`encode`]/[`decode`] are plain padded base64 and are shared by the cache
//! adapters. The document store cannot carry `/` or `+` inside document ids,
//! so [`url_safe_encode`]/[`url_safe_decode`] swap them for `~` and `-`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::Result;

#[allow(missing_docs)]
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

#[allow(missing_docs)]
pub fn decode(token: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(token)?)
}

/// Base64 with `/` replaced by `~` and `+` replaced by `-`.
pub fn url_safe_encode(data: &[u8]) -> String {
    STANDARD
        .encode(data)
        .chars()
        .map(|c| match c {
            '/' => '~',
            '+' => '-',
            other => other,
        })
        .collect()
}

/// Inverse of [`url_safe_encode`].
pub fn url_safe_decode(token: &str) -> Result<Vec<u8>> {
    let restored: String = token
        .chars()
        .map(|c| match c {
            '~' => '/',
            '-' => '+',
            other => other,
        })
        .collect();
    decode(&restored)
}

/// Copy into a buffer reserved with `try_reserve_exact`; an oversized value
/// surfaces as an allocation error instead of aborting.
pub(crate) fn owned_copy(data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(data.len())?;
    buf.extend_from_slice(data);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_spaces_and_binary() {
        let key = b"order 17\x00\xff";
        let token = encode(key);
        assert!(!token.contains(' '));
        assert_eq!(decode(&token).unwrap(), key.to_vec());
    }

    #[test]
    fn url_safe_variant_never_emits_slash_or_plus() {
        // 0xfb 0xff 0xbf encodes to "+/+/" in standard base64
        let data = [0xfbu8, 0xff, 0xbf, 0xfb, 0xff, 0xbf];
        assert_eq!(encode(&data), "+/+/+/+/");

        let token = url_safe_encode(&data);
        assert_eq!(token, "-~-~-~-~");
        assert_eq!(url_safe_decode(&token).unwrap(), data.to_vec());
    }

    #[test]
    fn generic_encoding_is_untouched_by_url_substitution() {
        let data = [0xfbu8, 0xff, 0xbf];
        assert_eq!(encode(&data), "+/+/");
        assert!(decode("-~-~").is_err());
    }

    #[test]
    fn empty_input() {
        assert_eq!(encode(b""), "");
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
        assert_eq!(url_safe_encode(b""), "");
    }
}
