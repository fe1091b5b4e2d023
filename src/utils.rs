//! Shared encoding helpers.
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::error::Result;

/// Encode bytes as unpadded base64url, the alphabet used by JSON Web Keys.
#[must_use]
pub fn b64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode base64url, tolerating trailing padding and the standard alphabet.
pub fn b64url_decode(data: &str) -> Result<Vec<u8>> {
    let normalized = data
        .trim()
        .trim_end_matches('=')
        .replace('+', "-")
        .replace('/', "_");
    Ok(URL_SAFE_NO_PAD.decode(normalized)?)
}

/// Decode standard base64, ignoring surrounding whitespace.
pub fn b64_decode(data: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(data.trim())?)
}

/// Decode UTF-16LE bytes. Returns `None` for odd lengths or invalid surrogates.
#[must_use]
pub fn utf16le_decode(data: &[u8]) -> Option<String> {
    if data.len() % 2 != 0 {
        return None;
    }
    let units = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect::<Vec<u16>>();
    String::from_utf16(&units).ok()
}

/// Encode a string as UTF-16LE bytes.
#[must_use]
pub fn utf16le_encode(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b64url_accepts_padding_and_standard_alphabet() {
        let bytes = [0xfb, 0xff, 0x01];
        let encoded = b64url_encode(&bytes);
        assert_eq!(encoded, "-_8B");
        assert_eq!(b64url_decode("-_8B").expect("decode"), bytes);
        assert_eq!(b64url_decode("+/8B").expect("decode"), bytes);
        assert_eq!(b64url_decode("AQ==").expect("decode"), vec![1]);
    }

    #[test]
    fn utf16le_roundtrip_and_odd_length() {
        let encoded = utf16le_encode("<A>");
        assert_eq!(encoded, vec![b'<', 0, b'A', 0, b'>', 0]);
        assert_eq!(utf16le_decode(&encoded).as_deref(), Some("<A>"));
        assert!(utf16le_decode(&[0x41]).is_none());
    }
}
