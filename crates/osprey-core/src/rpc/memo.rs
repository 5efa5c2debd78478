//! Shielded memo codec.
//!
//! The node reports memos as hex of the fixed 512-byte memo field. Text
//! memos are UTF-8 padded with NUL bytes; a leading `0xF6` marks "no memo".

use crate::error::CoreError;

/// Maximum memo length on the wire.
pub const MAX_MEMO_BYTES: usize = 512;

/// Marker byte for an intentionally empty memo field.
const NO_MEMO_MARKER: u8 = 0xF6;

/// Decode a hex memo field into text. Returns `Ok(None)` for an absent or
/// empty memo; fails on non-UTF-8 content (arbitrary-data memos are not
/// payment metadata and are surfaced as an error for the caller to log).
pub fn decode_memo(memo_hex: &str) -> Result<Option<String>, CoreError> {
    let bytes = hex::decode(memo_hex)
        .map_err(|e| CoreError::InvalidData(format!("memo is not valid hex: {e}")))?;
    if bytes.len() > MAX_MEMO_BYTES {
        return Err(CoreError::InvalidData(format!(
            "memo is {} bytes; maximum is {MAX_MEMO_BYTES}",
            bytes.len()
        )));
    }

    if bytes.first() == Some(&NO_MEMO_MARKER) && bytes[1..].iter().all(|&b| b == 0) {
        return Ok(None);
    }

    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    if end == 0 {
        return Ok(None);
    }

    String::from_utf8(bytes[..end].to_vec())
        .map(Some)
        .map_err(|_| CoreError::InvalidData("memo is not valid UTF-8".into()))
}

/// Encode memo text as hex for the wire. Rejects memos over the 512-byte
/// limit at encode time rather than letting the node truncate.
pub fn encode_memo(text: &str) -> Result<String, CoreError> {
    if text.len() > MAX_MEMO_BYTES {
        return Err(CoreError::InvalidData(format!(
            "memo is {} bytes; maximum is {MAX_MEMO_BYTES}",
            text.len()
        )));
    }
    Ok(hex::encode(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_text() {
        let encoded = encode_memo("order-42").expect("must encode");
        assert_eq!(decode_memo(&encoded).expect("must decode"), Some("order-42".into()));
    }

    #[test]
    fn strips_trailing_nul_padding() {
        let mut hex_memo = hex::encode("invoice #7");
        hex_memo.push_str(&"00".repeat(20));
        assert_eq!(
            decode_memo(&hex_memo).expect("must decode"),
            Some("invoice #7".into())
        );
    }

    #[test]
    fn no_memo_marker_decodes_to_none() {
        let mut bytes = vec![0xF6];
        bytes.extend(std::iter::repeat(0u8).take(511));
        assert_eq!(decode_memo(&hex::encode(bytes)).expect("must decode"), None);
    }

    #[test]
    fn all_zero_field_decodes_to_none() {
        assert_eq!(decode_memo(&"00".repeat(512)).expect("must decode"), None);
        assert_eq!(decode_memo("").expect("must decode"), None);
    }

    #[test]
    fn boundary_512_accepted_513_rejected() {
        let exactly = "m".repeat(MAX_MEMO_BYTES);
        let encoded = encode_memo(&exactly).expect("512 bytes must encode");
        assert_eq!(decode_memo(&encoded).expect("must decode"), Some(exactly));

        let over = "m".repeat(MAX_MEMO_BYTES + 1);
        assert!(encode_memo(&over).is_err());
        assert!(decode_memo(&hex::encode(over.as_bytes())).is_err());
    }

    #[test]
    fn rejects_non_utf8_and_non_hex() {
        assert!(decode_memo("ff").is_err());
        assert!(decode_memo("zz").is_err());
    }
}
