//! The key/value payload format carried on every queue.
//!
//! Payloads are `key=value` lines terminated by a blank line, optionally
//! encrypted with AES-256 in ECB mode (wire compatibility with existing
//! submitters) and always base64 transport-encoded.

use std::collections::BTreeMap;

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

const BLOCK_SIZE: usize = 16;

/// Length the pre-shared secret is truncated/zero-padded to.
pub const KEY_LEN: usize = 32;

/// Decode failures, per error policy distinguished from job-level errors.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Not a parseable payload: bad transport encoding or a line without `=`.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    /// Ciphertext length is not a multiple of the AES block size.
    #[error("decryption failed: {0} bytes is not a multiple of the block size")]
    DecryptionFailed(usize),
}

/// Derive the fixed-size AES key from the configured secret.
pub fn derive_key(secret: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    let raw = secret.as_bytes();
    let n = raw.len().min(KEY_LEN);
    key[..n].copy_from_slice(&raw[..n]);
    key
}

/// Encoder/decoder for queue payloads.
///
/// With a key the payload is AES-256-ECB encrypted before transport
/// encoding; without one it is base64 only.
pub struct Codec {
    cipher: Option<Aes256>,
}

impl Codec {
    /// Build a codec. `secret` of `None` disables encryption.
    pub fn new(secret: Option<&str>) -> Self {
        let cipher = secret.map(|s| {
            let key = derive_key(s);
            Aes256::new(GenericArray::from_slice(&key))
        });
        Self { cipher }
    }

    /// Serialise `fields` into a transport-encoded payload.
    ///
    /// Entries are emitted in lexicographic key order so identical maps
    /// produce identical bytes.
    pub fn encode(&self, fields: &BTreeMap<String, String>) -> String {
        let mut text = String::new();
        for (key, value) in fields {
            text.push_str(key);
            text.push('=');
            text.push_str(&escape(value));
            text.push('\n');
        }
        text.push('\n');

        let bytes = match &self.cipher {
            Some(cipher) => encrypt(cipher, text.as_bytes()),
            None => text.into_bytes(),
        };
        B64.encode(bytes)
    }

    /// Parse a transport-encoded payload back into a field map.
    pub fn decode(&self, payload: &[u8]) -> Result<BTreeMap<String, String>, EnvelopeError> {
        let raw = B64
            .decode(trim_ascii(payload))
            .map_err(|err| EnvelopeError::MalformedEnvelope(format!("invalid transport encoding: {err}")))?;

        let plain = match &self.cipher {
            Some(cipher) => {
                if raw.len() % BLOCK_SIZE != 0 {
                    return Err(EnvelopeError::DecryptionFailed(raw.len()));
                }
                decrypt(cipher, &raw)
            }
            None => raw,
        };

        // Zero padding from the cipher layer is not payload.
        let end = plain.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
        let text = String::from_utf8_lossy(&plain[..end]);

        let mut fields = BTreeMap::new();
        for line in text.split('\n') {
            if line.is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(EnvelopeError::MalformedEnvelope(format!("line without '=': {line:?}")));
            };
            fields.insert(key.to_ascii_lowercase(), unescape(value));
        }
        Ok(fields)
    }
}

fn encrypt(cipher: &Aes256, plain: &[u8]) -> Vec<u8> {
    let mut buf = plain.to_vec();
    let padded = buf.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    buf.resize(padded, 0);
    for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    buf
}

fn decrypt(cipher: &Aes256, raw: &[u8]) -> Vec<u8> {
    let mut buf = raw.to_vec();
    for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    buf
}

fn trim_ascii(payload: &[u8]) -> &[u8] {
    let start = payload.iter().position(|b| !b.is_ascii_whitespace());
    let end = payload.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => &payload[s..=e],
        _ => &[],
    }
}

/// Escape embedded newlines and backslashes so values stay single-line.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    fn sample() -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("type".to_string(), "service".to_string());
        m.insert("host_name".to_string(), "h1".to_string());
        m.insert("service_description".to_string(), "cpu".to_string());
        m.insert("command_line".to_string(), "/bin/echo OK".to_string());
        m
    }

    #[test]
    fn round_trip_plain() {
        let codec = Codec::new(None);
        let fields = sample();
        let decoded = codec.decode(codec.encode(&fields).as_bytes()).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn round_trip_encrypted() {
        let key = "A".repeat(32);
        let codec = Codec::new(Some(&key));
        let fields = sample();
        let decoded = codec.decode(codec.encode(&fields).as_bytes()).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn round_trip_escaped_values() {
        let codec = Codec::new(Some("secret"));
        let mut fields = BTreeMap::new();
        fields.insert("output".to_string(), "line one\nline two\\with backslash".to_string());
        fields.insert("empty".to_string(), String::new());
        let decoded = codec.decode(codec.encode(&fields).as_bytes()).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn plaintext_ends_with_blank_line() {
        let codec = Codec::new(None);
        let encoded = codec.encode(&sample());
        let raw = B64.decode(encoded.as_bytes()).unwrap();
        assert!(raw.ends_with(b"\n\n"));
        assert!(!raw.ends_with(b"\n\n\n"));
    }

    #[test]
    fn entries_are_ordered_by_key() {
        let codec = Codec::new(None);
        let raw = B64.decode(codec.encode(&sample()).as_bytes()).unwrap();
        let text = String::from_utf8(raw).unwrap();
        let keys: Vec<&str> = text
            .lines()
            .take_while(|l| !l.is_empty())
            .map(|l| l.split_once('=').unwrap().0)
            .collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn keys_are_lowercased() {
        let codec = Codec::new(None);
        let payload = B64.encode(b"HOST_NAME=h1\nType=host\n\n");
        let fields = codec.decode(payload.as_bytes()).unwrap();
        assert_eq!(fields.get("host_name").map(String::as_str), Some("h1"));
        assert_eq!(fields.get("type").map(String::as_str), Some("host"));
    }

    #[test]
    fn content_after_terminator_is_ignored() {
        let codec = Codec::new(None);
        let payload = B64.encode(b"a=1\n\nnot a field line\n");
        let fields = codec.decode(payload.as_bytes()).unwrap();
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn line_without_separator_is_malformed() {
        let codec = Codec::new(None);
        let payload = B64.encode(b"a=1\nbroken line\n\n");
        let err = codec.decode(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, EnvelopeError::MalformedEnvelope(_)));
    }

    #[test]
    fn bad_transport_encoding_is_malformed() {
        let codec = Codec::new(None);
        let err = codec.decode(b"%%% not base64 %%%").unwrap_err();
        assert!(matches!(err, EnvelopeError::MalformedEnvelope(_)));
    }

    #[test]
    fn truncated_ciphertext_fails_decryption() {
        let codec = Codec::new(Some("secret"));
        let payload = B64.encode(b"short");
        let err = codec.decode(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, EnvelopeError::DecryptionFailed(5)));
    }

    #[test]
    fn key_is_truncated_and_zero_padded() {
        let long = derive_key(&"x".repeat(64));
        assert_eq!(long, [b'x'; 32]);

        let short = derive_key("abc");
        assert_eq!(&short[..3], b"abc");
        assert!(short[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn wrong_key_does_not_round_trip() {
        let enc = Codec::new(Some("secret"));
        let dec = Codec::new(Some("other"));
        let fields = sample();
        assert_ne!(dec.decode(enc.encode(&fields).as_bytes()).ok(), Some(fields));
    }
}
