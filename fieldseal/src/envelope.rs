//! Storage format of an encrypted field.
//!
//! An envelope carries everything needed for decryption except the key:
//! - Key version label
//! - Nonce
//! - Ciphertext
//! - Authentication tag
//!
//! It is stored as a single text value:
//!
//! ```text
//! fs1:<version_label>:<base64(nonce)>:<base64(ciphertext || tag)>
//! ```

use crate::error::Error;
use crate::key_registry::validate_label;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Format tag written in front of every envelope.
pub const FORMAT_TAG: &str = "fs1";

/// AES-GCM nonce size (96 bits).
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size (128 bits).
pub const TAG_SIZE: usize = 16;

const SEPARATOR: char = ':';

/// Versioned container for one encrypted value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    version_label: String,
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
    tag: [u8; TAG_SIZE],
}

impl Envelope {
    /// Creates an envelope from its parts.
    #[must_use]
    pub fn new(
        version_label: impl Into<String>,
        nonce: [u8; NONCE_SIZE],
        ciphertext: Vec<u8>,
        tag: [u8; TAG_SIZE],
    ) -> Self {
        Self { version_label: version_label.into(), nonce, ciphertext, tag }
    }

    /// Returns the key version label.
    #[must_use]
    pub fn version_label(&self) -> &str {
        &self.version_label
    }

    /// Returns the nonce.
    #[must_use]
    pub const fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// Returns the ciphertext without the tag.
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Returns the authentication tag.
    #[must_use]
    pub const fn tag(&self) -> &[u8; TAG_SIZE] {
        &self.tag
    }

    /// Ciphertext followed by the tag, as AES-GCM consumes it.
    #[must_use]
    pub fn sealed_bytes(&self) -> Vec<u8> {
        let mut sealed = Vec::with_capacity(self.ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(&self.ciphertext);
        sealed.extend_from_slice(&self.tag);
        sealed
    }

    /// Serializes the envelope to its storage text.
    #[must_use]
    pub fn serialize(&self) -> String {
        format!(
            "{FORMAT_TAG}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.version_label,
            STANDARD.encode(self.nonce),
            STANDARD.encode(self.sealed_bytes())
        )
    }

    /// Parses storage text into an envelope.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedEnvelope` if:
    /// - The format tag is missing or unknown
    /// - The field count is wrong
    /// - The label is invalid
    /// - A field is not valid base64
    /// - The nonce or ciphertext has the wrong length
    pub fn parse(stored: &str) -> Result<Self, Error> {
        let mut fields = stored.split(SEPARATOR);
        let (Some(tag), Some(label), Some(nonce), Some(sealed), None) =
            (fields.next(), fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(Error::MalformedEnvelope("expected 4 fields".to_string()));
        };

        if tag != FORMAT_TAG {
            return Err(Error::MalformedEnvelope("unknown format tag".to_string()));
        }

        validate_label(label)
            .map_err(|_| Error::MalformedEnvelope("invalid version label".to_string()))?;

        let nonce = STANDARD
            .decode(nonce)
            .map_err(|_| Error::MalformedEnvelope("nonce is not base64".to_string()))?;
        let nonce: [u8; NONCE_SIZE] = nonce.try_into().map_err(|v: Vec<u8>| {
            Error::MalformedEnvelope(format!("nonce is {} bytes (expected {NONCE_SIZE})", v.len()))
        })?;

        let mut sealed = STANDARD
            .decode(sealed)
            .map_err(|_| Error::MalformedEnvelope("ciphertext is not base64".to_string()))?;
        if sealed.len() < TAG_SIZE {
            return Err(Error::MalformedEnvelope("ciphertext shorter than tag".to_string()));
        }
        let tag_bytes = sealed.split_off(sealed.len() - TAG_SIZE);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&tag_bytes);

        Ok(Self { version_label: label.to_string(), nonce, ciphertext: sealed, tag })
    }

    /// Parses raw column bytes into an envelope.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedEnvelope` if the bytes are not UTF-8 or fail
    /// [`parse`](Self::parse).
    pub fn parse_bytes(stored: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(stored)
            .map_err(|_| Error::MalformedEnvelope("envelope is not UTF-8".to_string()))?;
        Self::parse(text)
    }
}

/// Prefix shared by every stored envelope under `version_label`.
///
/// Stores use it to count references to a key version without decrypting.
#[must_use]
pub fn version_prefix(version_label: &str) -> String {
    format!("{FORMAT_TAG}{SEPARATOR}{version_label}{SEPARATOR}")
}

/// Reads the version label of a stored value without decoding the payload.
///
/// Returns `None` if the value does not look like an envelope.
#[must_use]
pub fn peek_version(stored: &str) -> Option<&str> {
    let rest = stored.strip_prefix(FORMAT_TAG)?.strip_prefix(SEPARATOR)?;
    let (label, _) = rest.split_once(SEPARATOR)?;
    validate_label(label).ok().map(|()| label)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new("v1", [7u8; NONCE_SIZE], vec![1, 2, 3, 4, 5], [9u8; TAG_SIZE])
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = sample();
        let stored = envelope.serialize();
        assert!(stored.starts_with("fs1:v1:"));

        let parsed = Envelope::parse(&stored).expect("Failed to parse envelope");
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.sealed_bytes().len(), 5 + TAG_SIZE);
    }

    #[test]
    fn test_envelope_empty_ciphertext() {
        let envelope = Envelope::new("v1", [0u8; NONCE_SIZE], Vec::new(), [3u8; TAG_SIZE]);
        let parsed = Envelope::parse(&envelope.serialize()).unwrap();
        assert!(parsed.ciphertext().is_empty());
        assert_eq!(parsed.tag(), &[3u8; TAG_SIZE]);
    }

    #[test]
    fn test_parse_legacy_plaintext() {
        for legacy in ["", "Jane Doe", "1990-05-15", "a:b:c:d", "fs1:v1:x"] {
            let result = Envelope::parse(legacy);
            assert!(matches!(result, Err(Error::MalformedEnvelope(_))), "input {legacy:?}");
        }
    }

    #[test]
    fn test_parse_unknown_format_tag() {
        let stored = sample().serialize().replacen("fs1", "fs9", 1);
        assert!(matches!(Envelope::parse(&stored), Err(Error::MalformedEnvelope(_))));
    }

    #[test]
    fn test_parse_short_nonce() {
        let stored = format!("fs1:v1:{}:{}", STANDARD.encode([0u8; 8]), STANDARD.encode([0u8; 20]));
        assert!(matches!(Envelope::parse(&stored), Err(Error::MalformedEnvelope(_))));
    }

    #[test]
    fn test_parse_truncated_tag() {
        let stored =
            format!("fs1:v1:{}:{}", STANDARD.encode([0u8; NONCE_SIZE]), STANDARD.encode([0u8; 15]));
        assert!(matches!(Envelope::parse(&stored), Err(Error::MalformedEnvelope(_))));
    }

    #[test]
    fn test_parse_bad_base64() {
        let stored = format!("fs1:v1:!!!!:{}", STANDARD.encode([0u8; 20]));
        assert!(matches!(Envelope::parse(&stored), Err(Error::MalformedEnvelope(_))));
    }

    #[test]
    fn test_parse_bytes_rejects_non_utf8() {
        let result = Envelope::parse_bytes(&[0xff, 0xfe, 0x00]);
        assert!(matches!(result, Err(Error::MalformedEnvelope(_))));
    }

    #[test]
    fn test_version_prefix_and_peek() {
        let stored = sample().serialize();
        assert!(stored.starts_with(&version_prefix("v1")));
        assert!(!stored.starts_with(&version_prefix("v10")));
        assert_eq!(peek_version(&stored), Some("v1"));
        assert_eq!(peek_version("Jane Doe"), None);
        assert_eq!(peek_version("fs1:bad label:x:y"), None);
    }
}
