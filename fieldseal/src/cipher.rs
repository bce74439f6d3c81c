//! AES-256-GCM field cipher.
//!
//! The cipher is stateless: every call takes the key version to use, so
//! concurrent calls from any number of threads need no coordination.

use crate::context::FieldContext;
use crate::envelope::{Envelope, NONCE_SIZE, TAG_SIZE};
use crate::error::Error;
use crate::key_registry::KeyVersion;
use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroize;

/// Stateless AEAD primitive producing and consuming [`Envelope`]s.
///
/// # Example
///
/// ```ignore
/// use fieldseal::cipher::FieldCipher;
/// use fieldseal::context::FieldContext;
///
/// let key = registry.current()?;
/// let context = FieldContext::new("clients", "date_of_birth").with_row(42);
///
/// let envelope = FieldCipher::encrypt("1990-05-15", &key, Some(&context))?;
/// let plaintext = FieldCipher::decrypt(&envelope, &key, Some(&context))?;
/// assert_eq!(plaintext, "1990-05-15");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldCipher;

impl FieldCipher {
    /// Encrypts a UTF-8 value under `key` with a fresh random nonce.
    ///
    /// When a context is given it is bound as associated data and must be
    /// supplied again to decrypt.
    ///
    /// # Errors
    ///
    /// Returns `Error::EncryptionFailed` if the AEAD rejects the input.
    pub fn encrypt(
        plaintext: &str,
        key: &KeyVersion,
        context: Option<&FieldContext>,
    ) -> Result<Envelope, Error> {
        let cipher = Aes256Gcm::new_from_slice(key.key_bytes())
            .map_err(|e| Error::EncryptionFailed(format!("Invalid key: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let aad = context.map(FieldContext::aad).unwrap_or_default();
        let mut sealed = cipher
            .encrypt(nonce, Payload { msg: plaintext.as_bytes(), aad: &aad })
            .map_err(|e| Error::EncryptionFailed(format!("AES-256-GCM encryption failed: {e}")))?;

        let tag_bytes = sealed.split_off(sealed.len() - TAG_SIZE);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&tag_bytes);

        Ok(Envelope::new(key.label(), nonce_bytes, sealed, tag))
    }

    /// Decrypts an envelope with `key`.
    ///
    /// Every failure (label mismatch, wrong key, tampering, wrong context,
    /// invalid UTF-8) is reported as the same `Error::Decryption`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decryption` on any authentication or decoding failure.
    pub fn decrypt(
        envelope: &Envelope,
        key: &KeyVersion,
        context: Option<&FieldContext>,
    ) -> Result<String, Error> {
        if envelope.version_label() != key.label() {
            return Err(Error::Decryption);
        }

        let cipher = Aes256Gcm::new_from_slice(key.key_bytes()).map_err(|_| Error::Decryption)?;
        let nonce = Nonce::from_slice(envelope.nonce());
        let aad = context.map(FieldContext::aad).unwrap_or_default();
        let sealed = envelope.sealed_bytes();

        let plaintext = cipher
            .decrypt(nonce, Payload { msg: &sealed, aad: &aad })
            .map_err(|_| Error::Decryption)?;

        String::from_utf8(plaintext).map_err(|e| {
            e.into_bytes().zeroize();
            Error::Decryption
        })
    }

    /// Encrypts and serializes in one step.
    ///
    /// # Errors
    ///
    /// See [`encrypt`](Self::encrypt).
    pub fn seal(
        plaintext: &str,
        key: &KeyVersion,
        context: Option<&FieldContext>,
    ) -> Result<String, Error> {
        Ok(Self::encrypt(plaintext, key, context)?.serialize())
    }
}
