//! Encryption at rest for user-supplied API keys.
//!
//! Tokens are `<ivHex>:<ciphertextHex>` where the ciphertext is AES-256-CBC
//! with PKCS#7 padding. There is no authentication tag: a tampered token that
//! still unpads cleanly decrypts to wrong plaintext instead of failing.

use std::fmt;

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Size of the resolved key in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// Size of the per-token initialization vector.
pub const IV_SIZE: usize = 16;

const SELF_TEST_PLAINTEXT: &str = "test-api-key-12345";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encryption is not configured: {0}")]
    Configuration(String),
    #[error("encryption failed")]
    Encryption,
    #[error("invalid encrypted format, expected 'IV:DATA'")]
    Format,
    #[error("decryption failed")]
    Crypto,
}

/// How a passphrase is turned into 32 bytes of key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PassphraseDerivation {
    /// SHA-256 digest of the UTF-8 passphrase.
    #[default]
    Sha256,
    /// UTF-8 bytes right-padded with ASCII '0' and truncated to 32 bytes.
    ///
    /// Weak when the passphrase is short. Only kept so tokens written by the
    /// legacy deployment stay readable; changing it would orphan them.
    ZeroPadded,
}

/// Where the process-wide encryption key comes from.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub enum KeySource {
    /// 64 hexadecimal characters, used as the raw 32-byte key.
    Hex(String),
    Passphrase {
        passphrase: String,
        #[zeroize(skip)]
        derivation: PassphraseDerivation,
    },
}

impl KeySource {
    /// Resolve the configured secret into key material.
    pub fn resolve(&self) -> Result<KeyMaterial, CodecError> {
        match self {
            KeySource::Hex(raw) => {
                let raw = raw.trim();
                if raw.len() != KEY_SIZE * 2 {
                    return Err(CodecError::Configuration(format!(
                        "hex key must be {} characters ({} bytes), got {} characters",
                        KEY_SIZE * 2,
                        KEY_SIZE,
                        raw.len()
                    )));
                }
                let mut bytes = [0u8; KEY_SIZE];
                hex::decode_to_slice(raw, &mut bytes).map_err(|_| {
                    CodecError::Configuration("hex key contains non-hexadecimal characters".into())
                })?;
                Ok(KeyMaterial::from_bytes(bytes))
            }
            KeySource::Passphrase {
                passphrase,
                derivation,
            } => {
                if passphrase.is_empty() {
                    return Err(CodecError::Configuration("passphrase is empty".into()));
                }
                Ok(KeyMaterial::from_bytes(derive_from_passphrase(
                    passphrase, *derivation,
                )))
            }
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Hex(_) => f.debug_tuple("Hex").field(&"[REDACTED]").finish(),
            KeySource::Passphrase { derivation, .. } => f
                .debug_struct("Passphrase")
                .field("passphrase", &"[REDACTED]")
                .field("derivation", derivation)
                .finish(),
        }
    }
}

fn derive_from_passphrase(passphrase: &str, derivation: PassphraseDerivation) -> [u8; KEY_SIZE] {
    match derivation {
        PassphraseDerivation::Sha256 => Sha256::digest(passphrase.as_bytes()).into(),
        PassphraseDerivation::ZeroPadded => {
            let mut bytes = [b'0'; KEY_SIZE];
            let input = passphrase.as_bytes();
            let take = input.len().min(KEY_SIZE);
            bytes[..take].copy_from_slice(&input[..take]);
            bytes
        }
    }
}

/// Resolved 256-bit key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: [u8; KEY_SIZE],
}

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypts and decrypts stored API keys with one process-wide key.
#[derive(Clone, Debug)]
pub struct SecretCodec {
    key: KeyMaterial,
}

impl SecretCodec {
    pub fn new(key: KeyMaterial) -> Self {
        Self { key }
    }

    pub fn from_source(source: &KeySource) -> Result<Self, CodecError> {
        source.resolve().map(Self::new)
    }

    /// Encrypt `plaintext` under a fresh random IV.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CodecError> {
        let mut iv = [0u8; IV_SIZE];
        OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|_| CodecError::Encryption)?;

        let ciphertext = Aes256CbcEnc::new_from_slices(self.key.as_bytes(), &iv)
            .map_err(|_| CodecError::Encryption)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    /// Decrypt a token produced by [`SecretCodec::encrypt`].
    pub fn decrypt(&self, token: &str) -> Result<String, CodecError> {
        let (iv_hex, data_hex) = token.split_once(':').ok_or(CodecError::Format)?;
        if iv_hex.is_empty() || data_hex.is_empty() {
            return Err(CodecError::Format);
        }

        let iv = hex::decode(iv_hex).map_err(|_| CodecError::Format)?;
        if iv.len() != IV_SIZE {
            return Err(CodecError::Format);
        }
        let ciphertext = hex::decode(data_hex).map_err(|_| CodecError::Format)?;

        let mut plaintext = Aes256CbcDec::new_from_slices(self.key.as_bytes(), &iv)
            .map_err(|_| CodecError::Crypto)?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CodecError::Crypto)?;

        match String::from_utf8(plaintext) {
            Ok(text) => Ok(text),
            Err(err) => {
                plaintext = err.into_bytes();
                plaintext.zeroize();
                Err(CodecError::Crypto)
            }
        }
    }

    /// Round-trip a fixed string. Meant for startup gating; never panics.
    pub fn verify_setup(&self) -> bool {
        match self
            .encrypt(SELF_TEST_PLAINTEXT)
            .and_then(|token| self.decrypt(&token))
        {
            Ok(decrypted) if decrypted == SELF_TEST_PLAINTEXT => true,
            Ok(_) => {
                tracing::error!("encryption self-test returned mismatched plaintext");
                false
            }
            Err(err) => {
                tracing::error!(error = %err, "encryption self-test failed");
                false
            }
        }
    }
}
