//! Authenticated encryption of frame payloads.
//!
//! AES-128 in CCM mode with a 4-byte tag, keyed by a session key established
//! by an out-of-band handshake. The cipher key and the nonce are both carved
//! out of the 32-byte application key: the first 16 bytes key the cipher, the
//! next 8 bytes become the nonce.
//!
//! The nonce is derived once per session key and reused for every packet
//! encrypted under it. That is the established wire behavior of deployed
//! devices and cannot change without breaking them, but it is a real
//! weakness of the format: never install the same application key for two
//! independent sessions.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit};
use ccm::consts::{U4, U8};
use ccm::Ccm;

use crate::device::frame::MAX_PAYLOAD_LEN;

/// Size of the application key material installed after the handshake.
pub const APP_KEY_LEN: usize = 32;
/// Size of the AES key carved out of the application key.
pub const KEY_LEN: usize = 16;
/// Size of the nonce carved out of the application key.
pub const IV_LEN: usize = 8;
/// Size of the authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 4;
/// Largest plaintext that still fits a frame once the tag is appended.
pub const SEC_PACKET_MAX_SIZE: usize = MAX_PAYLOAD_LEN - TAG_LEN;

type CcmAes128 = Ccm<Aes128, U4, U8>;

/// State of a [SecureChannel].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SecState {
    /// No session key installed yet; encrypt and decrypt are refused.
    Unfinished,
    /// A session key is installed. The transition is one-way.
    Ready,
}

/// Payload encryption context of one logical secured channel.
pub struct SecureChannel {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
    key_len: u8,
    iv_len: u8,
    tag_len: u8,
    state: SecState,
    cipher: Option<CcmAes128>,
}

#[derive(thiserror::Error, Debug)]
pub enum SecError {
    #[error("no session key has been installed")]
    NotReady,

    #[error("plaintext is too large (is: {len}B, max: {SEC_PACKET_MAX_SIZE}B)")]
    TooLarge { len: usize },

    #[error("ciphertext is too short to carry a tag ({len}B)")]
    TooShort { len: usize },

    #[error("authentication failed, the tag does not verify")]
    AuthenticationFailure,
}

impl SecureChannel {
    pub fn new() -> Self {
        SecureChannel {
            key: [0u8; KEY_LEN],
            iv: [0u8; IV_LEN],
            key_len: KEY_LEN as u8,
            iv_len: IV_LEN as u8,
            tag_len: TAG_LEN as u8,
            state: SecState::Unfinished,
            cipher: None,
        }
    }

    pub fn state(&self) -> SecState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SecState::Ready
    }

    pub fn tag_len(&self) -> usize {
        self.tag_len as usize
    }

    /// Installs the session key established by the handshake and switches the
    /// context to [SecState::Ready].
    pub fn install_key(&mut self, app_key: &[u8; APP_KEY_LEN]) {
        self.key.copy_from_slice(&app_key[..self.key_len as usize]);
        self.iv
            .copy_from_slice(&app_key[self.key_len as usize..self.key_len as usize + self.iv_len as usize]);
        self.cipher = Some(CcmAes128::new(GenericArray::from_slice(&self.key)));
        self.state = SecState::Ready;
    }

    /// Encrypts a payload, returning `ciphertext ‖ tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecError> {
        let cipher = self.cipher.as_ref().ok_or(SecError::NotReady)?;
        if plaintext.len() > SEC_PACKET_MAX_SIZE {
            return Err(SecError::TooLarge {
                len: plaintext.len(),
            });
        }
        cipher
            .encrypt(GenericArray::from_slice(&self.iv), plaintext)
            .map_err(|_| SecError::AuthenticationFailure)
    }

    /// Verifies and strips the tag, returning the plaintext. Fails when the
    /// tag does not match; retrying cannot change that outcome.
    pub fn decrypt(&self, input: &[u8]) -> Result<Vec<u8>, SecError> {
        let cipher = self.cipher.as_ref().ok_or(SecError::NotReady)?;
        if input.len() <= self.tag_len as usize {
            return Err(SecError::TooShort { len: input.len() });
        }
        cipher
            .decrypt(GenericArray::from_slice(&self.iv), input)
            .map_err(|_| SecError::AuthenticationFailure)
    }
}

impl Default for SecureChannel {
    fn default() -> Self {
        Self::new()
    }
}
