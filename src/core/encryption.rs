//! Block cipher providers for the cipher overlay
//!
//! The overlay only needs a handful of facts about a cipher: its block size,
//! whether a multi-block span may be processed in one call, and which
//! directions it supports. [`BlockCipher`] captures exactly that so rights
//! management backends can be plugged in from outside the crate.
//!
//! **Design**:
//! - Inputs are always a whole number of blocks; no padding is applied here
//! - [`AesBlockCipher`] uses AES-256 over 16-byte blocks, each block independent
//! - Master key must be 32 bytes (256 bits)

use crate::core::error::{Result, StreamError};
use aes_gcm::aead::OsRng;
use aes_gcm::aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes_gcm::aes::Aes256;
use rand::RngCore;

/// Encryption key (32 bytes for AES-256)
pub type EncryptionKey = [u8; 32];

/// AES block size in bytes
pub const AES_BLOCK_SIZE: u32 = 16;

/// Pluggable block cipher
pub trait BlockCipher {
    /// Cipher block size in bytes
    fn block_size(&self) -> u32;

    /// Whether a span of several blocks may be passed in a single call
    fn can_merge_blocks(&self) -> bool;

    fn can_encrypt(&self) -> bool;

    fn can_decrypt(&self) -> bool;

    /// Encrypt a whole number of blocks
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a whole number of blocks
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

impl<T: BlockCipher + ?Sized> BlockCipher for Box<T> {
    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn can_merge_blocks(&self) -> bool {
        (**self).can_merge_blocks()
    }

    fn can_encrypt(&self) -> bool {
        (**self).can_encrypt()
    }

    fn can_decrypt(&self) -> bool {
        (**self).can_decrypt()
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        (**self).encrypt(plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        (**self).decrypt(ciphertext)
    }
}

/// Generate a random encryption key
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// AES-256 applied block by block
pub struct AesBlockCipher {
    cipher: Aes256,
    can_encrypt: bool,
}

impl AesBlockCipher {
    /// Cipher that can both encrypt and decrypt
    pub fn new(key: &EncryptionKey) -> Self {
        AesBlockCipher {
            cipher: Aes256::new(GenericArray::from_slice(key)),
            can_encrypt: true,
        }
    }

    /// Cipher restricted to decryption (view-only rights)
    pub fn decrypt_only(key: &EncryptionKey) -> Self {
        AesBlockCipher {
            cipher: Aes256::new(GenericArray::from_slice(key)),
            can_encrypt: false,
        }
    }

    fn check_aligned(&self, data: &[u8]) -> Result<()> {
        if data.len() % AES_BLOCK_SIZE as usize != 0 {
            return Err(StreamError::Cipher(format!(
                "input of {} bytes is not a multiple of the {}-byte block size",
                data.len(),
                AES_BLOCK_SIZE
            )));
        }
        Ok(())
    }
}

impl BlockCipher for AesBlockCipher {
    fn block_size(&self) -> u32 {
        AES_BLOCK_SIZE
    }

    fn can_merge_blocks(&self) -> bool {
        true
    }

    fn can_encrypt(&self) -> bool {
        self.can_encrypt
    }

    fn can_decrypt(&self) -> bool {
        true
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if !self.can_encrypt {
            return Err(StreamError::Unsupported(
                "cipher was opened for decryption only".to_string(),
            ));
        }
        self.check_aligned(plaintext)?;

        let mut out = plaintext.to_vec();
        for block in out.chunks_exact_mut(AES_BLOCK_SIZE as usize) {
            self.cipher
                .encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.check_aligned(ciphertext)?;

        let mut out = ciphertext.to_vec();
        for block in out.chunks_exact_mut(AES_BLOCK_SIZE as usize) {
            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let key1 = generate_key();
        let key2 = generate_key();

        // Keys should be different
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_encryption_decryption() {
        let cipher = AesBlockCipher::new(&generate_key());
        let plaintext = b"Sixteen byte blkand a second one";

        let ciphertext = cipher.encrypt(plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_ne!(ciphertext.as_slice(), plaintext.as_slice());

        let decrypted = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted.as_slice(), plaintext.as_slice());
    }

    #[test]
    fn test_blocks_are_independent() {
        let cipher = AesBlockCipher::new(&generate_key());
        let span = [0x42u8; 48];

        let whole = cipher.encrypt(&span).unwrap();
        let single = cipher.encrypt(&span[..16]).unwrap();

        assert_eq!(&whole[16..32], single.as_slice());
        assert_eq!(cipher.decrypt(&whole[32..]).unwrap(), &span[..16]);
    }

    #[test]
    fn test_unaligned_input_rejected() {
        let cipher = AesBlockCipher::new(&generate_key());
        assert!(matches!(
            cipher.encrypt(&[0u8; 15]),
            Err(StreamError::Cipher(_))
        ));
    }

    #[test]
    fn test_decrypt_only_refuses_encryption() {
        let key = generate_key();
        let full = AesBlockCipher::new(&key);
        let view = AesBlockCipher::decrypt_only(&key);

        assert!(!view.can_encrypt());
        assert!(view.can_decrypt());

        let ciphertext = full.encrypt(&[1u8; 16]).unwrap();
        assert_eq!(view.decrypt(&ciphertext).unwrap(), vec![1u8; 16]);
        assert!(matches!(
            view.encrypt(&[1u8; 16]),
            Err(StreamError::Unsupported(_))
        ));
    }

    #[test]
    fn test_wrong_key_garbles() {
        let a = AesBlockCipher::new(&generate_key());
        let b = AesBlockCipher::new(&generate_key());
        let ciphertext = a.encrypt(&[9u8; 32]).unwrap();

        assert_ne!(b.decrypt(&ciphertext).unwrap(), vec![9u8; 32]);
    }
}
