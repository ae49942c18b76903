use crate::{DecodeError, Result};
use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use std::fmt;
use thiserror::Error;

pub const BLOCK_SIZE: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid AES key length {0}, expected 16, 24 or 32 bytes")]
pub struct InvalidKeyLength(pub usize);

/// AES in ECB mode with the fixed per-deployment key the motes are flashed with.
///
/// Built once at startup and owned by the codec.
#[derive(Clone)]
pub enum FrameCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = match self {
            FrameCipher::Aes128(_) => 128,
            FrameCipher::Aes192(_) => 192,
            FrameCipher::Aes256(_) => 256,
        };
        write!(f, "FrameCipher(AES-{bits}-ECB)")
    }
}

impl FrameCipher {
    pub fn new(key: &[u8]) -> std::result::Result<Self, InvalidKeyLength> {
        match key.len() {
            16 => Ok(Self::Aes128(Aes128::new(GenericArray::from_slice(key)))),
            24 => Ok(Self::Aes192(Aes192::new(GenericArray::from_slice(key)))),
            32 => Ok(Self::Aes256(Aes256::new(GenericArray::from_slice(key)))),
            len => Err(InvalidKeyLength(len)),
        }
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(DecodeError::Malformed(format!(
                "ciphertext length {} is not a multiple of the block size",
                ciphertext.len()
            )));
        }

        let mut buf = ciphertext.to_vec();
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(block);
            match self {
                FrameCipher::Aes128(c) => c.decrypt_block(block),
                FrameCipher::Aes192(c) => c.decrypt_block(block),
                FrameCipher::Aes256(c) => c.decrypt_block(block),
            }
        }
        Ok(buf)
    }

    /// Zero-pads `plaintext` to whole blocks and encrypts it, the way the motes do.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut buf = plaintext.to_vec();
        let padded = buf.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        buf.resize(padded, 0);

        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(block);
            match self {
                FrameCipher::Aes128(c) => c.encrypt_block(block),
                FrameCipher::Aes192(c) => c.encrypt_block(block),
                FrameCipher::Aes256(c) => c.encrypt_block(block),
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8; 16] = b"0123456789abcdef";

    #[test]
    fn test_key_lengths() {
        assert!(FrameCipher::new(&[0u8; 16]).is_ok());
        assert!(FrameCipher::new(&[0u8; 24]).is_ok());
        assert!(FrameCipher::new(&[0u8; 32]).is_ok());
        assert_eq!(FrameCipher::new(&[0u8; 10]).unwrap_err(), InvalidKeyLength(10));
    }

    #[test]
    fn test_fips197_vector() {
        // FIPS-197 appendix C.1
        let key: Vec<u8> = (0u8..16).collect();
        let plaintext = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];
        let expected = [
            0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30, 0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4,
            0xc5, 0x5a,
        ];

        let cipher = FrameCipher::new(&key).unwrap();
        assert_eq!(cipher.encrypt(&plaintext), expected);
        assert_eq!(cipher.decrypt(&expected).unwrap(), plaintext);
    }

    #[test]
    fn test_encrypt_pads_with_zeros() {
        let cipher = FrameCipher::new(KEY).unwrap();
        let ciphertext = cipher.encrypt(b"hello");
        assert_eq!(ciphertext.len(), 16);

        let plaintext = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(&plaintext[..5], b"hello");
        assert!(plaintext[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_partial_block_is_malformed() {
        let cipher = FrameCipher::new(KEY).unwrap();
        assert!(matches!(
            cipher.decrypt(&[0u8; 17]),
            Err(DecodeError::Malformed(_))
        ));
    }
}
