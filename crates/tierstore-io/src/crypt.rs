//! At-rest encryption for scratch files.
//!
//! ChaCha20 is a seekable stream cipher, so any byte range can be encrypted or
//! decrypted independently and ciphertext length equals plaintext length.
//! Key and nonce are per file and never leave process memory.

use std::io;

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::{ChaCha20, Key, Nonce};
use rand::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use tierstore_core::error::{Error, Result};

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct FileCipher {
    key: [u8; 32],
    nonce: [u8; 12],
}

impl std::fmt::Debug for FileCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileCipher(..)")
    }
}

impl FileCipher {
    /// Fresh key material from a cryptographically strong source.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = [0u8; 32];
        let mut nonce = [0u8; 12];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut nonce);
        Self { key, nonce }
    }

    /// XOR `data` in place with the keystream starting at byte `offset`.
    /// Encryption and decryption are the same operation.
    pub fn apply(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        let mut cipher = ChaCha20::new(Key::from_slice(&self.key), Nonce::from_slice(&self.nonce));
        cipher
            .try_seek(offset)
            .map_err(|_| keystream_exhausted(offset))?;
        cipher
            .try_apply_keystream(data)
            .map_err(|_| keystream_exhausted(offset))
    }
}

fn keystream_exhausted(offset: u64) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("offset {offset} beyond cipher keystream"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn ranges_decrypt_independently() {
        let mut rng = ChaCha20Rng::seed_from_u64(43210);
        let cipher = FileCipher::generate(&mut rng);

        let plain: Vec<u8> = (0..200u8).collect();
        let mut enc = plain.clone();
        cipher.apply(0, &mut enc).unwrap();
        assert_ne!(enc, plain);

        let mut middle = enc[70..130].to_vec();
        cipher.apply(70, &mut middle).unwrap();
        assert_eq!(&middle[..], &plain[70..130]);
    }

    #[test]
    fn keys_differ_per_file() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let a = FileCipher::generate(&mut rng);
        let b = FileCipher::generate(&mut rng);
        let mut x = [0u8; 16];
        let mut y = [0u8; 16];
        a.apply(0, &mut x).unwrap();
        b.apply(0, &mut y).unwrap();
        assert_ne!(x, y);
    }
}
