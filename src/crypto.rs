use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::TdesEde3;
use thiserror::Error;

const KEY_LEN: usize = 24;
const BLOCK_SIZE: usize = 8;
const KEY_FILLER: u8 = b'0';

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CryptoError {
    #[error("invalid hex input: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("ciphertext length {0} is not a positive multiple of the block size")]
    Length(usize),
    #[error("invalid padding")]
    Padding,
    #[error("decrypted text is not valid utf-8")]
    Utf8,
}

/// 3DES-EDE3 in ECB mode, as used to build the Authenticator.
///
/// ECB is required here: the middleware re-derives the Authenticator on its side
/// and compares ciphertexts, so equal input must always give equal output.
pub struct TripleDes {
    cipher: TdesEde3,
}

impl TripleDes {
    pub fn new(key: &str) -> Self {
        let key = coerce_key(key.as_bytes());
        Self {
            cipher: TdesEde3::new(GenericArray::from_slice(&key)),
        }
    }

    /// Encrypts `plaintext` and returns lower-case hex.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut buf = pad(plaintext.as_bytes());
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        hex::encode(buf)
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let mut buf = hex::decode(ciphertext.trim())?;
        if buf.is_empty() || buf.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::Length(buf.len()));
        }
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        let len = unpad(&buf)?;
        buf.truncate(len);
        String::from_utf8(buf).map_err(|_| CryptoError::Utf8)
    }
}

/// Right-pads with `'0'` or truncates to exactly 24 bytes.
fn coerce_key(key: &[u8]) -> [u8; KEY_LEN] {
    let mut out = [KEY_FILLER; KEY_LEN];
    let n = key.len().min(KEY_LEN);
    out[..n].copy_from_slice(&key[..n]);
    out
}

fn pad(src: &[u8]) -> Vec<u8> {
    let padding = BLOCK_SIZE - src.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(src.len() + padding);
    out.extend_from_slice(src);
    out.resize(src.len() + padding, padding as u8);
    out
}

/// Returns the unpadded length.
fn unpad(src: &[u8]) -> Result<usize, CryptoError> {
    let last = *src.last().ok_or(CryptoError::Padding)? as usize;
    if last == 0 || last > BLOCK_SIZE || last > src.len() {
        return Err(CryptoError::Padding);
    }
    let body = src.len() - last;
    if src[body..].iter().any(|&b| b as usize != last) {
        return Err(CryptoError::Padding);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let crypto = TripleDes::new("12345678");
        for plain in [
            "",
            "a",
            "exactly8",
            "12345678$8A1B2C$user$stb$10.0.0.2$00:11:22:33:44:55$$CTC",
            "中文内容也可以",
        ] {
            let hex = crypto.encrypt(plain);
            assert_eq!(hex.len() % 16, 0);
            assert_eq!(crypto.decrypt(&hex).unwrap(), plain);
        }
    }

    #[test]
    fn test_key_coercion() {
        assert_eq!(&coerce_key(b"1234"), b"123400000000000000000000");
        assert_eq!(
            &coerce_key(b"0123456789abcdefghijklmnopqrstuvwxyz"),
            b"0123456789abcdefghijklmn"
        );

        // A short key behaves exactly like its explicitly padded form.
        let short = TripleDes::new("1234");
        let padded = TripleDes::new("123400000000000000000000");
        assert_eq!(short.encrypt("payload"), padded.encrypt("payload"));

        let long = TripleDes::new("0123456789abcdefghijklmnopqrstuvwxyz");
        let truncated = TripleDes::new("0123456789abcdefghijklmn");
        assert_eq!(long.encrypt("payload"), truncated.encrypt("payload"));
        assert_eq!(long.encrypt("payload"), long.encrypt("payload"));
    }

    #[test]
    fn test_ecb_is_deterministic_per_block() {
        let crypto = TripleDes::new("87654321");
        let hex = crypto.encrypt("ABCDEFGHABCDEFGH");
        // Two identical plaintext blocks give identical ciphertext blocks.
        assert_eq!(&hex[0..16], &hex[16..32]);
        // Full padding block appended for block-aligned input.
        assert_eq!(hex.len(), 48);
    }

    #[test]
    fn test_decrypt_rejects_bad_input() {
        let crypto = TripleDes::new("12345678");
        assert!(matches!(crypto.decrypt("zz"), Err(CryptoError::Hex(_))));
        assert_eq!(crypto.decrypt("abcd"), Err(CryptoError::Length(2)));
        assert_eq!(crypto.decrypt(""), Err(CryptoError::Length(0)));

        // A block whose last byte is zero is not valid padding.
        let mut block = [0u8; BLOCK_SIZE];
        crypto
            .cipher
            .encrypt_block(GenericArray::from_mut_slice(&mut block));
        assert_eq!(crypto.decrypt(&hex::encode(block)), Err(CryptoError::Padding));
    }

    #[test]
    fn test_unpad_bounds() {
        assert_eq!(unpad(&[1, 2, 3, 4, 5, 6, 7, 1]), Ok(7));
        assert_eq!(unpad(&[8; 8]), Ok(0));
        assert_eq!(unpad(&[1, 2, 3, 4, 5, 6, 7, 9]), Err(CryptoError::Padding));
        assert_eq!(unpad(&[1, 2, 3, 4, 5, 6, 2, 3]), Err(CryptoError::Padding));
    }
}
