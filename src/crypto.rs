//! AES-256 payload encryption used by the transport handshake and, once
//! end-to-end mode is negotiated, by every subsequent frame (spec §4.1).
//!
//! The legacy protocol only specifies "ciphertext under AES-256"; the exact
//! block mode is not documented upstream. This implementation settles on
//! AES-256-CBC with a zero IV and PKCS#7 padding (see DESIGN.md Open
//! Question (a)) — deterministic and simple to match against a test vector,
//! which is all the handshake needs.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const ZERO_IV: [u8; 16] = [0u8; 16];

pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), &ZERO_IV.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn decrypt(key: &[u8; 32], ciphertext: &[u8]) -> Option<Vec<u8>> {
    Aes256CbcDec::new(key.into(), &ZERO_IV.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips() {
        let key = [0x42u8; 32];
        let msg = b"response 00000007";
        let ct = encrypt(&key, msg);
        assert_ne!(ct, msg);
        let pt = decrypt(&key, &ct).unwrap();
        assert_eq!(pt, msg);
    }

    #[test]
    fn wrong_key_fails_or_garbles() {
        let key_a = [0x11u8; 32];
        let key_b = [0x22u8; 32];
        let ct = encrypt(&key_a, b"challenge 7");
        let pt = decrypt(&key_b, &ct);
        assert!(pt.is_none() || pt.unwrap() != b"challenge 7");
    }
}
