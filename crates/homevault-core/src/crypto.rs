//! Crypto primitives facade
//!
//! Uniform API over the RustCrypto primitives the auth blocks compose:
//! scrypt key stretching, HMAC-SHA256, HKDF-SHA256, AES-256-CBC (PKCS#7)
//! for legacy keyset wrapping, AES-256-GCM for authenticated containers,
//! and secure randomness. Nothing in here implements a primitive itself.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::error::{Error, ErrorKind, Result};
use crate::secret::SecretBytes;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES block size, also the default salt size.
pub const AES_BLOCK_SIZE: usize = 16;
/// Default size of derived secrets and wrapping keys.
pub const DEFAULT_KEY_SIZE: usize = 32;
/// Default salt size for key derivation.
pub const DEFAULT_SALT_SIZE: usize = AES_BLOCK_SIZE;
/// Size of reset secrets.
pub const RESET_SECRET_SIZE: usize = 32;
/// AES-GCM nonce size.
pub const GCM_NONCE_SIZE: usize = 12;

// Project-default scrypt cost parameters (N = 2^12, r = 8, p = 1).
const SCRYPT_LOG_N: u8 = 12;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Cryptographically secure random secret.
pub fn random_secret(len: usize) -> SecretBytes {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    SecretBytes::new(buf)
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// HMAC-SHA256 of `data` under `key`, 32 bytes.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> SecretBytes {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    SecretBytes::new(mac.finalize().into_bytes().to_vec())
}

/// HKDF-SHA256 expansion of `key` into `out_len` bytes.
pub fn hkdf_sha256(key: &[u8], info: &[u8], salt: &[u8], out_len: usize) -> Result<SecretBytes> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt, key);
    let mut okm = vec![0u8; out_len];
    hk.expand(info, &mut okm)
        .map_err(|e| Error::new(ErrorKind::InvalidArgument, format!("HKDF expand failed: {e}")))?;
    Ok(SecretBytes::new(okm))
}

/// Stretch `secret` with scrypt over `salt` into one sub-key per entry of
/// `out_lens`. A single scrypt pass produces the concatenated output,
/// which is then split.
pub fn derive_secrets_scrypt(
    secret: &[u8],
    salt: &[u8],
    out_lens: &[usize],
) -> Result<Vec<SecretBytes>> {
    let total: usize = out_lens.iter().sum();
    if total == 0 {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            "scrypt derivation requested zero output bytes",
        ));
    }
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, total)
        .map_err(|e| Error::new(ErrorKind::InvalidArgument, format!("bad scrypt params: {e}")))?;
    let mut out = vec![0u8; total];
    scrypt::scrypt(secret, salt, &params, &mut out)
        .map_err(|e| Error::new(ErrorKind::InvalidArgument, format!("scrypt failed: {e}")))?;
    let buf = SecretBytes::new(out);

    let mut secrets = Vec::with_capacity(out_lens.len());
    let mut offset = 0;
    for len in out_lens {
        secrets.push(SecretBytes::from_slice(&buf.as_slice()[offset..offset + len]));
        offset += len;
    }
    Ok(secrets)
}

/// AES-256-CBC encryption with PKCS#7 padding.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| Error::new(ErrorKind::InvalidArgument, format!("bad AES key/IV: {e}")))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// AES-256-CBC decryption with PKCS#7 padding. A padding failure means
/// the wrapping key did not match.
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<SecretBytes> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| Error::new(ErrorKind::InvalidArgument, format!("bad AES key/IV: {e}")))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| {
            Error::new(
                ErrorKind::AuthorizationKeyFailed,
                "AES-CBC decryption failed",
            )
        })?;
    Ok(SecretBytes::new(plaintext))
}

/// AES-256-GCM seal; output is the nonce followed by ciphertext+tag.
pub fn aes_gcm_seal(key: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::new(ErrorKind::InvalidArgument, format!("bad AES-GCM key: {e}")))?;
    let mut nonce_bytes = [0u8; GCM_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::new(ErrorKind::InvalidArgument, "AES-GCM encryption failed"))?;

    let mut blob = Vec::with_capacity(GCM_NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// AES-256-GCM open of a nonce-prefixed blob. Authentication
/// failure means the wrapping key did not match or the blob was altered.
pub fn aes_gcm_open(key: &[u8], aad: &[u8], blob: &[u8]) -> Result<SecretBytes> {
    if blob.len() < GCM_NONCE_SIZE {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            "AES-GCM blob shorter than the nonce",
        ));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(GCM_NONCE_SIZE);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::new(ErrorKind::InvalidArgument, format!("bad AES-GCM key: {e}")))?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| {
            Error::new(
                ErrorKind::AuthorizationKeyFailed,
                "AES-GCM decryption failed",
            )
        })?;
    Ok(SecretBytes::new(plaintext))
}
