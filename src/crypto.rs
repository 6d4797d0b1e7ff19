//! Hash, MAC and block primitives.
//!
//! The framing protocols are built on legacy primitives (MD5, SHA-1, RC4,
//! single-block AES-128). None of them is used for anything the wire format
//! does not dictate.

use core::fmt::{Debug, Formatter};

use aes::{
    Aes128,
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray},
};
use aws_lc_rs::{digest, hmac as lc_hmac};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacMd5 = Hmac<Md5>;

pub(crate) const MD5_LEN: usize = 16;
pub(crate) const SHA1_LEN: usize = 20;

/// Key bytes of a cipher or a protocol user.
#[derive(Clone, Eq, PartialEq, Hash, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SecretKey(Vec<u8>);

impl SecretKey {
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for SecretKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for SecretKey {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for SecretKey {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl Debug for SecretKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecretKey").field(&"*****").finish()
    }
}

/// Stretches `password` into `key_len` bytes the way Shadowsocks does
/// (OpenSSL `EVP_BytesToKey` with MD5, one iteration, no salt).
///
/// Each 16-byte block is `MD5(previous block || password)`, the first block
/// having no predecessor. The blocks are concatenated and truncated.
///
/// ```
/// let key = ssrwire::kdf(b"password", 16);
/// assert_eq!(key.len(), 16);
/// assert_eq!(&key[..], &ssrwire::kdf(b"password", 32)[..16]);
/// ```
pub fn kdf(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + MD5_LEN);
    while key.len() < key_len {
        let mut hasher = <Md5 as Digest>::new();
        hasher.update(&key[key.len().saturating_sub(MD5_LEN)..]);
        hasher.update(password);
        key.extend_from_slice(&hasher.finalize());
    }
    key.truncate(key_len);
    key
}

pub(crate) fn md5(data: &[u8]) -> [u8; MD5_LEN] {
    let mut out = [0u8; MD5_LEN];
    out.copy_from_slice(&<Md5 as Digest>::digest(data));
    out
}

pub(crate) fn sha1(data: &[u8]) -> [u8; SHA1_LEN] {
    let mut out = [0u8; SHA1_LEN];
    out.copy_from_slice(digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data).as_ref());
    out
}

pub(crate) fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; MD5_LEN] {
    let mut mac =
        <HmacMd5 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    let mut out = [0u8; MD5_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

pub(crate) fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; SHA1_LEN] {
    let key = lc_hmac::Key::new(lc_hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
    let mut out = [0u8; SHA1_LEN];
    out.copy_from_slice(lc_hmac::sign(&key, data).as_ref());
    out
}

/// AES-128-CBC with an all-zero IV over exactly one block, which is the
/// plain block transform.
pub(crate) fn aes128_cbc_encrypt_block(key: &[u8; 16], block: &mut [u8; 16]) {
    <Aes128 as KeyInit>::new(GenericArray::from_slice(&key[..]))
        .encrypt_block(GenericArray::from_mut_slice(&mut block[..]));
}

pub(crate) fn aes128_cbc_decrypt_block(key: &[u8; 16], block: &mut [u8; 16]) {
    <Aes128 as KeyInit>::new(GenericArray::from_slice(&key[..]))
        .decrypt_block(GenericArray::from_mut_slice(&mut block[..]));
}

#[cfg(test)]
pub(crate) fn hex(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}
