//! Stream cipher adapter.
//!
//! Only keystream ciphers are supported: the protocol filters carry their own
//! integrity tags, so the cipher layer is a plain XOR transform keyed by a
//! per-direction IV which travels in front of the first ciphertext byte.

use core::fmt::{Debug, Formatter};

use aes::{
    Aes128, Aes192, Aes256,
    cipher::{KeyInit, KeyIvInit, StreamCipher, generic_array::GenericArray},
};
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::{ChaCha20, XChaCha20};
use ctr::Ctr128BE;
use rand::{TryRngCore, rngs::OsRng};
use rc4::{Rc4, consts::U16};
use tracing::debug;

use crate::{
    conn::{Decoded, Filter},
    crypto::{SecretKey, kdf, md5},
    error::{ConfigError, Error},
};

/// Stream ciphers understood by ShadowsocksR servers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum CipherKind {
    /// RC4 keyed with `MD5(key || iv)`.
    Rc4Md5,
    /// AES-128 in CTR mode with a 128-bit big-endian counter.
    Aes128Ctr,
    /// AES-192 in CTR mode.
    Aes192Ctr,
    /// AES-256 in CTR mode.
    Aes256Ctr,
    /// AES-128 in CFB-128 mode.
    Aes128Cfb,
    /// AES-192 in CFB-128 mode.
    Aes192Cfb,
    /// AES-256 in CFB-128 mode.
    Aes256Cfb,
    /// ChaCha20 with a 96-bit nonce.
    ChaCha20Ietf,
    /// XChaCha20 with a 192-bit nonce.
    XChaCha20,
    /// No encryption. The key is still derived but never used.
    None,
}

impl CipherKind {
    /// Looks up a cipher by its configuration name, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name.to_ascii_uppercase().as_str() {
            "RC4-MD5" => CipherKind::Rc4Md5,
            "AES-128-CTR" => CipherKind::Aes128Ctr,
            "AES-192-CTR" => CipherKind::Aes192Ctr,
            "AES-256-CTR" => CipherKind::Aes256Ctr,
            "AES-128-CFB" => CipherKind::Aes128Cfb,
            "AES-192-CFB" => CipherKind::Aes192Cfb,
            "AES-256-CFB" => CipherKind::Aes256Cfb,
            "CHACHA20-IETF" => CipherKind::ChaCha20Ietf,
            "XCHACHA20" => CipherKind::XChaCha20,
            "NONE" => CipherKind::None,
            _ => return None,
        };
        Some(kind)
    }

    /// The canonical configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Rc4Md5 => "RC4-MD5",
            CipherKind::Aes128Ctr => "AES-128-CTR",
            CipherKind::Aes192Ctr => "AES-192-CTR",
            CipherKind::Aes256Ctr => "AES-256-CTR",
            CipherKind::Aes128Cfb => "AES-128-CFB",
            CipherKind::Aes192Cfb => "AES-192-CFB",
            CipherKind::Aes256Cfb => "AES-256-CFB",
            CipherKind::ChaCha20Ietf => "CHACHA20-IETF",
            CipherKind::XChaCha20 => "XCHACHA20",
            CipherKind::None => "NONE",
        }
    }

    /// Required key length in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherKind::Rc4Md5 | CipherKind::Aes128Ctr | CipherKind::Aes128Cfb => 16,
            CipherKind::Aes192Ctr | CipherKind::Aes192Cfb => 24,
            CipherKind::Aes256Ctr | CipherKind::Aes256Cfb => 32,
            CipherKind::ChaCha20Ietf | CipherKind::XChaCha20 => 32,
            CipherKind::None => 16,
        }
    }

    /// Length of the IV sent ahead of each direction's ciphertext.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherKind::ChaCha20Ietf => 12,
            CipherKind::XChaCha20 => 24,
            CipherKind::None => 0,
            _ => 16,
        }
    }
}

/// A keyed stream cipher, shared by every connection of a [`Config`].
///
/// [`Config`]: crate::Config
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Cipher {
    kind: CipherKind,
    key: SecretKey,
}

impl Cipher {
    /// Picks the cipher `name`.
    ///
    /// When `key` is empty the key is derived from `password` with [`kdf`];
    /// otherwise `key` must have exactly the length the cipher requires.
    ///
    /// [`kdf`]: crate::kdf
    pub fn pick(name: &str, key: &[u8], password: &[u8]) -> Result<Self, Error> {
        if key.is_empty() {
            let kind = Self::lookup(name)?;
            Self::with_kind(kind, kdf(password, kind.key_size()))
        } else {
            Self::with_kind(Self::lookup(name)?, key.to_vec())
        }
    }

    /// Picks the cipher `name` with an explicit key, never deriving one.
    pub fn pick_with_key(name: &str, key: &[u8]) -> Result<Self, Error> {
        Self::with_kind(Self::lookup(name)?, key.to_vec())
    }

    fn lookup(name: &str) -> Result<CipherKind, Error> {
        CipherKind::from_name(name).ok_or_else(|| {
            debug!(name, "unsupported cipher");
            ConfigError::UnsupportedCipher {
                name: name.to_owned(),
            }
            .into()
        })
    }

    fn with_kind(kind: CipherKind, key: Vec<u8>) -> Result<Self, Error> {
        if key.len() != kind.key_size() {
            return Err(ConfigError::KeySizeMismatch {
                expect: kind.key_size(),
                received: key.len(),
            }
            .into());
        }
        debug!(cipher = kind.name(), "cipher picked");
        Ok(Self {
            kind,
            key: SecretKey::from(key),
        })
    }

    /// The cipher family.
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Length of the IV of each direction.
    pub fn iv_size(&self) -> usize {
        self.kind.iv_size()
    }

    /// The key bytes, either explicit or derived from the password.
    pub fn key(&self) -> &[u8] {
        self.key.as_bytes()
    }

    /// Creates the per-connection cipher layer with a fresh random IV.
    pub fn clone_for_connection(&self) -> CipherFilter {
        let mut iv = vec![0u8; self.iv_size()];
        OsRng
            .try_fill_bytes(&mut iv)
            .expect("system random source failure");
        self.clone_for_connection_with_iv(iv)
    }

    pub(crate) fn clone_for_connection_with_iv(&self, iv: Vec<u8>) -> CipherFilter {
        CipherFilter {
            cipher: self.clone(),
            iv,
            encrypter: None,
            decrypter: None,
            peer_iv: Vec::new(),
        }
    }

    pub(crate) fn encrypter(&self, iv: &[u8]) -> Keystream {
        Keystream::new(self.kind, self.key.as_bytes(), iv, true)
    }

    pub(crate) fn decrypter(&self, iv: &[u8]) -> Keystream {
        Keystream::new(self.kind, self.key.as_bytes(), iv, false)
    }
}

pub(crate) enum Keystream {
    Rc4(Rc4<U16>),
    Aes128Ctr(Ctr128BE<Aes128>),
    Aes192Ctr(Ctr128BE<Aes192>),
    Aes256Ctr(Ctr128BE<Aes256>),
    Aes128CfbEnc(BufEncryptor<Aes128>),
    Aes128CfbDec(BufDecryptor<Aes128>),
    Aes192CfbEnc(BufEncryptor<Aes192>),
    Aes192CfbDec(BufDecryptor<Aes192>),
    Aes256CfbEnc(BufEncryptor<Aes256>),
    Aes256CfbDec(BufDecryptor<Aes256>),
    ChaCha20(ChaCha20),
    XChaCha20(XChaCha20),
    None,
}

macro_rules! key_iv {
    ($ty:ty, $key:expr, $iv:expr) => {
        <$ty as KeyIvInit>::new(GenericArray::from_slice($key), GenericArray::from_slice($iv))
    };
}

impl Keystream {
    /// Key and IV lengths must already match `kind`.
    fn new(kind: CipherKind, key: &[u8], iv: &[u8], encrypt: bool) -> Self {
        match (kind, encrypt) {
            (CipherKind::Rc4Md5, _) => {
                let mut material = key.to_vec();
                material.extend_from_slice(iv);
                Keystream::rc4(&md5(&material))
            }
            (CipherKind::Aes128Ctr, _) => Keystream::Aes128Ctr(key_iv!(Ctr128BE<Aes128>, key, iv)),
            (CipherKind::Aes192Ctr, _) => Keystream::Aes192Ctr(key_iv!(Ctr128BE<Aes192>, key, iv)),
            (CipherKind::Aes256Ctr, _) => Keystream::Aes256Ctr(key_iv!(Ctr128BE<Aes256>, key, iv)),
            (CipherKind::Aes128Cfb, true) => {
                Keystream::Aes128CfbEnc(key_iv!(BufEncryptor<Aes128>, key, iv))
            }
            (CipherKind::Aes128Cfb, false) => {
                Keystream::Aes128CfbDec(key_iv!(BufDecryptor<Aes128>, key, iv))
            }
            (CipherKind::Aes192Cfb, true) => {
                Keystream::Aes192CfbEnc(key_iv!(BufEncryptor<Aes192>, key, iv))
            }
            (CipherKind::Aes192Cfb, false) => {
                Keystream::Aes192CfbDec(key_iv!(BufDecryptor<Aes192>, key, iv))
            }
            (CipherKind::Aes256Cfb, true) => {
                Keystream::Aes256CfbEnc(key_iv!(BufEncryptor<Aes256>, key, iv))
            }
            (CipherKind::Aes256Cfb, false) => {
                Keystream::Aes256CfbDec(key_iv!(BufDecryptor<Aes256>, key, iv))
            }
            (CipherKind::ChaCha20Ietf, _) => Keystream::ChaCha20(key_iv!(ChaCha20, key, iv)),
            (CipherKind::XChaCha20, _) => Keystream::XChaCha20(key_iv!(XChaCha20, key, iv)),
            (CipherKind::None, _) => Keystream::None,
        }
    }

    /// Plain RC4, as used for the payload of `auth_chain` chunks.
    pub(crate) fn rc4(key: &[u8; 16]) -> Self {
        Keystream::Rc4(<Rc4<U16> as KeyInit>::new(GenericArray::from_slice(&key[..])))
    }

    pub(crate) fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Keystream::Rc4(c) => c.apply_keystream(buf),
            Keystream::Aes128Ctr(c) => c.apply_keystream(buf),
            Keystream::Aes192Ctr(c) => c.apply_keystream(buf),
            Keystream::Aes256Ctr(c) => c.apply_keystream(buf),
            Keystream::Aes128CfbEnc(c) => c.encrypt(buf),
            Keystream::Aes128CfbDec(c) => c.decrypt(buf),
            Keystream::Aes192CfbEnc(c) => c.encrypt(buf),
            Keystream::Aes192CfbDec(c) => c.decrypt(buf),
            Keystream::Aes256CfbEnc(c) => c.encrypt(buf),
            Keystream::Aes256CfbDec(c) => c.decrypt(buf),
            Keystream::ChaCha20(c) => c.apply_keystream(buf),
            Keystream::XChaCha20(c) => c.apply_keystream(buf),
            Keystream::None => {}
        }
    }
}

impl Debug for Keystream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Keystream::Rc4(_) => "Rc4",
            Keystream::Aes128Ctr(_) | Keystream::Aes192Ctr(_) | Keystream::Aes256Ctr(_) => "AesCtr",
            Keystream::Aes128CfbEnc(_)
            | Keystream::Aes192CfbEnc(_)
            | Keystream::Aes256CfbEnc(_) => "AesCfbEnc",
            Keystream::Aes128CfbDec(_)
            | Keystream::Aes192CfbDec(_)
            | Keystream::Aes256CfbDec(_) => "AesCfbDec",
            Keystream::ChaCha20(_) => "ChaCha20",
            Keystream::XChaCha20(_) => "XChaCha20",
            Keystream::None => "None",
        };
        f.debug_tuple("Keystream").field(&name).finish()
    }
}

/// Per-connection cipher layer.
///
/// The first non-empty encode is prefixed with this connection's IV. Decode
/// collects the peer's IV from the first `iv_size` inbound bytes and only
/// then starts producing plaintext.
#[derive(Debug)]
pub struct CipherFilter {
    cipher: Cipher,
    iv: Vec<u8>,
    encrypter: Option<Keystream>,
    decrypter: Option<Keystream>,
    peer_iv: Vec<u8>,
}

impl CipherFilter {
    /// The IV of the outbound direction.
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// The IV of the inbound direction, once it has been received.
    pub fn peer_iv(&self) -> Option<&[u8]> {
        self.decrypter.as_ref().map(|_| self.peer_iv.as_slice())
    }
}

impl Filter for CipherFilter {
    fn encode(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        if buf.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(self.iv.len() + buf.len());
        if self.encrypter.is_none() {
            out.extend_from_slice(&self.iv);
            self.encrypter = Some(self.cipher.encrypter(&self.iv));
        }
        let start = out.len();
        out.extend_from_slice(buf);
        if let Some(encrypter) = &mut self.encrypter {
            encrypter.apply(&mut out[start..]);
        }
        Ok(out)
    }

    fn decode(&mut self, mut buf: &[u8]) -> Result<Decoded, Error> {
        if self.decrypter.is_none() {
            let need = self.cipher.iv_size() - self.peer_iv.len();
            let n = need.min(buf.len());
            self.peer_iv.extend_from_slice(&buf[..n]);
            buf = &buf[n..];
            if self.peer_iv.len() < self.cipher.iv_size() {
                return Ok(Decoded::Data(Vec::new()));
            }
            self.decrypter = Some(self.cipher.decrypter(&self.peer_iv));
        }
        let mut out = buf.to_vec();
        if let Some(decrypter) = &mut self.decrypter {
            decrypter.apply(&mut out);
        }
        Ok(Decoded::Data(out))
    }
}
