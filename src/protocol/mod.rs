//! Protocol filters: chunk framing, authentication and integrity.
//!
//! A [`Protocol`] is the template shared by every connection to one server.
//! It owns the base key, the `protocol-param` string and the session
//! identity (client id and connection counter). Each connection gets its
//! own [`ProtocolFilter`] from [`Protocol::clone_for_connection`].
//!
//! | name              | integrity             | first chunk              |
//! |-------------------|-----------------------|--------------------------|
//! | `origin`          | none                  | as is                    |
//! | `auth_sha1_v4`    | CRC32, Adler-32       | HMAC-SHA1 auth header    |
//! | `auth_aes128_md5` | HMAC-MD5 per chunk    | AES sealed auth header   |
//! | `auth_chain_a`    | chained HMAC-MD5, RC4 | AES sealed auth header   |
//! | `auth_chain_b`    | as `auth_chain_a`     | as `auth_chain_a`        |

mod auth_aes128_md5;
mod auth_chain;
mod auth_sha1_v4;
mod origin;

use std::{collections::HashMap, sync::Arc, sync::LazyLock};

use base64::{Engine, engine::general_purpose::STANDARD};
use rand::{
    SeedableRng, TryRngCore,
    rngs::{OsRng, StdRng},
};
use tracing::debug;

use self::{
    auth_aes128_md5::AuthAes128Md5,
    auth_chain::{AuthChain, ChainVariant},
    auth_sha1_v4::AuthSha1V4,
};
use crate::{
    conn::{Decoded, Filter},
    crypto::{SecretKey, kdf, md5, sha1},
    error::{ConfigError, Error, IntegrityError},
    session::{SessionIdentity, UserIdentity, current_timestamp, timestamp_is_fresh},
    wire::DEFAULT_TCP_MSS,
};

/// Which end of the connection a [`ProtocolFilter`] serves.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    /// Sends the authentication header.
    Client,
    /// Verifies the authentication header.
    Server,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
enum ProtocolKind {
    Origin,
    AuthSha1V4,
    AuthAes128Md5,
    AuthChainA,
    AuthChainB,
}

static PROTOCOLS: LazyLock<HashMap<&'static str, ProtocolKind>> = LazyLock::new(|| {
    HashMap::from([
        ("origin", ProtocolKind::Origin),
        ("auth_sha1_v4", ProtocolKind::AuthSha1V4),
        ("auth_aes128_md5", ProtocolKind::AuthAes128Md5),
        ("auth_chain_a", ProtocolKind::AuthChainA),
        ("auth_chain_b", ProtocolKind::AuthChainB),
    ])
});

#[derive(Debug)]
pub(crate) struct ProtocolBase {
    pub(crate) key: SecretKey,
    pub(crate) param: String,
    pub(crate) tcp_mss: u16,
}

/// A protocol and the state shared by all of its connections.
///
/// Cloning is cheap and the clone shares the session identity, so the
/// connection counter keeps increasing across clones.
#[derive(Clone, Debug)]
pub struct Protocol {
    kind: ProtocolKind,
    base: Arc<ProtocolBase>,
    identity: Arc<SessionIdentity>,
}

impl Protocol {
    /// Looks up the protocol `name`, case-insensitively.
    ///
    /// `key` is the cipher key. `param` is the `protocol-param` string; the
    /// authenticated variants read `uid:password` from it on the client, and
    /// a comma-separated list of such pairs on the server.
    pub fn pick(name: &str, key: &[u8], param: &str) -> Result<Self, Error> {
        let kind = *PROTOCOLS
            .get(name.to_ascii_lowercase().as_str())
            .ok_or_else(|| {
                debug!(name, "unsupported protocol");
                ConfigError::UnsupportedProtocol {
                    name: name.to_owned(),
                }
            })?;
        debug!(protocol = name, "protocol picked");
        Ok(Self::with_kind(kind, key, param))
    }

    pub(crate) fn origin(key: &[u8]) -> Self {
        Self::with_kind(ProtocolKind::Origin, key, "")
    }

    fn with_kind(kind: ProtocolKind, key: &[u8], param: &str) -> Self {
        Self {
            kind,
            base: Arc::new(ProtocolBase {
                key: SecretKey::from(key),
                param: param.to_owned(),
                tcp_mss: DEFAULT_TCP_MSS,
            }),
            identity: Arc::new(SessionIdentity::default()),
        }
    }

    /// The `protocol-param` string.
    pub fn param(&self) -> &str {
        &self.base.param
    }

    /// Whether `a` and `b` stamp their headers from the same client id and
    /// connection counter.
    pub fn shares_identity(a: &Protocol, b: &Protocol) -> bool {
        Arc::ptr_eq(&a.identity, &b.identity)
    }

    /// Creates the client side of a connection. `iv` is the cipher IV this
    /// client sends.
    pub fn clone_for_connection(&self, iv: &[u8]) -> ProtocolFilter {
        self.instantiate(iv, Role::Client, os_seed())
    }

    /// Creates the server side of a connection. `iv` is the client's cipher
    /// IV; pass an empty slice and call [`ProtocolFilter::set_iv`] once it
    /// has been received.
    pub fn clone_for_server_connection(&self, iv: &[u8]) -> ProtocolFilter {
        self.instantiate(iv, Role::Server, os_seed())
    }

    pub(crate) fn instantiate(&self, iv: &[u8], role: Role, seed: [u8; 32]) -> ProtocolFilter {
        let context = Context {
            role,
            iv: iv.to_vec(),
            base: self.base.clone(),
            identity: self.identity.clone(),
            rng: StdRng::from_seed(seed),
            clock: current_timestamp,
        };
        let variant = match self.kind {
            ProtocolKind::Origin => Variant::Origin,
            ProtocolKind::AuthSha1V4 => Variant::AuthSha1V4(AuthSha1V4::new(context)),
            ProtocolKind::AuthAes128Md5 => Variant::AuthAes128Md5(AuthAes128Md5::new(context)),
            ProtocolKind::AuthChainA => {
                Variant::AuthChain(Box::new(AuthChain::new(context, ChainVariant::A)))
            }
            ProtocolKind::AuthChainB => {
                Variant::AuthChain(Box::new(AuthChain::new(context, ChainVariant::B)))
            }
        };
        ProtocolFilter {
            template: self.clone(),
            variant,
        }
    }
}

fn os_seed() -> [u8; 32] {
    let mut seed = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut seed)
        .expect("system random source failure");
    seed
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct ProtocolFilter {
    template: Protocol,
    variant: Variant,
}

#[derive(Debug)]
enum Variant {
    Origin,
    AuthSha1V4(AuthSha1V4),
    AuthAes128Md5(AuthAes128Md5),
    AuthChain(Box<AuthChain>),
}

impl ProtocolFilter {
    /// The template this connection was created from.
    pub fn template(&self) -> &Protocol {
        &self.template
    }

    /// Replaces the client IV that keys the authentication header.
    pub fn set_iv(&mut self, iv: &[u8]) {
        if let Some(context) = self.context_mut() {
            context.iv = iv.to_vec();
        }
    }

    fn context_mut(&mut self) -> Option<&mut Context> {
        match &mut self.variant {
            Variant::Origin => None,
            Variant::AuthSha1V4(filter) => Some(&mut filter.context),
            Variant::AuthAes128Md5(filter) => Some(&mut filter.context),
            Variant::AuthChain(filter) => Some(&mut filter.context),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_clock(mut self, clock: fn() -> u32) -> Self {
        if let Some(context) = self.context_mut() {
            context.clock = clock;
        }
        self
    }
}

impl Filter for ProtocolFilter {
    fn encode(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        match &mut self.variant {
            Variant::Origin => Ok(origin::encode(buf)),
            Variant::AuthSha1V4(filter) => filter.encode(buf),
            Variant::AuthAes128Md5(filter) => filter.encode(buf),
            Variant::AuthChain(filter) => filter.encode(buf),
        }
    }

    fn decode(&mut self, buf: &[u8]) -> Result<Decoded, Error> {
        let decoded = match &mut self.variant {
            Variant::Origin => origin::decode(buf),
            Variant::AuthSha1V4(filter) => filter.decode(buf),
            Variant::AuthAes128Md5(filter) => filter.decode(buf),
            Variant::AuthChain(filter) => filter.decode(buf),
        }?;
        Ok(Decoded::Data(decoded))
    }
}

/// Connection state every authenticated variant carries.
#[derive(Debug)]
pub(crate) struct Context {
    pub(crate) role: Role,
    pub(crate) iv: Vec<u8>,
    pub(crate) base: Arc<ProtocolBase>,
    pub(crate) identity: Arc<SessionIdentity>,
    pub(crate) rng: StdRng,
    pub(crate) clock: fn() -> u32,
}

impl Context {
    /// `IV || key`, the HMAC key of every authentication header.
    pub(crate) fn header_key(&self) -> Vec<u8> {
        [self.iv.as_slice(), self.base.key.as_bytes()].concat()
    }

    pub(crate) fn now(&self) -> u32 {
        (self.clock)()
    }

    pub(crate) fn check_timestamp(&self, timestamp: u32) -> Result<(), Error> {
        if timestamp_is_fresh(timestamp, self.now()) {
            Ok(())
        } else {
            Err(IntegrityError::ExpiredTimestamp {
                received_timestamp: timestamp,
            }
            .into())
        }
    }

    /// The user this client authenticates as, resolved once per template.
    ///
    /// A `uid:password` param yields that uid and `digest(password)` as the
    /// user key; anything else a random uid and the base key.
    pub(crate) fn client_user(&mut self, digest: fn(&[u8]) -> Vec<u8>) -> UserIdentity {
        let Context {
            base, identity, rng, ..
        } = self;
        identity.user(|| match parse_user(&base.param) {
            Some((uid, password)) => UserIdentity {
                uid: uid.to_le_bytes(),
                user_key: SecretKey::from(digest(password.as_bytes())),
            },
            None => {
                let mut uid = [0u8; 4];
                rand::RngCore::fill_bytes(rng, &mut uid);
                UserIdentity {
                    uid,
                    user_key: base.key.clone(),
                }
            }
        })
    }

    /// The key of user `uid` as configured on this server. Without any
    /// configured user every uid maps to the base key.
    pub(crate) fn server_user_key(
        &self,
        uid: u32,
        digest: fn(&[u8]) -> Vec<u8>,
    ) -> Result<SecretKey, Error> {
        let mut users = self.base.param.split(',').filter_map(parse_user).peekable();
        if users.peek().is_none() {
            return Ok(self.base.key.clone());
        }
        users
            .find(|(id, _)| *id == uid)
            .map(|(_, password)| SecretKey::from(digest(password.as_bytes())))
            .ok_or_else(|| IntegrityError::UnknownUser { uid }.into())
    }
}

/// `key || id`, the HMAC key of chunk `id`.
pub(crate) fn chunk_key(user_key: &SecretKey, id: u32) -> SecretKey {
    SecretKey::from([user_key.as_bytes(), &id.to_le_bytes()].concat())
}

/// Key sealing the 16-byte block of an authentication header.
pub(crate) fn header_aes_key(user_key: &SecretKey, salt: &[u8]) -> [u8; 16] {
    let mut password = STANDARD.encode(user_key.as_bytes()).into_bytes();
    password.extend_from_slice(salt);
    let mut key = [0u8; 16];
    key.copy_from_slice(&kdf(&password, 16));
    key
}

pub(crate) fn md5_digest(password: &[u8]) -> Vec<u8> {
    md5(password).to_vec()
}

pub(crate) fn sha1_digest(password: &[u8]) -> Vec<u8> {
    sha1(password).to_vec()
}

fn parse_user(param: &str) -> Option<(u32, &str)> {
    let mut parts = param.split(':');
    let uid = parts.next()?;
    if !uid.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let uid = uid.parse().ok()?;
    let password = parts.next()?;
    Some((uid, password))
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::error::FramingError;

    pub(crate) const KEY: &[u8] = b"0123456789abcdef";
    pub(crate) const IV: &[u8] = &[7u8; 16];

    pub(crate) const NAMES: [&str; 5] = [
        "origin",
        "auth_sha1_v4",
        "auth_aes128_md5",
        "auth_chain_a",
        "auth_chain_b",
    ];

    const SIZES: [usize; 12] = [0, 1, 399, 400, 900, 1199, 1200, 1201, 4095, 4096, 4097, 20000];

    pub(crate) fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    pub(crate) fn pair(name: &str, param: &str) -> (ProtocolFilter, ProtocolFilter) {
        let protocol = Protocol::pick(name, KEY, param).unwrap();
        (
            protocol.instantiate(IV, Role::Client, [1u8; 32]),
            protocol.instantiate(IV, Role::Server, [2u8; 32]),
        )
    }

    pub(crate) fn decode(filter: &mut ProtocolFilter, wire: &[u8]) -> Result<Vec<u8>, Error> {
        match filter.decode(wire)? {
            Decoded::Data(data) => Ok(data),
            Decoded::Sendback => unreachable!(),
        }
    }

    #[test]
    fn test_payload_sizes_both_directions() {
        for name in NAMES {
            let (mut client, mut server) = pair(name, "");
            for size in SIZES {
                let request = payload(size);
                let wire = client.encode(&request).unwrap();
                assert_eq!(decode(&mut server, &wire).unwrap(), request, "{} {}", name, size);
                if size == 0 {
                    continue;
                }

                let response = payload(size + 3);
                let wire = server.encode(&response).unwrap();
                assert_eq!(decode(&mut client, &wire).unwrap(), response, "{} {}", name, size);
            }
        }
    }

    #[test]
    fn test_fresh_connection_per_size() {
        for name in NAMES {
            for size in SIZES {
                let (mut client, mut server) = pair(name, "");
                let request = payload(size);
                let wire = client.encode(&request).unwrap();
                assert_eq!(decode(&mut server, &wire).unwrap(), request, "{} {}", name, size);
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        for name in NAMES {
            let (mut client, mut server) = pair(name, "");
            let request = payload(5000);
            let wire = client.encode(&request).unwrap();
            let mut received = Vec::new();
            for byte in &wire {
                received.extend(decode(&mut server, std::slice::from_ref(byte)).unwrap());
            }
            assert_eq!(received, request, "{}", name);

            let response = payload(3000);
            let wire = server.encode(&response).unwrap();
            let (head, tail) = wire.split_at(wire.len() / 3);
            let mut received = decode(&mut client, head).unwrap();
            received.extend(decode(&mut client, tail).unwrap());
            assert_eq!(received, response, "{}", name);
        }
    }

    #[test]
    fn test_multiple_writes_in_one_read() {
        for name in NAMES {
            let (mut client, mut server) = pair(name, "");
            let mut wire = Vec::new();
            let mut request = Vec::new();
            for size in [10, 2000, 1, 700] {
                wire.extend(client.encode(&payload(size)).unwrap());
                request.extend(payload(size));
            }
            assert_eq!(decode(&mut server, &wire).unwrap(), request, "{}", name);
        }
    }

    #[test]
    fn test_lookup() {
        assert!(Protocol::pick("AUTH_CHAIN_A", KEY, "").is_ok());
        assert!(Protocol::pick("Origin", KEY, "").is_ok());
        assert_eq!(
            Protocol::pick("auth_chain_z", KEY, "").unwrap_err(),
            Error::Config(ConfigError::UnsupportedProtocol {
                name: "auth_chain_z".to_owned()
            })
        );
    }

    #[test]
    fn test_parse_user() {
        assert_eq!(parse_user("1024:secret"), Some((1024, "secret")));
        assert_eq!(parse_user("7:a:b"), Some((7, "a")));
        assert_eq!(parse_user(" 7:a"), None);
        assert_eq!(parse_user("+7:a"), None);
        assert_eq!(parse_user("4294967296:a"), None);
        assert_eq!(parse_user("secret"), None);
        assert_eq!(parse_user("x:secret"), None);
        assert_eq!(parse_user(""), None);
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        for name in &NAMES[1..] {
            let (client, mut server) = pair(name, "");
            let mut client = client.with_clock(|| current_timestamp() - 2 * 86_400);
            let wire = client.encode(&payload(100)).unwrap();
            assert!(
                matches!(
                    decode(&mut server, &wire).unwrap_err(),
                    Error::Integrity(IntegrityError::ExpiredTimestamp { .. })
                ),
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_users() {
        for name in ["auth_aes128_md5", "auth_chain_a", "auth_chain_b"] {
            let client = Protocol::pick(name, KEY, "1000:alpha").unwrap();
            let mut client = client.instantiate(IV, Role::Client, [1u8; 32]);
            let wire = client.encode(&payload(64)).unwrap();

            let server = Protocol::pick(name, KEY, "999:beta,1000:alpha").unwrap();
            let mut server = server.instantiate(IV, Role::Server, [2u8; 32]);
            assert_eq!(decode(&mut server, &wire).unwrap(), payload(64), "{}", name);

            let server = Protocol::pick(name, KEY, "1001:alpha").unwrap();
            let mut server = server.instantiate(IV, Role::Server, [2u8; 32]);
            assert_eq!(
                decode(&mut server, &wire).unwrap_err(),
                Error::Integrity(IntegrityError::UnknownUser { uid: 1000 }),
                "{}",
                name
            );

            let server = Protocol::pick(name, KEY, "1000:gamma").unwrap();
            let mut server = server.instantiate(IV, Role::Server, [2u8; 32]);
            assert!(
                matches!(
                    decode(&mut server, &wire).unwrap_err(),
                    Error::Integrity(_) | Error::Framing(_)
                ),
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_header_keyed_by_iv() {
        for name in &NAMES[1..] {
            let (mut client, mut server) = pair(name, "");
            server.set_iv(&[8u8; 16]);
            let wire = client.encode(&payload(100)).unwrap();
            assert!(
                matches!(decode(&mut server, &wire).unwrap_err(), Error::Integrity(_)),
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_server_learns_iv_late() {
        for name in &NAMES[1..] {
            let protocol = Protocol::pick(name, KEY, "").unwrap();
            let mut client = protocol.clone_for_connection(IV);
            let mut server = protocol.clone_for_server_connection(&[]);
            server.set_iv(IV);
            let wire = client.encode(&payload(100)).unwrap();
            assert_eq!(decode(&mut server, &wire).unwrap(), payload(100), "{}", name);
        }
    }

    #[test]
    fn test_error_discards_buffered_bytes() {
        for name in &NAMES[1..] {
            let (mut client, mut server) = pair(name, "");
            let wire = client.encode(&payload(100)).unwrap();
            let mut tampered = wire.clone();
            let last = tampered.len() - 1;
            tampered[last] ^= 0x01;
            assert!(decode(&mut server, &tampered).is_err(), "{}", name);
            // The rejected bytes are not replayed into the next decode.
            assert!(decode(&mut server, &[]).unwrap().is_empty(), "{}", name);
        }
    }

    #[test]
    fn test_connection_counter_shared() {
        let protocol = Protocol::pick("auth_sha1_v4", KEY, "").unwrap();
        let clone = protocol.clone();
        assert!(Protocol::shares_identity(&protocol, &clone));
        let other = Protocol::pick("auth_sha1_v4", KEY, "").unwrap();
        assert!(!Protocol::shares_identity(&protocol, &other));
    }

    /// Flips one bit at each of `positions` and expects the server either to
    /// fail or to deliver a strict prefix of the request.
    pub(crate) fn assert_flips_detected(
        name: &str,
        request: &[u8],
        positions: impl Fn(&[u8]) -> Vec<usize>,
    ) {
        // Padding may depend on the header time, so every encoding shares one.
        let client = || pair(name, "").0.with_clock(|| current_timestamp() / 86_400 * 86_400);
        let wire = client().encode(request).unwrap();
        for i in positions(&wire) {
            let (_, mut server) = pair(name, "");
            let mut tampered = client().encode(request).unwrap();
            tampered[i] ^= 0x01;
            match decode(&mut server, &tampered) {
                Err(Error::Integrity(_)) | Err(Error::Framing(_)) => {}
                Err(err) => panic!("{} byte {}: {}", name, i, err),
                Ok(data) => assert!(
                    data.len() < request.len() && request.starts_with(&data),
                    "{} byte {} accepted",
                    name,
                    i
                ),
            }
        }
    }

    #[test]
    fn test_server_encode_before_handshake() {
        for name in ["auth_aes128_md5", "auth_chain_a"] {
            let (_, mut server) = pair(name, "");
            assert_eq!(
                server.encode(b"early").unwrap_err(),
                Error::Framing(FramingError::UnexpectedData)
            );
        }
    }
}
