//! `auth_chain_a` and `auth_chain_b`.
//!
//! Every chunk is tagged with an HMAC-MD5 keyed by its sequence number, and
//! that tag seeds the next chunk of the same direction: it masks the length
//! field and reseeds the [`Shift128Plus`] generator both ends use to agree on
//! the padding length and the payload offset. Payloads are RC4 encrypted
//! with a key bound to the authentication header.
//!
//! The variants differ only in how a padding length is drawn.

use base64::{Engine, engine::general_purpose::STANDARD};
use rand::RngCore;
use tracing::trace;

use super::{Context, Role, chunk_key, header_aes_key, sha1_digest};
use crate::{
    cipher::Keystream,
    crypto::{SecretKey, aes128_cbc_decrypt_block, aes128_cbc_encrypt_block, hmac_md5, kdf},
    error::{Error, FramingError, IntegrityError},
    prng::Shift128Plus,
    wire::{
        CHAIN_A_SALT, CHAIN_AUTH_HEAD_LEN, CHAIN_B_SALT, CHAIN_FIRST_CHUNK_LEN,
        CHAIN_MAX_FRAME_LEN, CHAIN_OVERHEAD, MAX_TCP_MSS,
    },
};

/// Payloads above this length are never padded.
const MAX_PADDED_LEN: usize = 1440;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ChainVariant {
    A,
    B,
}

/// Padding length generator of one connection.
#[derive(Debug)]
enum RandLen {
    A,
    /// Sorted frame-size buckets derived from the base key.
    B {
        sizes: Vec<usize>,
        sizes2: Vec<usize>,
    },
}

impl RandLen {
    fn new(variant: ChainVariant, key: &[u8]) -> Self {
        match variant {
            ChainVariant::A => RandLen::A,
            ChainVariant::B => {
                let mut random = Shift128Plus::default();
                random.init_from_bin(key);
                let count = random.next() % 8 + 4;
                let sizes = bucket_list(&mut random, count);
                let count = random.next() % 16 + 8;
                let sizes2 = bucket_list(&mut random, count);
                RandLen::B { sizes, sizes2 }
            }
        }
    }

    fn get(&self, data_len: usize, random: &mut Shift128Plus, last_hash: &[u8; 16]) -> usize {
        if data_len > MAX_PADDED_LEN {
            return 0;
        }
        random.init_from_bin_datalen(last_hash, data_len);
        if let RandLen::B { sizes, sizes2 } = self {
            let target = data_len + CHAIN_OVERHEAD;

            let pos = sizes.partition_point(|size| *size < target);
            let final_pos = pos as u64 + random.next() % sizes.len() as u64;
            if final_pos < sizes.len() as u64 {
                return sizes[final_pos as usize] - target;
            }

            let pos = sizes2.partition_point(|size| *size < target);
            let final_pos = pos as u64 + random.next() % sizes2.len() as u64;
            if final_pos < sizes2.len() as u64 {
                return sizes2[final_pos as usize] - target;
            }
            if final_pos < (pos + sizes2.len() - 1) as u64 {
                return 0;
            }
        }
        let modulus = if data_len > 1300 {
            31
        } else if data_len > 900 {
            127
        } else if data_len > 400 {
            521
        } else {
            1021
        };
        (random.next() % modulus) as usize
    }
}

fn bucket_list(random: &mut Shift128Plus, count: u64) -> Vec<usize> {
    let mut list: Vec<usize> = (0..count)
        .map(|_| (random.next() % 2340 % 2040 % 1440) as usize)
        .collect();
    list.sort_unstable();
    list
}

/// Offset of the payload within the padding.
fn rand_start_pos(random: &mut Shift128Plus, rand_len: usize) -> usize {
    if rand_len > 0 {
        (random.next() % 8_589_934_609 % rand_len as u64) as usize
    } else {
        0
    }
}

/// Chain state of one direction.
#[derive(Debug, Default)]
struct Direction {
    last_hash: [u8; 16],
    random: Shift128Plus,
    keystream: Option<Keystream>,
    /// Sequence number of the next chunk.
    id: u32,
}

#[derive(Debug)]
pub(crate) struct AuthChain {
    pub(super) context: Context,
    salt: &'static [u8],
    rand_len: RandLen,
    /// Set once the authentication header was sent, or verified.
    user_key: Option<SecretKey>,
    send: Direction,
    recv: Direction,
    tcp_mss: u16,
    recv_buf: Vec<u8>,
}

impl AuthChain {
    pub(super) fn new(context: Context, variant: ChainVariant) -> Self {
        let rand_len = RandLen::new(variant, context.base.key.as_bytes());
        let tcp_mss = context.base.tcp_mss;
        Self {
            context,
            salt: match variant {
                ChainVariant::A => CHAIN_A_SALT,
                ChainVariant::B => CHAIN_B_SALT,
            },
            rand_len,
            user_key: None,
            send: Direction {
                id: 1,
                ..Default::default()
            },
            recv: Direction {
                id: 1,
                ..Default::default()
            },
            tcp_mss,
            recv_buf: Vec::new(),
        }
    }

    fn unit_len(&self) -> usize {
        self.tcp_mss as usize - CHAIN_OVERHEAD
    }

    pub(super) fn encode(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        if buf.is_empty() {
            return Ok(out);
        }
        let mut first = None;
        let mut data = buf;
        let prefixed;
        match (self.context.role, self.user_key.is_some()) {
            (Role::Client, false) => {
                let head_len = buf.len().min(CHAIN_FIRST_CHUNK_LEN);
                out.extend(self.pack_auth_data());
                first = Some(&buf[..head_len]);
                data = &buf[head_len..];
            }
            (Role::Server, true) if self.send.id == 1 => {
                prefixed = [&self.tcp_mss.to_le_bytes()[..], buf].concat();
                data = &prefixed;
            }
            _ => {}
        }
        let Some(user_key) = self.user_key.clone() else {
            return Err(FramingError::UnexpectedData.into());
        };

        if let Some(first) = first {
            out.extend(self.pack_data(&user_key, first));
        }
        let unit_len = self.unit_len();
        for chunk in data.chunks(unit_len) {
            out.extend(self.pack_data(&user_key, chunk));
        }
        Ok(out)
    }

    pub(super) fn decode(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        self.recv_buf.extend_from_slice(buf);
        let mut out = Vec::new();
        let result = self.decode_buffered(&mut out);
        if result.is_err() {
            self.recv_buf.clear();
        }
        result.map(|_| out)
    }

    fn decode_buffered(&mut self, out: &mut Vec<u8>) -> Result<(), Error> {
        if self.user_key.is_none() {
            match self.context.role {
                Role::Server => {
                    if !self.decode_auth_data()? {
                        return Ok(());
                    }
                }
                Role::Client if self.recv_buf.is_empty() => return Ok(()),
                Role::Client => return Err(FramingError::UnexpectedData.into()),
            }
        }
        let Some(user_key) = self.user_key.clone() else {
            return Ok(());
        };

        let mut pos = 0;
        while self.recv_buf.len() - pos > 4 {
            let frame = &self.recv_buf[pos..];
            let recv = &mut self.recv;
            let data_len = (u16::from_le_bytes([frame[0], frame[1]])
                ^ u16::from_le_bytes([recv.last_hash[14], recv.last_hash[15]]))
                as usize;
            let rand_len = self
                .rand_len
                .get(data_len, &mut recv.random, &recv.last_hash);
            let len = rand_len + data_len;
            if len >= CHAIN_MAX_FRAME_LEN {
                return Err(FramingError::LengthInvalid { received: len }.into());
            }
            let len = len + CHAIN_OVERHEAD;
            if len > frame.len() {
                break;
            }

            let key = chunk_key(&user_key, recv.id);
            let hash = hmac_md5(key.as_bytes(), &frame[..len - 2]);
            if hash[..2] != frame[len - 2..len] {
                return Err(IntegrityError::HmacMismatch.into());
            }
            let data_pos = if data_len > 0 && rand_len > 0 {
                2 + rand_start_pos(&mut recv.random, rand_len)
            } else {
                2
            };
            let mut data = frame[data_pos..data_pos + data_len].to_vec();
            if let Some(keystream) = &mut recv.keystream {
                keystream.apply(&mut data);
            }
            recv.last_hash = hash;
            recv.id += 1;

            if self.context.role == Role::Client && recv.id == 2 {
                let mss = match data.get(..2) {
                    Some(mss) => u16::from_le_bytes([mss[0], mss[1]]),
                    None => 0,
                };
                if mss <= CHAIN_OVERHEAD as u16 || mss > MAX_TCP_MSS {
                    return Err(FramingError::TcpMssInvalid { received: mss }.into());
                }
                self.tcp_mss = mss;
                trace!(mss, "server tcp mss adopted");
                data.drain(..2);
            }
            out.extend(data);
            pos += len;
        }
        self.recv_buf.drain(..pos);
        Ok(())
    }

    fn pack_data(&mut self, user_key: &SecretKey, data: &[u8]) -> Vec<u8> {
        let send = &mut self.send;
        let rand_len = self
            .rand_len
            .get(data.len(), &mut send.random, &send.last_hash);
        let out_len = rand_len + data.len() + 2;
        let mut ret = vec![0u8; out_len + 2];

        let mask = u16::from_le_bytes([send.last_hash[14], send.last_hash[15]]);
        ret[..2].copy_from_slice(&(data.len() as u16 ^ mask).to_le_bytes());
        let rng = &mut self.context.rng;
        if data.is_empty() {
            rng.fill_bytes(&mut ret[2..2 + rand_len]);
        } else {
            let start = 2 + rand_start_pos(&mut send.random, rand_len);
            let end = start + data.len();
            rng.fill_bytes(&mut ret[2..start]);
            ret[start..end].copy_from_slice(data);
            if let Some(keystream) = &mut send.keystream {
                keystream.apply(&mut ret[start..end]);
            }
            rng.fill_bytes(&mut ret[end..out_len]);
        }

        let key = chunk_key(user_key, send.id);
        let hash = hmac_md5(key.as_bytes(), &ret[..out_len]);
        ret[out_len..].copy_from_slice(&hash[..2]);
        send.last_hash = hash;
        send.id += 1;
        ret
    }

    /// Builds the authentication header and starts both chains.
    fn pack_auth_data(&mut self) -> [u8; CHAIN_AUTH_HEAD_LEN] {
        let mut header = [0u8; CHAIN_AUTH_HEAD_LEN];
        let connection = self.context.identity.next_connection(&mut self.context.rng);
        let user = self.context.client_user(sha1_digest);

        self.context.rng.fill_bytes(&mut header[..4]);
        let client_hash = hmac_md5(&self.context.header_key(), &header[..4]);
        header[4..12].copy_from_slice(&client_hash[..8]);

        for (i, byte) in user.uid.iter().enumerate() {
            header[12 + i] = byte ^ client_hash[8 + i];
        }
        let mut head = [0u8; 16];
        head[..4].copy_from_slice(&self.context.now().to_le_bytes());
        head[4..8].copy_from_slice(&connection.client_id[..4]);
        head[8..12].copy_from_slice(&connection.connection_id.to_le_bytes());
        head[12..14].copy_from_slice(&(CHAIN_OVERHEAD as u16).to_le_bytes());
        aes128_cbc_encrypt_block(&header_aes_key(&user.user_key, self.salt), &mut head);
        header[16..32].copy_from_slice(&head);

        let server_hash = hmac_md5(user.user_key.as_bytes(), &header[12..32]);
        header[32..36].copy_from_slice(&server_hash[..4]);

        self.start_chain(user.user_key, client_hash, server_hash);
        trace!(connection_id = connection.connection_id, "auth header sent");
        header
    }

    /// Verifies and consumes the authentication header. Returns `false` when
    /// more bytes are needed.
    fn decode_auth_data(&mut self) -> Result<bool, Error> {
        let buf = &self.recv_buf;
        if buf.len() < CHAIN_AUTH_HEAD_LEN {
            return Ok(false);
        }
        let client_hash = hmac_md5(&self.context.header_key(), &buf[..4]);
        if client_hash[..8] != buf[4..12] {
            return Err(IntegrityError::HeaderHmacMismatch.into());
        }
        let uid = u32::from_le_bytes(std::array::from_fn(|i| buf[12 + i] ^ client_hash[8 + i]));
        let user_key = self.context.server_user_key(uid, sha1_digest)?;
        let server_hash = hmac_md5(user_key.as_bytes(), &buf[12..32]);
        if server_hash[..4] != buf[32..36] {
            return Err(IntegrityError::HeaderHmacMismatch.into());
        }

        let mut head: [u8; 16] = buf[16..32].try_into().unwrap();
        aes128_cbc_decrypt_block(&header_aes_key(&user_key, self.salt), &mut head);
        let timestamp = u32::from_le_bytes(head[..4].try_into().unwrap());
        self.context.check_timestamp(timestamp)?;

        self.recv_buf.drain(..CHAIN_AUTH_HEAD_LEN);
        self.start_chain(user_key, client_hash, server_hash);
        trace!(uid, "auth header accepted");
        Ok(true)
    }

    /// Seeds both directions from the header hashes and keys the RC4 streams.
    fn start_chain(&mut self, user_key: SecretKey, client_hash: [u8; 16], server_hash: [u8; 16]) {
        let mut password = STANDARD.encode(user_key.as_bytes());
        password.push_str(&STANDARD.encode(client_hash));
        let mut rc4_key = [0u8; 16];
        rc4_key.copy_from_slice(&kdf(password.as_bytes(), 16));

        let (send_hash, recv_hash) = match self.context.role {
            Role::Client => (client_hash, server_hash),
            Role::Server => (server_hash, client_hash),
        };
        self.send.last_hash = send_hash;
        self.recv.last_hash = recv_hash;
        self.send.keystream = Some(Keystream::rc4(&rc4_key));
        self.recv.keystream = Some(Keystream::rc4(&rc4_key));
        self.user_key = Some(user_key);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        conn::Filter,
        protocol::{
            Protocol, ProtocolFilter, Variant,
            test::{IV, KEY, assert_flips_detected, decode, pair, payload},
        },
    };

    fn chain(filter: &ProtocolFilter) -> &AuthChain {
        match &filter.variant {
            Variant::AuthChain(chain) => chain,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_rand_start_pos() {
        let mut random = Shift128Plus::default();
        assert_eq!(rand_start_pos(&mut random, 0), 0);
        random.init_from_bin(&[1]);
        for rand_len in [1, 2, 100, 1020] {
            assert!(rand_start_pos(&mut random, rand_len) < rand_len);
        }
    }

    #[test]
    fn test_chain_a_bands() {
        let rand_len = RandLen::new(ChainVariant::A, KEY);
        let mut random = Shift128Plus::default();
        let hash = [0x5a; 16];
        assert_eq!(rand_len.get(1441, &mut random, &hash), 0);
        for (data_len, modulus) in [(0, 1021), (400, 1021), (401, 521), (901, 127), (1301, 31), (1440, 31)] {
            let got = rand_len.get(data_len, &mut random, &hash);
            assert!(got < modulus, "{} {}", data_len, got);

            // Both ends reach the same value from the same hash.
            let mut other = Shift128Plus::default();
            assert_eq!(rand_len.get(data_len, &mut other, &hash), got);

            let mut expect = Shift128Plus::default();
            expect.init_from_bin_datalen(&hash, data_len);
            assert_eq!(got as u64, expect.next() % modulus as u64);
        }
    }

    #[test]
    fn test_chain_b_buckets() {
        let RandLen::B { sizes, sizes2 } = RandLen::new(ChainVariant::B, KEY) else {
            unreachable!()
        };
        assert!((4..12).contains(&sizes.len()));
        assert!((8..24).contains(&sizes2.len()));
        assert!(sizes.is_sorted() && sizes2.is_sorted());
        assert!(sizes.iter().chain(&sizes2).all(|size| *size < 1440));

        let mut random = Shift128Plus::default();
        random.init_from_bin(KEY);
        let count = random.next() % 8 + 4;
        assert_eq!(sizes.len() as u64, count);

        // Derived from the key only.
        let RandLen::B { sizes: again, .. } = RandLen::new(ChainVariant::B, KEY) else {
            unreachable!()
        };
        assert_eq!(sizes, again);
    }

    #[test]
    fn test_chain_b_padding_lands_on_buckets() {
        let rand_len = RandLen::new(ChainVariant::B, KEY);
        let RandLen::B { sizes, sizes2 } = &rand_len else {
            unreachable!()
        };
        let mut random = Shift128Plus::default();
        let mut hits = 0;
        for seed in 0..64u8 {
            let hash = [seed; 16];
            for data_len in [0, 10, 300, 1000, 1400] {
                let got = rand_len.get(data_len, &mut random, &hash);
                let total = got + data_len + CHAIN_OVERHEAD;
                if sizes.contains(&total) || sizes2.contains(&total) {
                    hits += 1;
                } else {
                    assert!(got < 1021, "{} {}", data_len, got);
                }
            }
        }
        assert!(hits > 0);
    }

    #[test]
    fn test_auth_header_starts_matching_chains() {
        for name in ["auth_chain_a", "auth_chain_b"] {
            let (mut client, mut server) = pair(name, "");
            let wire = client.encode(&payload(10)).unwrap();
            assert_eq!(decode(&mut server, &wire).unwrap(), payload(10));

            let (client, server) = (chain(&client), chain(&server));
            assert_eq!(client.user_key, server.user_key);
            assert_eq!(client.send.last_hash, server.recv.last_hash);
            assert_eq!(client.recv.last_hash, server.send.last_hash);
            assert_eq!(client.send.id, 2);
            assert_eq!(server.recv.id, 2);
        }
    }

    #[test]
    fn test_auth_header_layout() {
        let protocol = Protocol::pick("auth_chain_a", KEY, "1000:alpha").unwrap();
        let mut client = protocol.instantiate(IV, Role::Client, [1u8; 32]);
        let wire = client.encode(&payload(10)).unwrap();

        let header_key = [IV, KEY].concat();
        let client_hash = hmac_md5(&header_key, &wire[..4]);
        assert_eq!(wire[4..12], client_hash[..8]);
        let uid: [u8; 4] = std::array::from_fn(|i| wire[12 + i] ^ client_hash[8 + i]);
        assert_eq!(u32::from_le_bytes(uid), 1000);

        let user_key = SecretKey::from(sha1_digest(b"alpha"));
        let server_hash = hmac_md5(user_key.as_bytes(), &wire[12..32]);
        assert_eq!(wire[32..36], server_hash[..4]);

        let mut head: [u8; 16] = wire[16..32].try_into().unwrap();
        aes128_cbc_decrypt_block(&header_aes_key(&user_key, CHAIN_A_SALT), &mut head);
        assert_eq!(head[12..16], [4u8, 0, 0, 0]);

        // The first chunk's length is masked with the client hash.
        let chunk = &wire[CHAIN_AUTH_HEAD_LEN..];
        let mask = u16::from_le_bytes([client_hash[14], client_hash[15]]);
        assert_eq!(u16::from_le_bytes([chunk[0], chunk[1]]) ^ mask, 10);
    }

    #[test]
    fn test_server_announces_tcp_mss() {
        let (mut client, mut server) = pair("auth_chain_a", "");
        let request = payload(3000);
        let wire = client.encode(&request).unwrap();
        assert_eq!(decode(&mut server, &wire).unwrap(), request);

        chain_mut(&mut server).tcp_mss = 1000;
        let wire = server.encode(&payload(5)).unwrap();
        assert_eq!(decode(&mut client, &wire).unwrap(), payload(5));
        assert_eq!(chain(&client).tcp_mss, 1000);
        assert_eq!(chain(&client).unit_len(), 996);

        // Later chunks carry no MSS.
        let wire = server.encode(&payload(7)).unwrap();
        assert_eq!(decode(&mut client, &wire).unwrap(), payload(7));
    }

    fn chain_mut(filter: &mut ProtocolFilter) -> &mut AuthChain {
        match &mut filter.variant {
            Variant::AuthChain(chain) => chain,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_invalid_tcp_mss_rejected() {
        for mss in [0u16, 4, 1501] {
            let (mut client, mut server) = pair("auth_chain_b", "");
            let wire = client.encode(&payload(10)).unwrap();
            decode(&mut server, &wire).unwrap();

            // Pack the raw value as the whole first server chunk.
            let server = chain_mut(&mut server);
            let user_key = server.user_key.clone().unwrap();
            let wire = server.pack_data(&user_key, &mss.to_le_bytes());
            assert_eq!(
                decode(&mut client, &wire).unwrap_err(),
                Error::Framing(FramingError::TcpMssInvalid { received: mss })
            );
        }
    }

    #[test]
    fn test_client_decode_before_header() {
        let (mut client, _) = pair("auth_chain_a", "");
        assert!(decode(&mut client, &[]).unwrap().is_empty());
        assert_eq!(
            decode(&mut client, &[1, 2, 3]).unwrap_err(),
            Error::Framing(FramingError::UnexpectedData)
        );
    }

    #[test]
    fn test_oversized_length_rejected() {
        let (mut client, mut server) = pair("auth_chain_a", "");
        let mut wire = client.encode(&payload(10)).unwrap();
        let client_hash = hmac_md5(&[IV, KEY].concat(), &wire[..4]);
        let masked = 0xFFFF ^ u16::from_le_bytes([client_hash[14], client_hash[15]]);
        wire[CHAIN_AUTH_HEAD_LEN..CHAIN_AUTH_HEAD_LEN + 2].copy_from_slice(&masked.to_le_bytes());
        assert_eq!(
            decode(&mut server, &wire).unwrap_err(),
            Error::Framing(FramingError::LengthInvalid { received: 0xFFFF })
        );
    }

    #[test]
    fn test_single_byte_flips() {
        for name in ["auth_chain_a", "auth_chain_b"] {
            assert_flips_detected(name, &payload(3000), |wire| (0..wire.len()).collect());
        }
    }
}
