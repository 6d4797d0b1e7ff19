//! `auth_sha1_v4`: CRC-tagged chunks with an Adler-32 trailer, preceded by
//! one HMAC-SHA1 authenticated header from the client.

use rand::{Rng, RngCore};
use tracing::trace;

use super::{Context, Role};
use crate::{
    crypto::hmac_sha1,
    error::{Error, FramingError, IntegrityError},
    wire::{
        BLOCK_LEN, CHUNK_MAX_LEN, CHUNK_MIN_LEN, SHA1_V4_AUTH_FIELDS_LEN, SHA1_V4_AUTH_OFFSET,
        SHA1_V4_CHUNK_OVERHEAD, SHA1_V4_DEFAULT_HEAD_LEN, SHA1_V4_HMAC_LEN, SHA1_V4_SALT,
        get_pad_len, put_pad_len,
    },
};

/// Shortest authentication header: one padding byte and no payload.
const AUTH_HEAD_MIN_LEN: usize =
    SHA1_V4_AUTH_OFFSET + 1 + SHA1_V4_AUTH_FIELDS_LEN + SHA1_V4_HMAC_LEN;

#[derive(Debug)]
pub(crate) struct AuthSha1V4 {
    pub(super) context: Context,
    /// Client: the header was sent. Server: the header was verified.
    header_done: bool,
    recv_buf: Vec<u8>,
}

impl AuthSha1V4 {
    pub(super) fn new(context: Context) -> Self {
        Self {
            context,
            header_done: false,
            recv_buf: Vec::new(),
        }
    }

    pub(super) fn encode(&mut self, mut buf: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        if self.context.role == Role::Client && !self.header_done && !buf.is_empty() {
            let head_len = head_size(buf, SHA1_V4_DEFAULT_HEAD_LEN).min(buf.len());
            out.extend(self.pack_auth_data(&buf[..head_len]));
            buf = &buf[head_len..];
            self.header_done = true;
        }
        for chunk in buf.chunks(BLOCK_LEN) {
            out.extend(self.pack_data(chunk));
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
        if self.context.role == Role::Server && !self.header_done && !self.decode_auth_data(out)? {
            return Ok(());
        }

        let mut pos = 0;
        while self.recv_buf.len() - pos > 4 {
            let frame = &self.recv_buf[pos..];
            let crc = length_crc(&frame[..2]);
            if u16::from_le_bytes([frame[2], frame[3]]) != crc {
                return Err(IntegrityError::LengthTagMismatch.into());
            }
            let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
            if !(CHUNK_MIN_LEN..CHUNK_MAX_LEN).contains(&len) {
                return Err(FramingError::LengthInvalid { received: len }.into());
            }
            if len > frame.len() {
                break;
            }
            let adler = u32::from_le_bytes(frame[len - 4..len].try_into().unwrap());
            if adler::adler32_slice(&frame[..len - 4]) != adler {
                return Err(IntegrityError::ChecksumMismatch.into());
            }
            let pad_len = get_pad_len(&frame[4..], true);
            if pad_len == 0 || pad_len + 4 > len - 4 {
                return Err(FramingError::PaddingInvalid { received: pad_len }.into());
            }
            out.extend_from_slice(&frame[pad_len + 4..len - 4]);
            pos += len;
        }
        self.recv_buf.drain(..pos);
        Ok(())
    }

    fn pad_len(&mut self, data_len: usize) -> usize {
        if data_len > 1300 {
            1
        } else if data_len > 400 {
            1 + self.context.rng.random_range(0..128)
        } else {
            1 + self.context.rng.random_range(0..1024)
        }
    }

    fn pack_data(&mut self, data: &[u8]) -> Vec<u8> {
        let pad_len = self.pad_len(data.len());
        let len = pad_len + data.len() + SHA1_V4_CHUNK_OVERHEAD;
        let mut ret = vec![0u8; len];

        ret[..2].copy_from_slice(&(len as u16).to_be_bytes());
        let crc = length_crc(&ret[..2]);
        ret[2..4].copy_from_slice(&crc.to_le_bytes());
        self.context.rng.fill_bytes(&mut ret[4..4 + pad_len]);
        put_pad_len(&mut ret[4..], pad_len, true);
        ret[4 + pad_len..len - 4].copy_from_slice(data);
        let adler = adler::adler32_slice(&ret[..len - 4]);
        ret[len - 4..].copy_from_slice(&adler.to_le_bytes());
        ret
    }

    fn pack_auth_data(&mut self, data: &[u8]) -> Vec<u8> {
        let pad_len = self.pad_len(data.len());
        let offset = SHA1_V4_AUTH_OFFSET + pad_len;
        let len = offset + SHA1_V4_AUTH_FIELDS_LEN + data.len() + SHA1_V4_HMAC_LEN;
        let mut ret = vec![0u8; len];

        ret[..2].copy_from_slice(&(len as u16).to_be_bytes());
        let header_crc = self.header_crc(&ret[..2]);
        ret[2..6].copy_from_slice(&header_crc.to_le_bytes());
        self.context
            .rng
            .fill_bytes(&mut ret[SHA1_V4_AUTH_OFFSET..offset]);
        put_pad_len(&mut ret[SHA1_V4_AUTH_OFFSET..], pad_len, true);

        let connection = self.context.identity.next_connection(&mut self.context.rng);
        ret[offset..offset + 4].copy_from_slice(&self.context.now().to_le_bytes());
        ret[offset + 4..offset + 8].copy_from_slice(&connection.client_id[..4]);
        ret[offset + 8..offset + 12].copy_from_slice(&connection.connection_id.to_le_bytes());
        ret[offset + SHA1_V4_AUTH_FIELDS_LEN..len - SHA1_V4_HMAC_LEN].copy_from_slice(data);

        let hmac = hmac_sha1(&self.context.header_key(), &ret[..len - SHA1_V4_HMAC_LEN]);
        ret[len - SHA1_V4_HMAC_LEN..].copy_from_slice(&hmac[..SHA1_V4_HMAC_LEN]);
        trace!(len, connection_id = connection.connection_id, "auth header sent");
        ret
    }

    /// Verifies and consumes the authentication header. Returns `false` when
    /// more bytes are needed.
    fn decode_auth_data(&mut self, out: &mut Vec<u8>) -> Result<bool, Error> {
        let buf = &self.recv_buf;
        if buf.len() < SHA1_V4_AUTH_OFFSET {
            return Ok(false);
        }
        let crc = u32::from_le_bytes(buf[2..6].try_into().unwrap());
        if self.header_crc(&buf[..2]) != crc {
            return Err(IntegrityError::HeaderCrcMismatch.into());
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if !(AUTH_HEAD_MIN_LEN..CHUNK_MAX_LEN).contains(&len) {
            return Err(FramingError::LengthInvalid { received: len }.into());
        }
        if len > buf.len() {
            return Ok(false);
        }

        let hmac = hmac_sha1(&self.context.header_key(), &buf[..len - SHA1_V4_HMAC_LEN]);
        if hmac[..SHA1_V4_HMAC_LEN] != buf[len - SHA1_V4_HMAC_LEN..len] {
            return Err(IntegrityError::HeaderHmacMismatch.into());
        }
        let pad_len = get_pad_len(&buf[SHA1_V4_AUTH_OFFSET..], true);
        let offset = SHA1_V4_AUTH_OFFSET + pad_len;
        if pad_len == 0 || offset + SHA1_V4_AUTH_FIELDS_LEN > len - SHA1_V4_HMAC_LEN {
            return Err(FramingError::PaddingInvalid { received: pad_len }.into());
        }
        let timestamp = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        self.context.check_timestamp(timestamp)?;

        out.extend_from_slice(&buf[offset + SHA1_V4_AUTH_FIELDS_LEN..len - SHA1_V4_HMAC_LEN]);
        self.recv_buf.drain(..len);
        self.header_done = true;
        trace!(len, "auth header accepted");
        Ok(true)
    }

    /// CRC32 of `len || salt || key`.
    fn header_crc(&self, len: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(len);
        hasher.update(SHA1_V4_SALT);
        hasher.update(self.context.base.key.as_bytes());
        hasher.finalize()
    }
}

/// Low 16 bits of the CRC32 of a chunk's big-endian length field.
fn length_crc(len: &[u8]) -> u16 {
    crc32fast::hash(len) as u16
}

/// Length of the SOCKS5 address at the front of `data`, which is all the
/// authentication header carries.
fn head_size(data: &[u8], default: usize) -> usize {
    if data.len() < 2 {
        return default;
    }
    match data[0] & 0x07 {
        // IPv4 + port
        1 => 7,
        // IPv6 + port
        4 => 19,
        // length-prefixed domain + port
        3 => 4 + data[1] as usize,
        _ => default,
    }
}
