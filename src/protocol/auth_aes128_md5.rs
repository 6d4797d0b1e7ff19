//! `auth_aes128_md5`: HMAC-MD5 tagged chunks keyed by their sequence
//! number, preceded by one AES sealed authentication header from the client.

use rand::{Rng, RngCore};
use tracing::trace;

use super::{Context, Role, chunk_key, header_aes_key, md5_digest};
use crate::{
    crypto::{SecretKey, aes128_cbc_decrypt_block, aes128_cbc_encrypt_block, hmac_md5},
    error::{Error, FramingError, IntegrityError},
    wire::{
        AES128_AUTH_HEAD_LEN, AES128_CHUNK_OVERHEAD, AES128_FIRST_CHUNK_LEN, AES128_MD5_SALT,
        BLOCK_LEN, CHUNK_MAX_LEN, CHUNK_MIN_LEN, get_pad_len, put_pad_len,
    },
};

#[derive(Debug)]
pub(crate) struct AuthAes128Md5 {
    pub(super) context: Context,
    header_done: bool,
    user_key: Option<SecretKey>,
    pack_id: u32,
    recv_id: u32,
    recv_buf: Vec<u8>,
}

impl AuthAes128Md5 {
    pub(super) fn new(context: Context) -> Self {
        Self {
            context,
            header_done: false,
            user_key: None,
            pack_id: 1,
            recv_id: 1,
            recv_buf: Vec::new(),
        }
    }

    /// The client resolves its user on first use; the server learns it from
    /// the authentication header.
    fn user_key(&mut self) -> Result<SecretKey, Error> {
        if let Some(user_key) = &self.user_key {
            return Ok(user_key.clone());
        }
        match self.context.role {
            Role::Client => {
                let user_key = self.context.client_user(md5_digest).user_key;
                self.user_key = Some(user_key.clone());
                Ok(user_key)
            }
            Role::Server => Err(FramingError::UnexpectedData.into()),
        }
    }

    pub(super) fn encode(&mut self, mut buf: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        if buf.is_empty() {
            return Ok(out);
        }
        if self.context.role == Role::Client && !self.header_done {
            let head_len = buf.len().min(AES128_FIRST_CHUNK_LEN);
            out.extend(self.pack_auth_data(&buf[..head_len]));
            buf = &buf[head_len..];
            self.header_done = true;
        }
        if buf.is_empty() {
            return Ok(out);
        }
        let user_key = self.user_key()?;
        for chunk in buf.chunks(BLOCK_LEN) {
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
        if self.context.role == Role::Server && !self.header_done && !self.decode_auth_data(out)? {
            return Ok(());
        }
        if self.recv_buf.len() <= 4 {
            return Ok(());
        }

        let user_key = self.user_key()?;
        let mut pos = 0;
        while self.recv_buf.len() - pos > 4 {
            let frame = &self.recv_buf[pos..];
            let key = chunk_key(&user_key, self.recv_id);
            if hmac_md5(key.as_bytes(), &frame[..2])[..2] != frame[2..4] {
                return Err(IntegrityError::LengthTagMismatch.into());
            }
            let len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
            if !(CHUNK_MIN_LEN..CHUNK_MAX_LEN).contains(&len) {
                return Err(FramingError::LengthInvalid { received: len }.into());
            }
            if len > frame.len() {
                break;
            }
            if hmac_md5(key.as_bytes(), &frame[..len - 4])[..4] != frame[len - 4..len] {
                return Err(IntegrityError::HmacMismatch.into());
            }
            let pad_len = get_pad_len(&frame[4..], false);
            if pad_len == 0 || pad_len + 4 > len - 4 {
                return Err(FramingError::PaddingInvalid { received: pad_len }.into());
            }
            out.extend_from_slice(&frame[pad_len + 4..len - 4]);
            self.recv_id += 1;
            pos += len;
        }
        self.recv_buf.drain(..pos);
        Ok(())
    }

    fn pack_data(&mut self, user_key: &SecretKey, data: &[u8]) -> Vec<u8> {
        let rng = &mut self.context.rng;
        let pad_len = if data.len() > 1200 {
            1
        } else if self.pack_id > 4 {
            1 + rng.random_range(0..32)
        } else if data.len() > 900 {
            1 + rng.random_range(0..128)
        } else {
            1 + rng.random_range(0..512)
        };
        let len = pad_len + data.len() + AES128_CHUNK_OVERHEAD;
        let mut ret = vec![0u8; len];
        let key = chunk_key(user_key, self.pack_id);

        ret[..2].copy_from_slice(&(len as u16).to_le_bytes());
        let tag = hmac_md5(key.as_bytes(), &ret[..2]);
        ret[2..4].copy_from_slice(&tag[..2]);
        rng.fill_bytes(&mut ret[4..4 + pad_len]);
        put_pad_len(&mut ret[4..], pad_len, false);
        ret[4 + pad_len..len - 4].copy_from_slice(data);
        let tag = hmac_md5(key.as_bytes(), &ret[..len - 4]);
        ret[len - 4..].copy_from_slice(&tag[..4]);

        self.pack_id += 1;
        ret
    }

    fn pack_auth_data(&mut self, data: &[u8]) -> Vec<u8> {
        let pad_len = if data.len() > 400 {
            self.context.rng.random_range(0..512)
        } else {
            self.context.rng.random_range(0..1024)
        };
        let offset = AES128_AUTH_HEAD_LEN + pad_len;
        let len = offset + data.len() + 4;
        let mut ret = vec![0u8; len];
        self.context
            .rng
            .fill_bytes(&mut ret[AES128_AUTH_HEAD_LEN..offset]);

        let connection = self.context.identity.next_connection(&mut self.context.rng);
        let user = self.context.client_user(md5_digest);
        self.user_key = Some(user.user_key.clone());

        let mut head = [0u8; 16];
        head[..4].copy_from_slice(&self.context.now().to_le_bytes());
        head[4..8].copy_from_slice(&connection.client_id[..4]);
        head[8..12].copy_from_slice(&connection.connection_id.to_le_bytes());
        head[12..14].copy_from_slice(&(len as u16).to_le_bytes());
        head[14..16].copy_from_slice(&(pad_len as u16).to_le_bytes());
        aes128_cbc_encrypt_block(&header_aes_key(&user.user_key, AES128_MD5_SALT), &mut head);

        let header_key = self.context.header_key();
        self.context.rng.fill_bytes(&mut ret[..1]);
        let check = hmac_md5(&header_key, &ret[..1]);
        ret[1..7].copy_from_slice(&check[..6]);
        ret[7..11].copy_from_slice(&user.uid);
        ret[11..27].copy_from_slice(&head);
        let check = hmac_md5(&header_key, &ret[7..27]);
        ret[27..31].copy_from_slice(&check[..4]);

        ret[offset..len - 4].copy_from_slice(data);
        let tag = hmac_md5(user.user_key.as_bytes(), &ret[..len - 4]);
        ret[len - 4..].copy_from_slice(&tag[..4]);
        trace!(len, connection_id = connection.connection_id, "auth header sent");
        ret
    }

    /// Verifies and consumes the authentication header. Returns `false` when
    /// more bytes are needed.
    fn decode_auth_data(&mut self, out: &mut Vec<u8>) -> Result<bool, Error> {
        let buf = &self.recv_buf;
        if buf.len() < AES128_AUTH_HEAD_LEN {
            return Ok(false);
        }
        let header_key = self.context.header_key();
        if hmac_md5(&header_key, &buf[..1])[..6] != buf[1..7]
            || hmac_md5(&header_key, &buf[7..27])[..4] != buf[27..31]
        {
            return Err(IntegrityError::HeaderHmacMismatch.into());
        }

        let uid = u32::from_le_bytes(buf[7..11].try_into().unwrap());
        let user_key = self.context.server_user_key(uid, md5_digest)?;
        let mut head: [u8; 16] = buf[11..27].try_into().unwrap();
        aes128_cbc_decrypt_block(&header_aes_key(&user_key, AES128_MD5_SALT), &mut head);

        let timestamp = u32::from_le_bytes(head[..4].try_into().unwrap());
        self.context.check_timestamp(timestamp)?;
        let len = u16::from_le_bytes([head[12], head[13]]) as usize;
        let pad_len = u16::from_le_bytes([head[14], head[15]]) as usize;
        if len >= CHUNK_MAX_LEN {
            return Err(FramingError::LengthInvalid { received: len }.into());
        }
        if AES128_AUTH_HEAD_LEN + pad_len + 4 > len {
            return Err(FramingError::PaddingInvalid { received: pad_len }.into());
        }
        if len > buf.len() {
            return Ok(false);
        }
        if hmac_md5(user_key.as_bytes(), &buf[..len - 4])[..4] != buf[len - 4..len] {
            return Err(IntegrityError::HmacMismatch.into());
        }

        out.extend_from_slice(&buf[AES128_AUTH_HEAD_LEN + pad_len..len - 4]);
        self.recv_buf.drain(..len);
        self.user_key = Some(user_key);
        self.header_done = true;
        trace!(uid, len, "auth header accepted");
        Ok(true)
    }
}
