//! Wire layouts of the SSR obfs and protocol filters.
//!
//! All lengths are in bytes. `LE`/`BE` mark multi-byte integer order.

// random_head first packet:
// ```text
// |     random     | ~CRC32(random) LE |
// | 4B .. 99B      |        4B         |
// ```
pub(crate) const RANDOM_HEAD_MIN_LEN: usize = 8;
pub(crate) const RANDOM_HEAD_MAX_LEN: usize = 103;

// auth_sha1_v4 chunk:
// ```text
// | len BE | CRC32(len) LE low16 | pad_len | ext pad_len BE |  pad  | payload | Adler32 LE |
// |   2B   |         2B          |   1B    |   (2B if 0xFF) |       |         |     4B     |
// |                          <- pad_len bytes from pad_len ->       |
// ```
//
// auth_sha1_v4 authentication header (first chunk, client to server):
// ```text
// | len BE | CRC32(len || salt || key) LE | pad_len | ... pad | time LE | client_id[..4] | conn_id LE | payload | HMAC-SHA1 |
// |   2B   |              4B              |   1B    |         |   4B    |       4B       |     4B     |         |    10B    |
// ```
// The HMAC key is `IV || key` and covers every preceding byte.
pub(crate) const SHA1_V4_SALT: &[u8] = b"auth_sha1_v4";
pub(crate) const SHA1_V4_HMAC_LEN: usize = 10;
pub(crate) const SHA1_V4_CHUNK_OVERHEAD: usize = 2 + 2 + 4;
pub(crate) const SHA1_V4_AUTH_OFFSET: usize = 2 + 4;
pub(crate) const SHA1_V4_AUTH_FIELDS_LEN: usize = 4 + 4 + 4;
pub(crate) const SHA1_V4_DEFAULT_HEAD_LEN: usize = 30;

// auth_aes128_md5 chunk, `id` being the chunk sequence number:
// ```text
// | len LE | HMAC(user_key || id, len)[..2] | pad_len | ext pad_len LE |  pad  | payload | HMAC(user_key || id, ..)[..4] |
// |   2B   |               2B               |   1B    |   (2B if 0xFF) |       |         |              4B               |
// ```
//
// auth_aes128_md5 authentication header (first chunk, client to server):
// ```text
// | rand | HMAC(IV || key, rand)[..6] | uid LE | AES(head) | HMAC(IV || key, uid || AES(head))[..4] |  pad  | payload | HMAC(user_key, ..)[..4] |
// |  1B  |             6B             |   4B   |    16B    |                  4B                    |       |         |            4B           |
// |                                         <- 31B ->                                              |
//
// head: | time LE | client_id[..4] | conn_id LE | total len LE | pad len LE |
//       |   4B    |       4B       |     4B     |      2B      |     2B     |
// ```
pub(crate) const AES128_MD5_SALT: &[u8] = b"auth_aes128_md5";
pub(crate) const AES128_CHUNK_OVERHEAD: usize = 2 + 2 + 4;
pub(crate) const AES128_AUTH_HEAD_LEN: usize = 31;
pub(crate) const AES128_FIRST_CHUNK_LEN: usize = 1200;

// auth_chain chunk, `h` being the previous chunk's hash in this direction:
// ```text
// | len LE ^ h[14..16] |  pad  | RC4(payload) |  pad  | HMAC(user_key || id, ..)[..2] |
// |         2B         |   <- PRNG sized, payload at a PRNG offset ->   |              2B               |
// ```
//
// auth_chain authentication header (client to server, before the first chunk):
// ```text
// | nonce | HMAC(IV || key, nonce)[..8] | uid LE ^ h[8..12] | AES(head) | HMAC(user_key, uid || AES(head))[..4] |
// |  4B   |             8B              |        4B         |    16B    |                  4B                   |
//
// head: | time LE | client_id[..4] | conn_id LE | overhead LE | 0 LE |
//       |   4B    |       4B       |     4B     |      2B     |  2B  |
// ```
// `h` is the full nonce HMAC, which also seeds the client chunk chain. The
// server chain starts from the full trailing HMAC. The first server chunk
// starts its payload with the server's TCP MSS (u16 LE).
pub(crate) const CHAIN_A_SALT: &[u8] = b"auth_chain_a";
pub(crate) const CHAIN_B_SALT: &[u8] = b"auth_chain_b";
pub(crate) const CHAIN_AUTH_HEAD_LEN: usize = 4 + 8 + 4 + 16 + 4;
pub(crate) const CHAIN_OVERHEAD: usize = 4;
pub(crate) const CHAIN_FIRST_CHUNK_LEN: usize = 1200;
pub(crate) const CHAIN_MAX_FRAME_LEN: usize = 4096;

/// Shared by every variant: frames of `auth_sha1_v4` and `auth_aes128_md5`
/// must declare a length in `[CHUNK_MIN_LEN, CHUNK_MAX_LEN)`.
pub(crate) const CHUNK_MIN_LEN: usize = 8;
pub(crate) const CHUNK_MAX_LEN: usize = 8192;

/// Payload bytes per chunk after the first, for the non-chain variants.
pub(crate) const BLOCK_LEN: usize = 4096;

pub(crate) const DEFAULT_TCP_MSS: u16 = 1460;
pub(crate) const MAX_TCP_MSS: u16 = 1500;

/// Writes the padding length marker used by `auth_sha1_v4` and
/// `auth_aes128_md5`: one byte when below 128, otherwise `0xFF` followed by
/// the 16-bit length.
pub(crate) fn put_pad_len(pad: &mut [u8], pad_len: usize, big_endian: bool) {
    if pad_len < 128 {
        pad[0] = pad_len as u8;
    } else {
        pad[0] = 0xFF;
        let len = pad_len as u16;
        pad[1..3].copy_from_slice(&if big_endian {
            len.to_be_bytes()
        } else {
            len.to_le_bytes()
        });
    }
}

/// Reads the marker written by [`put_pad_len`]. `pad` must hold 3 bytes.
pub(crate) fn get_pad_len(pad: &[u8], big_endian: bool) -> usize {
    if pad[0] != 0xFF {
        pad[0] as usize
    } else {
        let len = [pad[1], pad[2]];
        if big_endian {
            u16::from_be_bytes(len) as usize
        } else {
            u16::from_le_bytes(len) as usize
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pad_len_marker() {
        for big_endian in [true, false] {
            for pad_len in [1usize, 2, 127, 128, 129, 1024] {
                let mut pad = vec![0u8; pad_len.max(3)];
                put_pad_len(&mut pad, pad_len, big_endian);
                assert_eq!(get_pad_len(&pad, big_endian), pad_len);
                assert_eq!(pad[0] == 0xFF, pad_len >= 128);
            }
        }

        let mut pad = [0u8; 3];
        put_pad_len(&mut pad, 0x0201, true);
        assert_eq!(pad, [0xFF, 0x02, 0x01]);
        put_pad_len(&mut pad, 0x0201, false);
        assert_eq!(pad, [0xFF, 0x01, 0x02]);
    }
}
