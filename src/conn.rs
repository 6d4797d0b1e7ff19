//! Blocking connection composition.
//!
//! Every layer of an SSR connection (obfs, cipher, protocol) is a [`Filter`]:
//! a synchronous, non-blocking byte transform. [`FilterConn`] lifts one filter
//! onto any [`Read`] + [`Write`] transport, and nesting three of them gives
//! the full client connection [`SsrConn`].
//!
//! ```text
//!   caller  <->  protocol  <->  cipher  <->  obfs  <->  transport
//! ```

use std::io::{self, Read, Write};

use tracing::{debug, trace};

use crate::{cipher::CipherFilter, error::Error, obfs::ObfsFilter, protocol::ProtocolFilter};

/// Size of the scratch buffer used for a single read from the transport.
pub(crate) const RELAY_BUFFER_SIZE: usize = 20 * 1024;

/// Output of [`Filter::decode`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Decoded {
    /// Decoded bytes. Empty when the input did not complete a frame yet.
    Data(Vec<u8>),

    /// The input was a handshake response. The caller must discard it and
    /// write the output of `encode(&[])` to the transport before reading on.
    Sendback,
}

/// A per-connection byte transform of one layer.
///
/// `decode` is resumable: bytes that do not complete a frame are kept inside
/// the filter and combined with the next call's input.
pub trait Filter {
    /// Transforms outbound bytes into wire bytes.
    fn encode(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error>;

    /// Transforms inbound wire bytes.
    fn decode(&mut self, buf: &[u8]) -> Result<Decoded, Error>;
}

/// A fully composed blocking client connection.
pub type SsrConn<IO> =
    FilterConn<FilterConn<FilterConn<IO, ObfsFilter>, CipherFilter>, ProtocolFilter>;

/// A [`Filter`] bound to a blocking transport.
///
/// `read` first drains bytes left over from a previous decode that did not
/// fit the caller's buffer; `write` reports the number of caller bytes
/// consumed, not the number of wire bytes written.
#[derive(Debug)]
pub struct FilterConn<IO, F> {
    inner: IO,
    filter: F,
    overflow: Vec<u8>,
    offset: usize,
    scratch: Box<[u8]>,
}

impl<IO, F> FilterConn<IO, F> {
    /// Binds `filter` to `inner`.
    pub fn new(inner: IO, filter: F) -> Self {
        Self {
            inner,
            filter,
            overflow: Vec::new(),
            offset: 0,
            scratch: vec![0u8; RELAY_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    /// Returns a reference to the inner transport.
    pub fn get_ref(&self) -> &IO {
        &self.inner
    }

    /// Returns a mutable reference to the inner transport.
    pub fn get_mut(&mut self) -> &mut IO {
        &mut self.inner
    }

    /// Returns a reference to the filter.
    pub fn filter(&self) -> &F {
        &self.filter
    }

    /// Consumes the connection, returning the inner transport.
    pub fn into_inner(self) -> IO {
        self.inner
    }

    fn drain_overflow(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.overflow.len() - self.offset);
        buf[..n].copy_from_slice(&self.overflow[self.offset..self.offset + n]);
        self.offset += n;
        if self.offset == self.overflow.len() {
            self.overflow.clear();
            self.offset = 0;
        }
        n
    }
}

impl<IO, F> Read for FilterConn<IO, F>
where
    IO: Read + Write,
    F: Filter,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.overflow.is_empty() {
            return Ok(self.drain_overflow(buf));
        }
        loop {
            let n = self.inner.read(&mut self.scratch)?;
            if n == 0 {
                return Ok(0);
            }
            let decoded = self.filter.decode(&self.scratch[..n]).map_err(|e| {
                debug!(error = %e, "inbound data rejected");
                e
            })?;
            match decoded {
                Decoded::Sendback => {
                    trace!("answering handshake response");
                    let encoded = self.filter.encode(&[])?;
                    self.inner.write_all(&encoded)?;
                }
                Decoded::Data(data) if data.is_empty() => continue,
                Decoded::Data(data) => {
                    self.overflow = data;
                    self.offset = 0;
                    return Ok(self.drain_overflow(buf));
                }
            }
        }
    }
}

impl<IO, F> Write for FilterConn<IO, F>
where
    IO: Write,
    F: Filter,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let encoded = self.filter.encode(buf)?;
        self.inner.write_all(&encoded)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        Config,
        error::IntegrityError,
        protocol::{Protocol, Role},
        test::MockStream,
    };

    /// Uppercases on the way out, lowercases on the way in. Frames are
    /// terminated by `\n`, which is stripped.
    #[derive(Debug, Default)]
    struct LineFilter {
        pending: Vec<u8>,
    }

    impl Filter for LineFilter {
        fn encode(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
            let mut out = buf.to_ascii_uppercase();
            out.push(b'\n');
            Ok(out)
        }

        fn decode(&mut self, buf: &[u8]) -> Result<Decoded, Error> {
            self.pending.extend_from_slice(buf);
            let mut out = Vec::new();
            while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                out.extend(self.pending.drain(..=pos).take(pos).map(|b| b.to_ascii_lowercase()));
            }
            Ok(Decoded::Data(out))
        }
    }

    #[test]
    fn test_write_reports_caller_bytes() {
        let mut conn = FilterConn::new(MockStream::default(), LineFilter::default());
        assert_eq!(conn.write(b"hello").unwrap(), 5);
        assert_eq!(conn.get_ref().tx, b"HELLO\n");
    }

    #[test]
    fn test_read_overflow_and_partial_frames() {
        let mut conn = FilterConn::new(MockStream::default(), LineFilter::default());
        conn.get_mut().rx.extend_from_slice(b"ABC");

        // An incomplete frame never surfaces as EOF.
        let mut buf = [0u8; 2];
        let err = conn.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        conn.get_mut().rx.extend_from_slice(b"DEF\n");
        assert_eq!(conn.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(conn.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"cd");
        assert_eq!(conn.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ef");

        conn.get_mut().set_eof();
        assert_eq!(conn.read(&mut buf).unwrap(), 0);
    }

    fn client_config(protocol: &str) -> Config {
        Config::builder_for_server("example.com", 443)
            .with_cipher("aes-128-ctr", "barfoo!")
            .unwrap()
            .with_obfs("random_head", "")
            .unwrap()
            .with_protocol(protocol, "")
            .unwrap()
    }

    fn test_composed_connection(protocol: &str) {
        let config = client_config(protocol);
        let mut conn = config.connect(MockStream::default());
        let request = vec![0x61u8; 3000];

        // random_head holds the request back until the server answers.
        conn.write_all(&request).unwrap();
        let wire = std::mem::take(&mut conn.get_mut().get_mut().get_mut().tx);
        let head_len = wire.len();
        assert!((8..=103).contains(&head_len), "{}", head_len);
        assert_eq!(
            u32::from_le_bytes(wire[head_len - 4..].try_into().unwrap()),
            !crc32fast::hash(&wire[..head_len - 4])
        );

        // The server's random head releases the request.
        conn.get_mut().get_mut().get_mut().rx = vec![0x5au8; 20];
        let mut buf = [0u8; 64];
        let err = conn.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let cipher = config.cipher().clone();
        let client_iv = conn.get_ref().filter().iv().to_vec();
        let wire = std::mem::take(&mut conn.get_mut().get_mut().get_mut().tx);
        let mut server_recv = cipher.clone_for_connection();
        let decrypted = match server_recv.decode(&wire).unwrap() {
            Decoded::Data(data) => data,
            Decoded::Sendback => unreachable!(),
        };
        assert_eq!(server_recv.peer_iv(), Some(client_iv.as_slice()));
        let mut server_protocol = config
            .protocol()
            .instantiate(&client_iv, Role::Server, [3u8; 32]);
        match server_protocol.decode(&decrypted).unwrap() {
            Decoded::Data(data) => assert_eq!(data, request),
            Decoded::Sendback => unreachable!(),
        }

        // Server data is delivered through every layer.
        let mut server_send = cipher.clone_for_connection();
        conn.get_mut().get_mut().get_mut().rx = server_send
            .encode(&server_protocol.encode(b"welcome").unwrap())
            .unwrap();
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"welcome");

        // Tampered inbound data surfaces as a downcastable error.
        if protocol != "origin" {
            let mut tampered = server_send
                .encode(&server_protocol.encode(b"again").unwrap())
                .unwrap();
            let last = tampered.len() - 1;
            tampered[last] ^= 0x01;
            conn.get_mut().get_mut().get_mut().rx = tampered;
            let err = conn.read(&mut buf).unwrap_err();
            let err = err.into_inner().unwrap().downcast::<Error>().unwrap();
            assert!(
                matches!(
                    *err,
                    Error::Integrity(IntegrityError::ChecksumMismatch)
                        | Error::Integrity(IntegrityError::HmacMismatch)
                ),
                "{}",
                err
            );
        }
    }

    #[test]
    fn test_composed_connections() {
        for protocol in [
            "origin",
            "auth_sha1_v4",
            "auth_aes128_md5",
            "auth_chain_a",
            "auth_chain_b",
        ] {
            test_composed_connection(protocol);
        }
    }

    #[test]
    fn test_identity_shared_across_connections() {
        let config = client_config("auth_chain_a");
        let a = config.connect(MockStream::default());
        let b = config.clone().connect(MockStream::default());
        assert!(Protocol::shares_identity(
            a.filter().template(),
            b.filter().template()
        ));
    }
}
