//! Ssrwire implements the ShadowsocksR connection filters: the traffic-shape
//! obfuscation of the first packet, the stream cipher layer and the family of
//! authenticated framing protocols that ride on top of it.
//!
//! ## Quick Start
//!
//! Ssrwire provides two interfaces: [`SsrConn`] and [`SsrStream`].
//!
//! * [`SsrConn`]
//!
//!   A blocking client connection composed from three [`FilterConn`] layers.
//!   It is bound to a reliable, ordered stream that implements the [`Read`]
//!   and [`Write`] traits (e.g., [`TcpStream`]) which has already been
//!   connected to the server. Ssrwire does not dial, resolve or time out;
//!   those are the caller's business.
//!
//! * [`SsrStream`]
//!
//!   For convenient use in asynchronous scenarios, Ssrwire provides a
//!   ready-to-use asynchronous stream implementation based on tokio. It
//!   requires the underlying transport to implement the [`AsyncRead`] and
//!   [`AsyncWrite`] traits and the `tokio-stream-impl` feature to be enabled.
//!
//! Both are stacks of the same per-connection [`Filter`]s:
//!
//! ```text
//!   application  <->  protocol  <->  cipher  <->  obfs  <->  transport
//! ```
//!
//! ## Configuration
//!
//! The [`Config`] struct describes one server. Options include the
//! following:
//!
//! 1. Cipher
//!
//!    A keystream cipher, see [`CipherKind`]. The key is derived from the
//!    password with [`kdf`] unless an explicit key is given.
//!
//! 2. Obfs
//!
//!    `plain` or `random_head`. The latter opens the connection with a block
//!    of random bytes and waits for the server's own block before sending
//!    anything else.
//!
//! 3. Protocol
//!
//!    `origin` adds no framing. `auth_sha1_v4`, `auth_aes128_md5`,
//!    `auth_chain_a` and `auth_chain_b` authenticate the connection once
//!    with a timestamped header and then protect every chunk with a checksum
//!    or an HMAC, padding chunks to blur their length.
//!
//! For detailed configuration options, refer to the documentation of the
//! [`config`] module.
//!
//! Note: the authenticated protocols rely on system time. The server
//! rejects headers whose timestamp is more than 24 hours away from its own
//! clock.
//!
//! ## Errors
//!
//! A filter that detects corruption returns an [`Error`] wrapped in an
//! [`std::io::Error`] of kind [`Other`]. The connection cannot be trusted
//! afterwards and must be closed.
//!
//! [`Read`]: std::io::Read
//! [`Write`]: std::io::Write
//! [`TcpStream`]: std::net::TcpStream
//! [`AsyncRead`]: tokio::io::AsyncRead
//! [`AsyncWrite`]: tokio::io::AsyncWrite
//! [`Other`]: std::io::ErrorKind::Other
//! [`SsrStream`]: tokio_stream_impl::SsrStream
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;

mod cipher;
mod conn;
mod crypto;
mod obfs;
mod prng;
mod protocol;
mod session;
mod wire;

#[cfg(feature = "tokio-stream-impl")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-stream-impl")))]
pub mod tokio_stream_impl;

pub use cipher::{Cipher, CipherFilter, CipherKind};
pub use config::Config;
pub use conn::{Decoded, Filter, FilterConn, SsrConn};
pub use crypto::kdf;
pub use error::Error;
pub use obfs::{Obfs, ObfsBase, ObfsFilter, RandomHead};
pub use protocol::{Protocol, ProtocolFilter, Role};

#[cfg(feature = "tokio-stream-impl")]
pub use tokio_stream_impl::{FilterStream, SsrStream};
