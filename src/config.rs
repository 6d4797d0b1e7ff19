//! Configuration structures for setting up an [`SsrConn`] or [`SsrStream`].
//!
//! To build a config, you should make three decisions in order, matching
//! what the server was set up with:
//!
//! 1. The stream cipher and its password (or explicit key).
//! 2. The obfs method and its `obfs-param`.
//! 3. The protocol and its `protocol-param`, conventionally `"uid:password"`
//!    for the multi-user protocols.
//!
//! Every name is checked when the builder step runs, so a [`Config`] that
//! was built successfully can always connect.
//!
//! A `Config` is the shared per-target state: connections created from it
//! (or from any of its clones) draw their client id and connection counter
//! from one session identity.
//!
//! # Example
//!
//! ```
//! use ssrwire::Config;
//!
//! # fn main() -> Result<(), ssrwire::Error> {
//! let config = Config::builder_for_server("203.0.113.7", 8388)
//!     .with_cipher("aes-256-cfb", "correct horse")?
//!     .with_obfs("random_head", "")?
//!     .with_protocol("auth_chain_a", "1024:battery staple")?;
//!
//! assert_eq!(config.cipher().key().len(), 32);
//! # Ok(())
//! # }
//! ```
//!
//! A plain configuration, equivalent to a bare Shadowsocks stream:
//! ```
//! use ssrwire::Config;
//!
//! # fn main() -> Result<(), ssrwire::Error> {
//! let config = Config::builder_for_server("203.0.113.7", 8388)
//!     .with_cipher("chacha20-ietf", "correct horse")?
//!     .with_plain_obfs()
//!     .with_origin_protocol();
//! # let _ = config;
//! # Ok(())
//! # }
//! ```
//!
//! [`SsrConn`]: crate::SsrConn
//! [`SsrStream`]: crate::tokio_stream_impl::SsrStream
use tracing::trace;

use crate::{
    cipher::Cipher,
    conn::{FilterConn, SsrConn},
    error::Error,
    obfs::{Obfs, ObfsBase},
    protocol::Protocol,
};
#[cfg(feature = "tokio-stream-impl")]
use crate::tokio_stream_impl::{FilterStream, SsrStream};

/// Configuration structure for setting up an [`SsrConn`] or [`SsrStream`].
///
/// For details on constructing and configuring `config`, refer to
/// the [`config`] module.
///
/// [`config`]: crate::config
/// [`SsrConn`]: crate::SsrConn
/// [`SsrStream`]: crate::tokio_stream_impl::SsrStream
#[derive(Clone, Debug)]
pub struct Config {
    cipher: Cipher,
    obfs: Obfs,
    protocol: Protocol,
}

/// A builder for creating a [`Config`] instance.
///
/// To get a [`ConfigBuilder`], use [`Config::builder_for_server`].
#[derive(Clone, Debug)]
pub struct ConfigBuilder<State> {
    state: State,
}

impl Config {
    /// Sets up the server address, which is handed to the obfs method.
    pub fn builder_for_server(host: impl Into<String>, port: u16) -> ConfigBuilder<WantsCipher> {
        ConfigBuilder {
            state: WantsCipher {
                host: host.into(),
                port,
            },
        }
    }

    /// The stream cipher shared by every connection.
    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    /// The obfs template.
    pub fn obfs(&self) -> &Obfs {
        &self.obfs
    }

    /// The protocol template, which owns the session identity.
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Server host name.
    pub fn host(&self) -> &str {
        &self.obfs.base().host
    }

    /// Server port.
    pub fn port(&self) -> u16 {
        self.obfs.base().port
    }

    /// Wraps an established blocking transport into a client connection.
    ///
    /// Nothing is written until the first write on the returned connection.
    pub fn connect<IO>(&self, io: IO) -> SsrConn<IO> {
        let cipher = self.cipher.clone_for_connection();
        let protocol = self.protocol.clone_for_connection(cipher.iv());
        trace!(
            host = self.host(),
            port = self.port(),
            "composing client connection"
        );
        FilterConn::new(
            FilterConn::new(FilterConn::new(io, self.obfs.clone_for_connection()), cipher),
            protocol,
        )
    }

    /// Wraps an established asynchronous transport into a client stream.
    ///
    /// Nothing is written until the first write on the returned stream.
    #[cfg(feature = "tokio-stream-impl")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tokio-stream-impl")))]
    pub fn stream<IO>(&self, io: IO) -> SsrStream<IO> {
        let cipher = self.cipher.clone_for_connection();
        let protocol = self.protocol.clone_for_connection(cipher.iv());
        trace!(
            host = self.host(),
            port = self.port(),
            "composing client stream"
        );
        FilterStream::new(
            FilterStream::new(FilterStream::new(io, self.obfs.clone_for_connection()), cipher),
            protocol,
        )
    }
}

impl ConfigBuilder<WantsCipher> {
    /// Sets up the stream cipher, deriving its key from `password`.
    ///
    /// The name is matched case-insensitively.
    pub fn with_cipher(
        self,
        name: &str,
        password: impl AsRef<[u8]>,
    ) -> Result<ConfigBuilder<WantsObfs>, Error> {
        let cipher = Cipher::pick(name, &[], password.as_ref())?;
        Ok(self.into_wants_obfs(cipher))
    }

    /// Sets up the stream cipher with an explicit key.
    ///
    /// Fails if the key length does not match the cipher.
    pub fn with_cipher_key(
        self,
        name: &str,
        key: &[u8],
    ) -> Result<ConfigBuilder<WantsObfs>, Error> {
        let cipher = Cipher::pick_with_key(name, key)?;
        Ok(self.into_wants_obfs(cipher))
    }

    fn into_wants_obfs(self, cipher: Cipher) -> ConfigBuilder<WantsObfs> {
        ConfigBuilder {
            state: WantsObfs {
                host: self.state.host,
                port: self.state.port,
                cipher,
            },
        }
    }
}

impl ConfigBuilder<WantsObfs> {
    /// Sets up the obfs method. The name is case-sensitive.
    pub fn with_obfs(
        self,
        name: &str,
        param: impl Into<String>,
    ) -> Result<ConfigBuilder<WantsProtocol>, Error> {
        let base = ObfsBase {
            host: self.state.host,
            port: self.state.port,
            param: param.into(),
        };
        Ok(ConfigBuilder {
            state: WantsProtocol {
                cipher: self.state.cipher,
                obfs: Obfs::pick(name, base)?,
            },
        })
    }

    /// Use the `plain` obfs, which leaves the stream untouched.
    pub fn with_plain_obfs(self) -> ConfigBuilder<WantsProtocol> {
        let base = ObfsBase {
            host: self.state.host,
            port: self.state.port,
            param: String::new(),
        };
        ConfigBuilder {
            state: WantsProtocol {
                cipher: self.state.cipher,
                obfs: Obfs::plain(base),
            },
        }
    }
}

impl ConfigBuilder<WantsProtocol> {
    /// Sets up the protocol. The name is matched case-insensitively.
    pub fn with_protocol(self, name: &str, param: &str) -> Result<Config, Error> {
        let protocol = Protocol::pick(name, self.state.cipher.key(), param)?;
        Ok(Config {
            cipher: self.state.cipher,
            obfs: self.state.obfs,
            protocol,
        })
    }

    /// Use the `origin` protocol, which adds no framing.
    pub fn with_origin_protocol(self) -> Config {
        let protocol = Protocol::origin(self.state.cipher.key());
        Config {
            cipher: self.state.cipher,
            obfs: self.state.obfs,
            protocol,
        }
    }
}

/// Config builder state where the caller must supply a stream cipher.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct WantsCipher {
    host: String,
    port: u16,
}

/// Config builder state where the caller must supply an obfs method.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct WantsObfs {
    host: String,
    port: u16,
    cipher: Cipher,
}

/// Config builder state where the caller must supply a protocol.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct WantsProtocol {
    cipher: Cipher,
    obfs: Obfs,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        cipher::CipherKind,
        error::ConfigError,
    };

    #[test]
    fn test_builder_resolves_every_layer() {
        let config = Config::builder_for_server("example.com", 443)
            .with_cipher("AES-128-CFB", "barfoo!")
            .unwrap()
            .with_obfs("random_head", "cloudfront.net")
            .unwrap()
            .with_protocol("AUTH_CHAIN_B", "1000:alpha")
            .unwrap();
        assert_eq!(config.cipher().kind(), CipherKind::Aes128Cfb);
        assert_eq!(config.host(), "example.com");
        assert_eq!(config.port(), 443);
        assert_eq!(config.obfs().base().param, "cloudfront.net");
        assert_eq!(config.protocol().param(), "1000:alpha");
    }

    #[test]
    fn test_builder_rejects_unknown_names() {
        let err = Config::builder_for_server("example.com", 443)
            .with_cipher("aes-128-gcm", "barfoo!")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnsupportedCipher { .. })
        ));

        let err = Config::builder_for_server("example.com", 443)
            .with_cipher("rc4-md5", "barfoo!")
            .unwrap()
            .with_obfs("Random_Head", "")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnsupportedObfs { .. })
        ));

        let err = Config::builder_for_server("example.com", 443)
            .with_cipher("rc4-md5", "barfoo!")
            .unwrap()
            .with_plain_obfs()
            .with_protocol("auth_chain_z", "")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnsupportedProtocol { .. })
        ));
    }

    #[test]
    fn test_explicit_key_size_checked() {
        let err = Config::builder_for_server("example.com", 443)
            .with_cipher_key("aes-256-ctr", &[1u8; 16])
            .unwrap_err();
        assert_eq!(
            err,
            Error::Config(ConfigError::KeySizeMismatch {
                expect: 32,
                received: 16
            })
        );

        let err = Config::builder_for_server("example.com", 443)
            .with_cipher_key("aes-256-ctr", &[])
            .unwrap_err();
        assert_eq!(
            err,
            Error::Config(ConfigError::KeySizeMismatch {
                expect: 32,
                received: 0
            })
        );

        let config = Config::builder_for_server("example.com", 443)
            .with_cipher_key("aes-256-ctr", &[1u8; 32])
            .unwrap()
            .with_plain_obfs()
            .with_origin_protocol();
        assert_eq!(config.cipher().key(), &[1u8; 32]);
    }
}
