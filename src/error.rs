//! All possible non-I/O errors raised by the filters.
//!
use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

/// Enumeration of all possible non-I/O errors.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// A cipher, obfs or protocol could not be constructed from the
    /// supplied configuration.
    ///
    /// Raised once, when a [`Config`] is being built. It is never retried.
    ///
    /// [`Config`]: crate::Config
    Config(ConfigError),

    /// A checksum or an authentication tag did not match.
    ///
    /// This could be due to the peer using an incorrect key or password,
    /// random errors in the network, or active tampering.
    ///
    /// # Suggested error handling strategy
    ///
    /// This error is fatal. The filter has already discarded every buffered
    /// byte of the connection, so the connection must be closed.
    Integrity(IntegrityError),

    /// The peer sent a frame whose declared layout cannot be valid.
    ///
    /// # Suggested error handling strategy
    ///
    /// This error is fatal and handled like [`Error::Integrity`].
    Framing(FramingError),
}

/// Errors raised while building a configuration.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ConfigError {
    /// The cipher name is not one of the supported stream ciphers.
    UnsupportedCipher {
        /// The requested cipher name.
        name: String,
    },

    /// An explicit key was supplied whose length does not fit the cipher.
    KeySizeMismatch {
        /// The key size required by the cipher.
        expect: usize,
        /// The key size supplied.
        received: usize,
    },

    /// The obfs name is not registered.
    UnsupportedObfs {
        /// The requested obfs name.
        name: String,
    },

    /// The protocol name is not registered.
    UnsupportedProtocol {
        /// The requested protocol name.
        name: String,
    },
}

/// Checksum and authentication failures.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum IntegrityError {
    /// The short tag protecting a chunk's length field did not match.
    LengthTagMismatch,

    /// The CRC32 of an `auth_sha1_v4` authentication header did not match.
    HeaderCrcMismatch,

    /// The Adler-32 checksum of an `auth_sha1_v4` chunk did not match.
    ChecksumMismatch,

    /// The HMAC of an authentication header did not match.
    HeaderHmacMismatch,

    /// The HMAC trailer of a chunk did not match.
    HmacMismatch,

    /// The authentication header carries a timestamp outside the accepted
    /// window.
    ExpiredTimestamp {
        /// The timestamp we received.
        received_timestamp: u32,
    },

    /// The authentication header names a user this endpoint does not know.
    UnknownUser {
        /// The received user id.
        uid: u32,
    },
}

/// Malformed frames.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum FramingError {
    /// The declared frame length is outside the accepted range.
    LengthInvalid {
        /// The declared length.
        received: usize,
    },

    /// The declared padding runs past the end of the frame.
    PaddingInvalid {
        /// The declared padding length.
        received: usize,
    },

    /// The TCP MSS announced by the server cannot be used to size chunks.
    TcpMssInvalid {
        /// The announced MSS.
        received: u16,
    },

    /// Chunk data arrived before the authentication handshake that keys it.
    UnexpectedData,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Config(err) => write!(f, "Config: {}", err),
            Error::Integrity(err) => write!(f, "Integrity: {}", err),
            Error::Framing(err) => write!(f, "Framing: {}", err),
        }
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::UnsupportedCipher { name } => {
                write!(f, "UnsupportedCipher: {}", name)
            }
            ConfigError::KeySizeMismatch { expect, received } => write!(
                f,
                "KeySizeMismatch: expected {}, received {}",
                expect, received
            ),
            ConfigError::UnsupportedObfs { name } => write!(f, "UnsupportedObfs: {}", name),
            ConfigError::UnsupportedProtocol { name } => {
                write!(f, "UnsupportedProtocol: {}", name)
            }
        }
    }
}

impl Display for IntegrityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            IntegrityError::LengthTagMismatch => write!(f, "LengthTagMismatch"),
            IntegrityError::HeaderCrcMismatch => write!(f, "HeaderCrcMismatch"),
            IntegrityError::ChecksumMismatch => write!(f, "ChecksumMismatch"),
            IntegrityError::HeaderHmacMismatch => write!(f, "HeaderHmacMismatch"),
            IntegrityError::HmacMismatch => write!(f, "HmacMismatch"),
            IntegrityError::ExpiredTimestamp { received_timestamp } => write!(
                f,
                "ExpiredTimestamp: received timestamp {}",
                received_timestamp
            ),
            IntegrityError::UnknownUser { uid } => write!(f, "UnknownUser: uid {}", uid),
        }
    }
}

impl Display for FramingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            FramingError::LengthInvalid { received } => {
                write!(f, "LengthInvalid: received {}", received)
            }
            FramingError::PaddingInvalid { received } => {
                write!(f, "PaddingInvalid: received {}", received)
            }
            FramingError::TcpMssInvalid { received } => {
                write!(f, "TcpMssInvalid: received {}", received)
            }
            FramingError::UnexpectedData => write!(f, "UnexpectedData"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Config(err) => Some(err),
            Error::Integrity(err) => Some(err),
            Error::Framing(err) => Some(err),
        }
    }
}

impl error::Error for ConfigError {}

impl error::Error for IntegrityError {}

impl error::Error for FramingError {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(ErrorKind::Other, e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<IntegrityError> for Error {
    fn from(e: IntegrityError) -> Self {
        Error::Integrity(e)
    }
}

impl From<FramingError> for Error {
    fn from(e: FramingError) -> Self {
        Error::Framing(e)
    }
}
