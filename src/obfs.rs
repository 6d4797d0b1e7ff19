//! Traffic-shape obfuscation of the first packet.
//!
//! `plain` leaves the stream untouched. `random_head` sends a random block
//! ending in its inverted CRC32 in place of the first packet and holds the
//! caller's bytes back until the server has answered with its own random
//! block. From then on it is transparent.

use std::{collections::HashMap, sync::LazyLock};

use rand::{
    Rng, RngCore, SeedableRng,
    rngs::{OsRng, StdRng},
    TryRngCore,
};
use tracing::{debug, trace};

use crate::{
    conn::{Decoded, Filter},
    error::{ConfigError, Error},
    wire::{RANDOM_HEAD_MAX_LEN, RANDOM_HEAD_MIN_LEN},
};

/// Parameters shared by every connection of an obfs template.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ObfsBase {
    /// Server host name, available to obfs methods that mimic a protocol.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// The `obfs-param` string.
    pub param: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
enum ObfsKind {
    Plain,
    RandomHead,
}

type ObfsCreator = fn(ObfsBase) -> Obfs;

static OBFS_METHODS: LazyLock<HashMap<&'static str, ObfsCreator>> = LazyLock::new(|| {
    let mut methods: HashMap<&'static str, ObfsCreator> = HashMap::new();
    methods.insert("plain", Obfs::plain);
    methods.insert("random_head", |base| Obfs {
        kind: ObfsKind::RandomHead,
        base,
    });
    methods
});

/// An obfs method and its shared parameters.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Obfs {
    kind: ObfsKind,
    base: ObfsBase,
}

impl Obfs {
    /// Looks up the obfs method `name`. The lookup is case-sensitive.
    pub fn pick(name: &str, base: ObfsBase) -> Result<Self, Error> {
        match OBFS_METHODS.get(name) {
            Some(create) => {
                debug!(obfs = name, "obfs picked");
                Ok(create(base))
            }
            None => {
                debug!(name, "unsupported obfs");
                Err(ConfigError::UnsupportedObfs {
                    name: name.to_owned(),
                }
                .into())
            }
        }
    }

    pub(crate) fn plain(base: ObfsBase) -> Self {
        Self {
            kind: ObfsKind::Plain,
            base,
        }
    }

    /// The shared parameters.
    pub fn base(&self) -> &ObfsBase {
        &self.base
    }

    /// Creates the per-connection obfs state.
    pub fn clone_for_connection(&self) -> ObfsFilter {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .expect("system random source failure");
        self.clone_for_connection_with_seed(seed)
    }

    pub(crate) fn clone_for_connection_with_seed(&self, seed: [u8; 32]) -> ObfsFilter {
        match self.kind {
            ObfsKind::Plain => ObfsFilter::Plain,
            ObfsKind::RandomHead => ObfsFilter::RandomHead(RandomHead {
                rng: StdRng::from_seed(seed),
                state: RandomHeadState::AwaitingHeader,
                first_response: true,
                held: Vec::new(),
            }),
        }
    }
}

/// Per-connection obfs state.
#[derive(Debug)]
pub enum ObfsFilter {
    /// Pass-through.
    Plain,
    /// First-packet random head.
    RandomHead(RandomHead),
}

impl Filter for ObfsFilter {
    fn encode(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            ObfsFilter::Plain => Ok(buf.to_vec()),
            ObfsFilter::RandomHead(head) => Ok(head.encode(buf)),
        }
    }

    fn decode(&mut self, buf: &[u8]) -> Result<Decoded, Error> {
        match self {
            ObfsFilter::Plain => Ok(Decoded::Data(buf.to_vec())),
            ObfsFilter::RandomHead(head) => Ok(head.decode(buf)),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum RandomHeadState {
    AwaitingHeader,
    HeaderSent,
    Passthrough,
}

/// State of the `random_head` method for one connection.
#[derive(Debug)]
pub struct RandomHead {
    rng: StdRng,
    state: RandomHeadState,
    first_response: bool,
    held: Vec<u8>,
}

impl RandomHead {
    fn encode(&mut self, buf: &[u8]) -> Vec<u8> {
        match self.state {
            RandomHeadState::AwaitingHeader => {
                let len = self
                    .rng
                    .random_range(RANDOM_HEAD_MIN_LEN..=RANDOM_HEAD_MAX_LEN);
                let mut head = vec![0u8; len];
                self.rng.fill_bytes(&mut head[..len - 4]);
                let crc = !crc32fast::hash(&head[..len - 4]);
                head[len - 4..].copy_from_slice(&crc.to_le_bytes());

                self.held.extend_from_slice(buf);
                self.state = RandomHeadState::HeaderSent;
                trace!(len, "random head emitted");
                head
            }
            RandomHeadState::HeaderSent if !buf.is_empty() => {
                self.held.extend_from_slice(buf);
                Vec::new()
            }
            RandomHeadState::HeaderSent => {
                self.state = RandomHeadState::Passthrough;
                core::mem::take(&mut self.held)
            }
            RandomHeadState::Passthrough => buf.to_vec(),
        }
    }

    fn decode(&mut self, buf: &[u8]) -> Decoded {
        if self.first_response {
            self.first_response = false;
            return Decoded::Sendback;
        }
        Decoded::Data(buf.to_vec())
    }
}
