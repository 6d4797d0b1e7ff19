use std::{
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use rand::Rng;
use tracing::debug;

use crate::crypto::SecretKey;

/// Once the connection counter passes this value the client id is replaced.
pub(crate) const CONNECTION_ID_CEILING: u32 = 0xFF00_0000;

/// Accepted distance, in seconds, between an authentication header's
/// timestamp and the local clock.
pub(crate) const MAX_TIME_DIFF: i64 = 24 * 60 * 60;

/// Returns the current Unix epoch timestamp truncated to 32 bits, as carried
/// in every authentication header.
pub(crate) fn current_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH")
        .as_secs() as u32
}

pub(crate) fn timestamp_is_fresh(timestamp: u32, now: u32) -> bool {
    (now as i64 - timestamp as i64).abs() <= MAX_TIME_DIFF
}

/// Client identity shared by every connection of one protocol template.
#[derive(Debug, Default)]
pub(crate) struct SessionIdentity(Mutex<Inner>);

#[derive(Debug, Default)]
struct Inner {
    client_id: Option<[u8; 8]>,
    connection_id: u32,
    user: Option<UserIdentity>,
}

/// The identity a single authentication header is stamped with.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct ConnectionIdentity {
    pub(crate) client_id: [u8; 8],
    pub(crate) connection_id: u32,
}

/// The user an `auth_aes128_md5` or `auth_chain` header is sent as.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct UserIdentity {
    pub(crate) uid: [u8; 4],
    pub(crate) user_key: SecretKey,
}

impl SessionIdentity {
    #[cfg(test)]
    pub(crate) fn with_state(client_id: [u8; 8], connection_id: u32) -> Self {
        SessionIdentity(Mutex::new(Inner {
            client_id: Some(client_id),
            connection_id,
            user: None,
        }))
    }

    /// Advances the connection counter, rotating the client id when it is
    /// unset or the counter passed [`CONNECTION_ID_CEILING`].
    pub(crate) fn next_connection(&self, rng: &mut impl Rng) -> ConnectionIdentity {
        let mut inner = self.0.lock().unwrap();

        inner.connection_id = inner.connection_id.wrapping_add(1);
        if inner.connection_id > CONNECTION_ID_CEILING {
            inner.client_id = None;
        }
        let client_id = match inner.client_id {
            Some(client_id) => client_id,
            None => {
                let client_id: [u8; 8] = rng.random();
                inner.connection_id = rng.random::<u32>() & 0x00FF_FFFF;
                inner.client_id = Some(client_id);
                debug!(connection_id = inner.connection_id, "client id rotated");
                client_id
            }
        };
        ConnectionIdentity {
            client_id,
            connection_id: inner.connection_id,
        }
    }

    /// Resolves the user once and hands out the memoized result afterwards.
    pub(crate) fn user(&self, resolve: impl FnOnce() -> UserIdentity) -> UserIdentity {
        let mut inner = self.0.lock().unwrap();
        inner.user.get_or_insert_with(resolve).clone()
    }
}
