//! `origin`: no framing at all.

use crate::error::Error;

pub(super) fn encode(buf: &[u8]) -> Vec<u8> {
    buf.to_vec()
}

pub(super) fn decode(buf: &[u8]) -> Result<Vec<u8>, Error> {
    Ok(buf.to_vec())
}
