//! `xorshift128+` generator shared by both ends of an `auth_chain` stream.
//!
//! Both peers reseed it from the previous chunk's hash and the chunk length,
//! so they draw identical padding lengths and positions without sending them.
//! It is not a source of secret randomness.

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Shift128Plus {
    v0: u64,
    v1: u64,
}

impl Shift128Plus {
    pub(crate) fn next(&mut self) -> u64 {
        let mut x = self.v0;
        let y = self.v1;
        self.v0 = y;
        x ^= x << 23;
        x ^= y ^ (x >> 17) ^ (y >> 26);
        self.v1 = x;
        x.wrapping_add(y)
    }

    /// Loads up to 16 bytes of `bin` as the state, zero-padded.
    pub(crate) fn init_from_bin(&mut self, bin: &[u8]) {
        let mut fill = [0u8; 16];
        let n = bin.len().min(16);
        fill[..n].copy_from_slice(&bin[..n]);
        self.load(&fill);
    }

    /// Loads `bin` with its first two bytes replaced by `data_len`, then
    /// discards four outputs.
    pub(crate) fn init_from_bin_datalen(&mut self, bin: &[u8], data_len: usize) {
        let mut fill = [0u8; 16];
        let n = bin.len().min(16);
        fill[..n].copy_from_slice(&bin[..n]);
        fill[..2].copy_from_slice(&(data_len as u16).to_le_bytes());
        self.load(&fill);
        for _ in 0..4 {
            self.next();
        }
    }

    fn load(&mut self, fill: &[u8; 16]) {
        self.v0 = u64::from_le_bytes(fill[..8].try_into().unwrap());
        self.v1 = u64::from_le_bytes(fill[8..].try_into().unwrap());
    }
}
