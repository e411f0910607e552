#![forbid(unsafe_code)]

//! The x1764 checksum: little-endian 64-bit words folded as `sum = sum * 17 + word`,
//! reduced to 32 bits as `!((sum & 0xffff_ffff) ^ (sum >> 32))`.

/// Streaming checksum interface.
pub trait Checksum {
    /// Discards all input seen so far.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

const MULTIPLIER: u64 = 17;

/// Incremental x1764 state.
///
/// Bytes that do not yet complete a word are held in `pending` until more input
/// arrives or [`X1764::finish`] folds them in zero-extended.
#[derive(Clone, Debug, Default)]
pub struct X1764 {
    sum: u64,
    pending: u64,
    pending_len: u32,
}

impl X1764 {
    /// Creates an empty checksum state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `bytes` to the running checksum.
    pub fn add(&mut self, mut bytes: &[u8]) {
        while self.pending_len > 0 && !bytes.is_empty() {
            self.pending |= u64::from(bytes[0]) << (8 * self.pending_len);
            self.pending_len += 1;
            bytes = &bytes[1..];
            if self.pending_len == 8 {
                self.sum = self.sum.wrapping_mul(MULTIPLIER).wrapping_add(self.pending);
                self.pending = 0;
                self.pending_len = 0;
            }
        }
        if bytes.is_empty() {
            return;
        }
        let mut words = bytes.chunks_exact(8);
        for word in &mut words {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(word);
            self.sum = self
                .sum
                .wrapping_mul(MULTIPLIER)
                .wrapping_add(u64::from_le_bytes(arr));
        }
        for (i, &b) in words.remainder().iter().enumerate() {
            self.pending |= u64::from(b) << (8 * i);
        }
        self.pending_len = words.remainder().len() as u32;
    }

    /// Returns the checksum without consuming the state.
    pub fn finish(&self) -> u32 {
        let mut sum = self.sum;
        if self.pending_len > 0 {
            sum = sum.wrapping_mul(MULTIPLIER).wrapping_add(self.pending);
        }
        !(((sum & 0xffff_ffff) ^ (sum >> 32)) as u32)
    }
}

impl Checksum for X1764 {
    fn reset(&mut self) {
        *self = X1764::default();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.add(bytes);
    }

    fn finalize(&self) -> u32 {
        self.finish()
    }
}

/// Checksums a whole buffer in one call.
pub fn x1764(buf: &[u8]) -> u32 {
    let mut sum: u64 = 0;
    let mut words = buf.chunks_exact(8);
    for word in &mut words {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(word);
        sum = sum
            .wrapping_mul(MULTIPLIER)
            .wrapping_add(u64::from_le_bytes(arr));
    }
    let tail = words.remainder();
    if !tail.is_empty() {
        let mut arr = [0u8; 8];
        arr[..tail.len()].copy_from_slice(tail);
        sum = sum
            .wrapping_mul(MULTIPLIER)
            .wrapping_add(u64::from_le_bytes(arr));
    }
    !(((sum & 0xffff_ffff) ^ (sum >> 32)) as u32)
}
