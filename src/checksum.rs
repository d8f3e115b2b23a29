//! Internet checksum arithmetic (RFC 1071).
//!
//! The running checksum kept on a packet head is the folded ones-complement
//! sum of its logical bytes, taken as big-endian 16-bit words across
//! descriptor boundaries. It is not complemented; protocol code complements
//! it when it writes a header.

/// Streaming ones-complement sum over data that may be split at odd offsets.
#[derive(Debug, Default, Clone, Copy)]
pub struct Accumulator {
    sum: u64,
    pending: Option<u8>,
}

impl Accumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sum: 0,
            pending: None,
        }
    }

    /// Adds `data`, pairing its first byte with a byte left over from the
    /// previous call.
    pub fn update(&mut self, mut data: &[u8]) {
        if let Some(hi) = self.pending.take() {
            match data.split_first() {
                Some((&lo, rest)) => {
                    self.sum += u64::from(u16::from_be_bytes([hi, lo]));
                    data = rest;
                }
                None => {
                    self.pending = Some(hi);
                    return;
                }
            }
        }

        let mut words = data.chunks_exact(2);
        for word in &mut words {
            self.sum += u64::from(u16::from_be_bytes([word[0], word[1]]));
        }
        if let [last] = words.remainder() {
            self.pending = Some(*last);
        }
    }

    /// Folds the sum to 16 bits. A trailing odd byte is padded with zero.
    #[must_use]
    pub fn finish(self) -> u16 {
        let mut sum = self.sum;
        if let Some(hi) = self.pending {
            sum += u64::from(hi) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        // The loop leaves at most 16 significant bits.
        #[allow(clippy::cast_possible_truncation)]
        let folded = sum as u16;
        folded
    }
}

/// Folded ones-complement sum of `data`.
#[must_use]
pub fn memsum(data: &[u8]) -> u16 {
    let mut acc = Accumulator::new();
    acc.update(data);
    acc.finish()
}

/// Internet checksum of `data`: the complement of [`memsum`].
#[must_use]
pub fn internet_checksum(data: &[u8]) -> u16 {
    !memsum(data)
}

/// Ones-complement addition with end-around carry.
#[must_use]
pub const fn ones_add(a: u16, b: u16) -> u16 {
    let sum = a as u32 + b as u32;
    ((sum & 0xFFFF) + (sum >> 16)) as u16
}

/// Ones-complement subtraction.
#[must_use]
pub const fn ones_sub(a: u16, b: u16) -> u16 {
    ones_add(a, !b)
}

/// Compares two ones-complement sums, treating `0x0000` and `0xFFFF` as the
/// same value.
#[must_use]
pub const fn ones_eq(a: u16, b: u16) -> bool {
    a == b || ((a == 0 || a == 0xFFFF) && (b == 0 || b == 0xFFFF))
}

/// Sum of the bytes left after removing a prefix of `removed_len` bytes whose
/// own sum is `removed`.
///
/// An odd-length prefix shifts every remaining byte to the other half of its
/// word, which in ones-complement arithmetic is a byte swap of the sum.
#[must_use]
pub const fn strip_prefix(sum: u16, removed: u16, removed_len: usize) -> u16 {
    let rest = ones_sub(sum, removed);
    if removed_len % 2 == 0 {
        rest
    } else {
        rest.swap_bytes()
    }
}
