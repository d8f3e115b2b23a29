//! Trimming bytes off either end of a packet.
//!
//! Trimming only moves data pointers and lengths. Descriptors that end up
//! empty stay linked; they are returned when the packet is freed.

use crate::chain::Packet;
use crate::checksum::{self, Accumulator};
use crate::descriptor::BufFlags;

impl Packet {
    /// Removes bytes from the front of the packet when `delta` is positive,
    /// or from the back when it is negative. Trims past either end clamp to
    /// the packet length.
    ///
    /// A front trim keeps the running checksum valid by subtracting the sum
    /// of the removed bytes. A back trim leaves it untouched: callers only
    /// back-trim padding that was never part of the checksummed payload.
    ///
    /// ```rust
    /// # use netbuf_pool::BufferPoolBuilder;
    /// # let pool = BufferPoolBuilder::new().reserved_threshold(0).build().unwrap();
    /// let mut packet = pool.acquire_chain(600).unwrap();
    /// packet.trim(20);
    /// packet.trim(-80);
    /// assert_eq!(packet.total_len(), 500);
    /// ```
    pub fn trim(&mut self, delta: i32) {
        let amount = usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX);
        let amount = amount.min(self.total_len());
        if amount == 0 {
            return;
        }
        if delta > 0 {
            self.trim_front(amount);
        } else {
            self.trim_back(amount);
        }
    }

    fn trim_front(&mut self, amount: usize) {
        if self.flags().contains(BufFlags::CHECKSUM) {
            let removed = self.prefix_sum(amount);
            let head = self.head_mut();
            let sum = checksum::strip_prefix(head.chk_sum(), removed, amount);
            head.set_chk_sum(sum);
        }

        let head = self.head_mut();
        head.set_total_len(head.total_len() - amount);

        let mut left = amount;
        let mut cur = Some(head);
        while let Some(buf) = cur {
            if left == 0 {
                break;
            }
            let n = buf.len().min(left);
            buf.advance(n);
            left -= n;
            cur = buf.next.as_deref_mut();
        }
    }

    fn trim_back(&mut self, amount: usize) {
        let new_total = self.total_len() - amount;
        let head = self.head_mut();
        head.set_total_len(new_total);

        // Fast path: the whole trim comes out of the tail descriptor.
        let tail_len = self.iter().last().map_or(0, |buf| buf.len());
        if tail_len >= amount {
            let mut cur = Some(self.head_mut());
            while let Some(buf) = cur {
                if buf.next.is_none() {
                    buf.set_len(tail_len - amount);
                    return;
                }
                cur = buf.next.as_deref_mut();
            }
            return;
        }

        let mut kept = 0;
        let mut cur = Some(self.head_mut());
        while let Some(buf) = cur {
            let len = buf.len().min(new_total - kept);
            buf.set_len(len);
            kept += len;
            cur = buf.next.as_deref_mut();
        }
    }

    fn prefix_sum(&self, amount: usize) -> u16 {
        let mut acc = Accumulator::new();
        let mut left = amount;
        for buf in self.iter() {
            if left == 0 {
                break;
            }
            let data = buf.data();
            let n = data.len().min(left);
            acc.update(&data[..n]);
            left -= n;
        }
        acc.finish()
    }
}
