//! Vectored buffer helpers used for positioned scatter/gather disk I/O.
//!
//! A piece's data, once assembled from its constituent blocks, is rarely
//! contiguous in file: it may straddle several files in a multi-file
//! torrent. These types let the disk task build up a list of borrowed
//! buffer slices and adjust that list as a vectored write is split across
//! file boundaries, without copying the underlying bytes.

use nix::sys::uio::IoVec as NixIoVec;

/// A single vectored buffer, borrowing its bytes from somewhere else (the
/// piece's assembled block map).
#[derive(Clone, Copy, Debug)]
pub(crate) struct IoVec<'a>(NixIoVec<&'a [u8]>);

impl<'a> IoVec<'a> {
    /// Wraps a byte slice as a single vectored buffer.
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self(NixIoVec::from_slice(buf))
    }

    /// Returns the underlying slice.
    pub fn as_slice(&self) -> &'a [u8] {
        self.0.as_slice()
    }

    /// Returns the length of the buffer.
    pub fn len(&self) -> usize {
        self.0.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A list of [`IoVec`]s, representing the buffers of a single vectored write
/// or read, that can be split at file boundaries and advanced as a partial
/// operation completes.
#[derive(Clone, Debug)]
pub(crate) struct IoVecs<'a> {
    bufs: Vec<IoVec<'a>>,
}

impl<'a> IoVecs<'a> {
    /// Wraps the given buffers without bounding their total length.
    pub fn unbounded(bufs: impl Iterator<Item = &'a [u8]>) -> Self {
        Self {
            bufs: bufs.map(IoVec::from_slice).collect(),
        }
    }

    /// Wraps the given buffers, truncating the total represented length to
    /// `bound` bytes. Used to limit a piece's assembled buffers to the
    /// length of whichever file they're about to be written into.
    ///
    /// # Panics
    ///
    /// Panics if `bound` is larger than the combined length of `bufs`.
    pub fn bounded(bufs: impl Iterator<Item = &'a [u8]>, bound: u64) -> Self {
        let mut bound = bound;
        let mut result = Vec::new();
        for buf in bufs {
            if bound == 0 {
                break;
            }
            let take = (buf.len() as u64).min(bound) as usize;
            result.push(IoVec::from_slice(&buf[..take]));
            bound -= take as u64;
        }
        assert_eq!(bound, 0, "bound exceeds combined buffer length");
        Self { bufs: result }
    }

    /// Returns the nix-compatible slice of buffers, ready to be passed to
    /// `pwritev`/`preadv`.
    pub fn buffers(&self) -> Vec<NixIoVec<&'a [u8]>> {
        self.bufs.iter().map(|b| b.0).collect()
    }

    /// Returns the combined length of all buffers.
    pub fn len(&self) -> u64 {
        self.bufs.iter().map(|b| b.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty() || self.len() == 0
    }

    /// Advances the buffer list by `n` bytes, dropping fully consumed
    /// buffers and truncating the first partially consumed one from the
    /// front. Used after a short/partial vectored write reports how many
    /// bytes actually landed.
    pub fn advance(&mut self, mut n: u64) {
        while n > 0 {
            let front_len = match self.bufs.first() {
                Some(b) => b.len() as u64,
                None => break,
            };
            if n >= front_len {
                self.bufs.remove(0);
                n -= front_len;
            } else {
                let front = self.bufs.remove(0);
                let remainder = &front.as_slice()[n as usize..];
                self.bufs.insert(0, IoVec::from_slice(remainder));
                n = 0;
            }
        }
    }

    /// Splits off and returns the tail of the buffer list starting at byte
    /// offset `at`, consuming `self` down to just the head (`[0, at)`).
    ///
    /// Used when a piece's buffers span more files than the one currently
    /// being written to: the head is written to the current file, and the
    /// tail becomes the buffer list for the next file.
    pub fn into_tail(mut self, at: u64) -> (Self, Self) {
        let mut head = Vec::new();
        let mut remaining = at;
        while remaining > 0 {
            let front_len = self.bufs[0].len() as u64;
            if remaining >= front_len {
                head.push(self.bufs.remove(0));
                remaining -= front_len;
            } else {
                let front = self.bufs.remove(0);
                let (h, t) = front.as_slice().split_at(remaining as usize);
                head.push(IoVec::from_slice(h));
                self.bufs.insert(0, IoVec::from_slice(t));
                remaining = 0;
            }
        }
        (Self { bufs: head }, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded() {
        let a = vec![1u8; 4];
        let b = vec![2u8; 4];
        let bufs = IoVecs::bounded(vec![a.as_slice(), b.as_slice()].into_iter(), 6);
        assert_eq!(bufs.len(), 6);
    }

    #[test]
    fn test_advance_across_buffers() {
        let a = vec![1u8; 4];
        let b = vec![2u8; 4];
        let mut bufs =
            IoVecs::unbounded(vec![a.as_slice(), b.as_slice()].into_iter());
        bufs.advance(6);
        assert_eq!(bufs.len(), 2);
    }

    #[test]
    fn test_into_tail() {
        let a = vec![1u8; 4];
        let b = vec![2u8; 4];
        let bufs = IoVecs::unbounded(vec![a.as_slice(), b.as_slice()].into_iter());
        let (head, tail) = bufs.into_tail(6);
        assert_eq!(head.len(), 6);
        assert_eq!(tail.len(), 2);
    }
}
