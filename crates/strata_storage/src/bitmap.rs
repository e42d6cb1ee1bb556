/// A compact bit vector used for null masks and delete overlays.
///
/// Bits are stored little-endian within each `u64` word: bit 0 is the LSB of
/// word 0. The byte encoding (`to_bytes`) is LSB-first per byte, which is
/// the layout persisted in catalog entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(bits: usize) -> Self {
        Self {
            words: vec![0u64; bits.div_ceil(64)],
            len: bits,
        }
    }

    pub fn from_bools(bits: &[bool]) -> Self {
        let mut map = Self::with_len(bits.len());
        for (i, &b) in bits.iter().enumerate() {
            if b {
                map.set(i);
            }
        }
        map
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grow to at least `bits`, new bits cleared.
    pub fn ensure_len(&mut self, bits: usize) {
        if bits > self.len {
            self.words.resize(bits.div_ceil(64), 0);
            self.len = bits;
        }
    }

    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        (self.words[idx / 64] >> (idx % 64)) & 1 == 1
    }

    /// Set bit `idx`, growing if necessary. Returns true if the bit was
    /// previously clear.
    pub fn set(&mut self, idx: usize) -> bool {
        self.ensure_len(idx + 1);
        let word = &mut self.words[idx / 64];
        let mask = 1u64 << (idx % 64);
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            let mut bits = w;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let tz = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(wi * 64 + tz)
            })
        })
    }

    pub fn to_bools(&self) -> Vec<bool> {
        (0..self.len).map(|i| self.get(i)).collect()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len.div_ceil(8)];
        for idx in self.iter_ones() {
            out[idx / 8] |= 1 << (idx % 8);
        }
        out
    }

    /// Decode `bits` bits from an LSB-first byte string.
    pub fn from_bytes(bytes: &[u8], bits: usize) -> Option<Self> {
        if bytes.len() < bits.div_ceil(8) {
            return None;
        }
        let mut map = Self::with_len(bits);
        for idx in 0..bits {
            if bytes[idx / 8] >> (idx % 8) & 1 == 1 {
                map.set(idx);
            }
        }
        Some(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_count() {
        let mut b = Bitmap::with_len(130);
        assert!(b.set(0));
        assert!(b.set(64));
        assert!(b.set(129));
        assert!(!b.set(64));
        assert!(b.get(129));
        assert!(!b.get(128));
        assert_eq!(b.count_ones(), 3);
        assert_eq!(b.iter_ones().collect::<Vec<_>>(), vec![0, 64, 129]);
    }

    #[test]
    fn test_set_grows() {
        let mut b = Bitmap::new();
        b.set(70);
        assert_eq!(b.len(), 71);
        assert!(b.get(70));
        assert!(!b.get(5000));
    }

    #[test]
    fn test_byte_encoding() {
        let b = Bitmap::from_bools(&[true, false, false, true, false, false, false, false, true]);
        let bytes = b.to_bytes();
        assert_eq!(bytes, vec![0b0000_1001, 0b0000_0001]);
        assert_eq!(Bitmap::from_bytes(&bytes, 9).unwrap(), b);
        assert!(Bitmap::from_bytes(&bytes[..1], 9).is_none());
    }
}
