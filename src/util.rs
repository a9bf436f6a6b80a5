use std::ops::{Deref, DerefMut};

/// The first element of `prefs` that also appears in `avail`.
///
/// Used everywhere a negotiation breaks ties by local preference order.
pub fn first_in_both<T: Clone + PartialEq>(prefs: &[T], avail: &[T]) -> Option<T> {
    prefs.iter().find(|item| avail.contains(item)).cloned()
}

/// Constant-time equality over secret material.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

/// A byte buffer that is wiped through a volatile write when dropped.
///
/// Holds key material, master secrets and private scalars so that the
/// compiler cannot elide the zeroization.
#[derive(Clone, Default)]
pub struct Zeroized(Vec<u8>);

impl Zeroized {
    pub fn new(bytes: Vec<u8>) -> Self {
        Zeroized(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Zeroized(bytes.to_vec())
    }

    pub fn empty() -> Self {
        Zeroized(Vec::new())
    }

    pub fn into_inner(mut self) -> Vec<u8> {
        std::mem::take(&mut self.0)
    }
}

impl Deref for Zeroized {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for Zeroized {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl From<Vec<u8>> for Zeroized {
    fn from(bytes: Vec<u8>) -> Self {
        Zeroized(bytes)
    }
}

impl PartialEq for Zeroized {
    fn eq(&self, other: &Zeroized) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for Zeroized {}

impl Drop for Zeroized {
    fn drop(&mut self) {
        for byte in self.0.iter_mut() {
            unsafe {
                std::ptr::write_volatile(byte, 0);
            }
        }
    }
}

impl std::fmt::Debug for Zeroized {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Zeroized({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_in_both_respects_preference_order() {
        let prefs = [3u16, 1, 2];
        let avail = [2u16, 1];
        assert_eq!(first_in_both(&prefs, &avail), Some(1));
        assert_eq!(first_in_both(&prefs, &[]), None);
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn zeroized_roundtrip() {
        let z = Zeroized::from_slice(&[1, 2, 3]);
        assert_eq!(&*z, &[1, 2, 3]);
        assert_eq!(z.into_inner(), vec![1, 2, 3]);
    }
}
