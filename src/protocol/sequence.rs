//! Wrap-aware RTP sequence number arithmetic
//!
//! All modulo-65536 reasoning lives here so the jitter buffer and the
//! packetizer never do index math on raw `u16`s themselves.

/// Half of the sequence space; distances at or beyond this are "behind".
const HALF_RANGE: u16 = 0x8000;

/// Sequence number that follows `seq`
#[inline]
pub fn next(seq: u16) -> u16 {
    seq.wrapping_add(1)
}

/// Forward distance from `expected` to `received`, modulo 65536
///
/// Zero means `received` is exactly the expected packet.
#[inline]
pub fn gap(expected: u16, received: u16) -> u16 {
    received.wrapping_sub(expected)
}

/// Serial-number comparison (RFC 1982): is `a` strictly ahead of `b`?
#[inline]
pub fn is_newer(a: u16, b: u16) -> bool {
    let d = a.wrapping_sub(b);
    d != 0 && d < HALF_RANGE
}

/// Packets missing between the last sequence seen and `received`
///
/// Returns `None` when `received` is not ahead of `last` (late or
/// duplicate), otherwise the number of skipped sequence numbers.
#[inline]
pub fn missing_between(last: u16, received: u16) -> Option<u16> {
    if is_newer(received, last) {
        Some(gap(next(last), received))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_next_wraps() {
        assert_eq!(next(0), 1);
        assert_eq!(next(65535), 0);
    }

    #[test]
    fn test_gap_across_wrap() {
        assert_eq!(gap(65535, 0), 1);
        assert_eq!(gap(65534, 2), 4);
        assert_eq!(gap(10, 10), 0);
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer(1, 0));
        assert!(is_newer(0, 65535));
        assert!(!is_newer(65535, 0));
        assert!(!is_newer(7, 7));
    }

    #[test]
    fn test_missing_between() {
        assert_eq!(missing_between(5, 6), Some(0));
        assert_eq!(missing_between(5, 9), Some(3));
        assert_eq!(missing_between(65534, 1), Some(2));
        assert_eq!(missing_between(9, 5), None);
        assert_eq!(missing_between(9, 9), None);
    }

    proptest! {
        #[test]
        fn prop_gap_inverts_offset(base in any::<u16>(), offset in any::<u16>()) {
            prop_assert_eq!(gap(base, base.wrapping_add(offset)), offset);
        }

        #[test]
        fn prop_newer_is_antisymmetric(a in any::<u16>(), b in any::<u16>()) {
            prop_assume!(a.wrapping_sub(b) != HALF_RANGE);
            prop_assert!(!(is_newer(a, b) && is_newer(b, a)));
            if a != b {
                prop_assert!(is_newer(a, b) || is_newer(b, a));
            }
        }

        #[test]
        fn prop_forward_jump_counts_skipped(last in any::<u16>(), skipped in 0u16..HALF_RANGE - 1) {
            let received = last.wrapping_add(skipped).wrapping_add(1);
            prop_assert_eq!(missing_between(last, received), Some(skipped));
        }
    }
}
