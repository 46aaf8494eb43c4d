//! Conversions for the exponent-encoded timeout fields used throughout the CM protocol. A
//!  multiplier `n` stands for `4.096µs * 2^n`; five bits are available on the wire, so every
//!  value is limited to 31.

pub const MAX_TIMEOUT_MULT: u8 = 31;

/// milliseconds per multiplier, rounded up for the short values
const MULT_TO_MS: [u64; 32] = [
    1, 1, 1, 1, 1, 1, 1, 1,
    2, 3, 5, 9, 17, 34, 68, 135,
    269, 537, 1074, 2148, 4295, 8590, 17180, 34359,
    68720, 137438, 274877, 549755, 1099511, 2199023, 4398046, 8796093,
];

/// microseconds for the multipliers where millisecond accuracy is too coarse
const MULT_TO_US: [u64; 12] = [5, 9, 17, 33, 66, 132, 263, 525, 1048, 2097, 4197, 8388];

pub fn timeout_mult_to_ms(mult: u8) -> u64 {
    MULT_TO_MS[mult.min(MAX_TIMEOUT_MULT) as usize]
}

pub fn timeout_mult_to_us(mult: u8) -> u64 {
    match MULT_TO_US.get(mult as usize) {
        Some(&us) => us,
        None => timeout_mult_to_ms(mult) * 1000,
    }
}

/// smallest multiplier whose (truncated) duration covers `timeout_us`
pub fn timeout_us_to_mult(timeout_us: u64) -> u8 {
    for mult in 0..MAX_TIMEOUT_MULT {
        if timeout_us <= (4096u64 << mult) / 1000 {
            return mult;
        }
    }
    MAX_TIMEOUT_MULT
}

/// Local ack timeout for a path: twice the packet lifetime plus the remote CA's ack delay,
///  approximated in the log2 domain.
pub fn compute_ack_timeout(pkt_life_time: u8, ca_ack_delay: u8) -> u8 {
    let ack_timeout = if pkt_life_time as u16 + 1 >= ca_ack_delay as u16 {
        pkt_life_time as u16 + 2
    }
    else {
        ca_ack_delay as u16 + 1
    };
    ack_timeout.min(MAX_TIMEOUT_MULT as u16) as u8
}

/// Packet lifetime estimate derived from an ack timeout
pub fn pkt_life_from_ack_timeout(ack_timeout: u8) -> u8 {
    ack_timeout.saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 1)]
    #[case::below_one_ms(7, 1)]
    #[case::one_ms(8, 2)]
    #[case::sixteen_ms(12, 17)]
    #[case::one_second(18, 1074)]
    #[case::max(31, 8796093)]
    #[case::beyond_max(40, 8796093)]
    fn test_mult_to_ms(#[case] mult: u8, #[case] expected: u64) {
        assert_eq!(timeout_mult_to_ms(mult), expected);
    }

    #[rstest]
    #[case::zero(0, 5)]
    #[case::eleven(11, 8388)]
    #[case::twelve(12, 17000)]
    #[case::twenty(20, 4295000)]
    fn test_mult_to_us(#[case] mult: u8, #[case] expected: u64) {
        assert_eq!(timeout_mult_to_us(mult), expected);
    }

    #[rstest]
    #[case::zero(0, 0)]
    #[case::four(4, 0)]
    #[case::five(5, 1)]
    #[case::exact_threshold(4194, 10)]
    #[case::above_threshold(4195, 11)]
    #[case::sixty_ms(60_000, 14)]
    #[case::huge(u64::MAX, 31)]
    fn test_us_to_mult(#[case] us: u64, #[case] expected: u8) {
        assert_eq!(timeout_us_to_mult(us), expected);
    }

    #[test]
    fn test_us_to_mult_covers_mult_to_us() {
        for mult in 0..=20u8 {
            let back = timeout_us_to_mult(timeout_mult_to_us(mult));
            assert!(back == mult || back == mult + 1, "mult {} came back as {}", mult, back);
        }
    }

    #[rstest]
    #[case::pkt_dominates(10, 5, 12)]
    #[case::equal_plus_one(10, 11, 12)]
    #[case::ack_delay_dominates(5, 15, 16)]
    #[case::capped(30, 2, 31)]
    #[case::capped_delay(0, 31, 31)]
    fn test_compute_ack_timeout(#[case] pkt: u8, #[case] delay: u8, #[case] expected: u8) {
        assert_eq!(compute_ack_timeout(pkt, delay), expected);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 0)]
    #[case(19, 18)]
    fn test_pkt_life(#[case] ack_timeout: u8, #[case] expected: u8) {
        assert_eq!(pkt_life_from_ack_timeout(ack_timeout), expected);
    }
}
