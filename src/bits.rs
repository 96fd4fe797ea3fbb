/// Return whether bit `bit` of `x` is set.
pub fn test_bit(bit: u64, x: u64) -> bool {
    (x >> bit) & 1 == 1
}

/// Return `x` with bit `bit` set to `v`.
pub fn bit(bit: u64, x: u64, v: bool) -> u64 {
    if v {
        x | (1 << bit)
    } else {
        x & !(1 << bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_clear() {
        let x = bit(3, 0, true);
        assert_eq!(x, 8);
        assert!(test_bit(3, x));
        assert!(!test_bit(2, x));
        assert_eq!(bit(3, x, false), 0);
    }
}
