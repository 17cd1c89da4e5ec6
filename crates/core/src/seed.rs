/// Extracts the seed from a source filename: the first run of decimal
/// digits in the basename, e.g. `mbl_10234.h5` and `10234.h5` both give
/// `10234`.
pub fn seed_from_filename(name: &str) -> Option<i64> {
    let start = name.find(|c: char| c.is_ascii_digit())?;
    let digits: &str = &name[start..];
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_digit_run_wins() {
        assert_eq!(seed_from_filename("mbl_10234.h5"), Some(10234));
        assert_eq!(seed_from_filename("10234.h5"), Some(10234));
        assert_eq!(seed_from_filename("run_7_retry_9.h5"), Some(7));
        assert_eq!(seed_from_filename("nodigits.h5"), None);
    }
}
