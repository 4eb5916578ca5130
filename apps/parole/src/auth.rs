use subtle::ConstantTimeEq;

/// Compares the presented credential against the configured secret without
/// leaking how much of a prefix matched. Length still short-circuits, which
/// is fine: the secret's length is not the secret.
pub fn authenticate(presented: &str, configured: &str) -> bool {
    presented.as_bytes().ct_eq(configured.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::deadline]
    fn accepts_only_an_exact_match() {
        assert!(authenticate("hunter2", "hunter2"));
        assert!(!authenticate("hunter2 ", "hunter2"));
        assert!(!authenticate("Hunter2", "hunter2"));
    }

    #[test_deadline::deadline]
    fn rejects_single_character_differences() {
        let secret = "correct-horse-battery-staple";
        for i in 0..secret.len() {
            let mut mutated = secret.as_bytes().to_vec();
            mutated[i] ^= 0x01;
            let mutated = String::from_utf8(mutated).unwrap();
            assert!(!authenticate(&mutated, secret), "accepted {mutated}");
        }
    }

    #[test_deadline::deadline]
    fn rejects_prefixes_and_extensions() {
        assert!(!authenticate("", "secret"));
        assert!(!authenticate("sec", "secret"));
        assert!(!authenticate("secrets", "secret"));
    }
}
