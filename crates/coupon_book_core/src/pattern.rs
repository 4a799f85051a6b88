//! crates/coupon_book_core/src/pattern.rs
//!
//! Textual code patterns. `#` expands to a digit, `$` to an uppercase letter
//! and `*` to a lowercase letter; every other character is literal. The
//! `{BOOK_ID}` token is replaced once per job with the owning book's id.

use chrono::{DateTime, Utc};
use rand::Rng;

pub const DIGIT: char = '#';
pub const UPPER: char = '$';
pub const LOWER: char = '*';
pub const BOOK_TOKEN: &str = "{BOOK_ID}";

/// Pattern used when neither the request nor the book provides one.
pub const DEFAULT_PATTERN: &str = "CODE-####$$$$****";

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Codes are stored trimmed and uppercase.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// A pattern already scoped to one book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodePattern {
    template: String,
}

impl CodePattern {
    /// Scopes `pattern` to a book, prefixing the book token when it is missing.
    pub fn for_book(pattern: &str, book_id: i64) -> Self {
        let template = if pattern.contains(BOOK_TOKEN) {
            pattern.to_string()
        } else {
            format!("{}-{}", BOOK_TOKEN, pattern)
        };
        Self {
            template: template.replacen(BOOK_TOKEN, &book_id.to_string(), 1),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Resolves every placeholder independently.
    pub fn expand<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        self.template
            .chars()
            .map(|c| match c {
                DIGIT => char::from(b'0' + rng.gen_range(0..10u8)),
                UPPER => char::from(b'A' + rng.gen_range(0..26u8)),
                LOWER => char::from(b'a' + rng.gen_range(0..26u8)),
                other => other,
            })
            .collect()
    }

    /// The pattern with every placeholder removed.
    pub fn literal_stem(&self) -> String {
        self.template
            .chars()
            .filter(|c| !matches!(*c, DIGIT | UPPER | LOWER))
            .collect()
    }

    /// A code outside the pattern's space: stem plus timestamp and random suffix.
    pub fn fallback<R: Rng + ?Sized>(&self, rng: &mut R, now: DateTime<Utc>) -> String {
        let stem = self.literal_stem();
        let stem = stem.trim_end_matches('-');
        format!("{}-{}", stem, unique_suffix(rng, now))
    }
}

/// An alternative for a code that collided on insert.
pub fn collision_alternative<R: Rng + ?Sized>(code: &str, rng: &mut R, now: DateTime<Utc>) -> String {
    format!("{}-{}", code, unique_suffix(rng, now))
}

fn unique_suffix<R: Rng + ?Sized>(rng: &mut R, now: DateTime<Utc>) -> String {
    let millis = now.timestamp_millis().max(0) as u64;
    let random: String = (0..6)
        .map(|_| char::from(BASE36[rng.gen_range(0..BASE36.len())]))
        .collect();
    format!("{}-{}", to_base36(millis), random)
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn book_token_is_prefixed_when_missing() {
        assert_eq!(CodePattern::for_book("SALE-##", 7).as_str(), "7-SALE-##");
        assert_eq!(CodePattern::for_book("X{BOOK_ID}-$$", 12).as_str(), "X12-$$");
    }

    #[test]
    fn expansion_respects_character_classes() {
        let pattern = CodePattern::for_book("A-#$*", 3);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let code = pattern.expand(&mut rng);
            let chars: Vec<char> = code.chars().collect();
            assert_eq!(&code[..4], "3-A-");
            assert!(chars[4].is_ascii_digit());
            assert!(chars[5].is_ascii_uppercase());
            assert!(chars[6].is_ascii_lowercase());
            assert_eq!(chars.len(), 7);
        }
    }

    #[test]
    fn literal_stem_drops_placeholders() {
        let pattern = CodePattern::for_book("PROMO-##$", 1);
        assert_eq!(pattern.literal_stem(), "1-PROMO-");
    }

    #[test]
    fn fallback_codes_leave_the_pattern_space() {
        let pattern = CodePattern::for_book("#", 5);
        let mut rng = StdRng::seed_from_u64(1);
        let now = Utc::now();
        let a = pattern.fallback(&mut rng, now);
        let b = pattern.fallback(&mut rng, now);
        assert!(a.starts_with("5-"));
        assert_ne!(a, b);
        assert!(!a.contains('#'));
    }

    #[test]
    fn base36_encoding() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn codes_normalize_to_trimmed_uppercase() {
        assert_eq!(normalize_code("  abc-12x "), "ABC-12X");
    }
}
