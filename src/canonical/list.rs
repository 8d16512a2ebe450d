//! Order-insensitive canonical form for delimited lists
//!
//! Used for group-by column lists and evaluation interval strings. Tokens
//! are trimmed and sorted; duplicates are kept.

use crate::canonical::sha1_hex;

/// Default list delimiter
pub const DEFAULT_DELIMITER: char = ',';

/// Trim every token, sort lexicographically and rejoin with the same delimiter
pub fn canonical_list(list: &str, delimiter: char) -> String {
    let mut items: Vec<&str> = list.split(delimiter).map(str::trim).collect();
    items.sort_unstable();
    let separator = delimiter.to_string();
    items.join(&separator)
}

/// Hash of a comma-separated list
pub fn hash_list(list: &str) -> String {
    hash_list_with(list, DEFAULT_DELIMITER)
}

/// Hash of a list with a custom delimiter
///
/// Empty or whitespace-only input maps to `""` without hashing.
pub fn hash_list_with(list: &str, delimiter: char) -> String {
    if list.trim().is_empty() {
        return String::new();
    }
    sha1_hex(&canonical_list(list, delimiter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_insensitive() {
        let expected = "a1f86715f2bfd6bb0d269777e85422d81d222068";
        assert_eq!(hash_list("B, A"), expected);
        assert_eq!(hash_list("A, B"), expected);
        assert_eq!(hash_list("A,B"), expected);
    }

    #[test]
    fn test_duplicates_are_retained() {
        let expected = "686ba37964a11c4d915667a90ca6648ebff574fc";
        assert_eq!(hash_list("A, B,    C, A"), expected);
        assert_eq!(hash_list("A, A, B, C"), expected);
        assert_ne!(hash_list("A, B, C"), expected);
    }

    #[test]
    fn test_irregular_whitespace() {
        let expected = "60cea2c8ac6db68c05f2a9ac2e799d23917aa79c";
        assert_eq!(hash_list("abc, whaterrrere,     ddd,    qq"), expected);
        assert_eq!(hash_list("abc,ddd,whaterrrere,qq"), expected);
    }

    #[test]
    fn test_empty_list() {
        assert_eq!(hash_list(""), "");
        assert_eq!(hash_list("  "), "");
    }

    #[test]
    fn test_custom_delimiter() {
        assert_eq!(canonical_list("c| a |b", '|'), "a|b|c");
        assert_eq!(hash_list_with("B| A", '|'), hash_list_with("A|B", '|'));
    }

    #[test]
    fn test_cron_interval_is_single_token() {
        assert_eq!(canonical_list("*/5 * * * *", ','), "*/5 * * * *");
        assert_eq!(
            hash_list("*/5 * * * *"),
            "dd41b12a27b0065a5ae6237c90e050eeded59848"
        );
    }
}
