//! FDSN wildcard patterns: `*` matches any run of characters, `?` matches
//! exactly one. Used both for in-memory matching and for translation into
//! SQL `LIKE` patterns.

/// Escape character used in generated `LIKE` patterns.
pub const SQL_LIKE_ESCAPE: char = '/';

/// Match `value` against an FDSN wildcard `pattern`.
pub fn matches(pattern: &str, value: &str) -> bool {
    matches_at(
        &pattern.chars().collect::<Vec<_>>(),
        &value.chars().collect::<Vec<_>>(),
    )
}

fn matches_at(pattern: &[char], value: &[char]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some(('*', rest)) => (0..=value.len()).any(|skip| matches_at(rest, &value[skip..])),
        Some(('?', rest)) => value
            .split_first()
            .map_or(false, |(_, tail)| matches_at(rest, tail)),
        Some((literal, rest)) => value
            .split_first()
            .map_or(false, |(head, tail)| head == literal && matches_at(rest, tail)),
    }
}

/// Translate an FDSN wildcard pattern into a SQL `LIKE` pattern.
///
/// `_` and `%` occurring literally are escaped with [`SQL_LIKE_ESCAPE`]
/// before `?` and `*` are substituted.
pub fn to_sql_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '_' | '%' => {
                out.push(SQL_LIKE_ESCAPE);
                out.push(c);
            }
            '?' => out.push('_'),
            '*' => out.push('%'),
            c if c == SQL_LIKE_ESCAPE => {
                out.push(SQL_LIKE_ESCAPE);
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_match() {
        assert!(matches("HHZ", "HHZ"));
        assert!(!matches("HHZ", "HHN"));
        assert!(!matches("HHZ", "HHZZ"));
    }

    #[test]
    fn single_char_wildcard() {
        assert!(matches("HH?", "HHZ"));
        assert!(matches("?H?", "BHZ"));
        assert!(!matches("HH?", "HH"));
    }

    #[test]
    fn multi_char_wildcard() {
        assert!(matches("*", ""));
        assert!(matches("*", "HASLI"));
        assert!(matches("H*", "HASLI"));
        assert!(matches("*Z", "HHZ"));
        assert!(matches("H*I", "HASLI"));
        assert!(!matches("H*I", "DAVOX"));
    }

    #[test]
    fn empty_pattern_only_matches_empty() {
        assert!(matches("", ""));
        assert!(!matches("", "X"));
    }

    #[test]
    fn sql_like_translation() {
        assert_eq!(to_sql_like("HH?"), "HH_");
        assert_eq!(to_sql_like("H*"), "H%");
        assert_eq!(to_sql_like("A_B"), "A/_B");
        assert_eq!(to_sql_like("A%B"), "A/%B");
        assert_eq!(to_sql_like("A/B"), "A//B");
    }
}
