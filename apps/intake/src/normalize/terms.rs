//! Word-bounded term matching shared by field parsing and screening.

/// Characters that belong to a term. `+` and `#` keep `c++` and `c#` whole.
fn is_term_char(c: char) -> bool {
    c.is_alphanumeric() || c == '+' || c == '#'
}

/// Case-insensitive whole-term search. `haystack` must already be lower-cased.
pub fn contains_term(haystack: &str, term: &str) -> bool {
    count_term(haystack, term) > 0
}

/// Number of whole-term occurrences of `term` in a lower-cased `haystack`.
pub fn count_term(haystack: &str, term: &str) -> usize {
    let needle = term.trim().to_lowercase();
    if needle.is_empty() {
        return 0;
    }
    haystack
        .match_indices(&needle)
        .filter(|(start, matched)| {
            let before = haystack[..*start].chars().next_back();
            let after = haystack[start + matched.len()..].chars().next();
            let starts_clean = before
                .map_or(true, |c| !is_term_char(c) || !is_term_char_at_edge(&needle, true));
            let ends_clean =
                after.map_or(true, |c| !is_term_char(c) || !is_term_char_at_edge(&needle, false));
            starts_clean && ends_clean
        })
        .count()
}

/// Edge check: a term that starts or ends with punctuation (".net", "c++")
/// only needs a boundary on its alphanumeric side.
fn is_term_char_at_edge(needle: &str, leading: bool) -> bool {
    let edge = if leading {
        needle.chars().next()
    } else {
        needle.chars().next_back()
    };
    edge.map_or(false, is_term_char)
}
