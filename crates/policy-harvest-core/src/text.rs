//! Small string helpers shared by the recognizer, resolver, and validator.

/// Collapses every run of whitespace to a single space and trims the ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Largest char boundary `<= idx`.
pub fn floor_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Smallest char boundary `>= idx`.
pub fn ceil_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Byte-window of `radius` bytes either side of `start..end`, snapped to
/// char boundaries and whitespace-collapsed.
pub fn context_window(s: &str, start: usize, end: usize, radius: usize) -> String {
    let lo = floor_char_boundary(s, start.saturating_sub(radius));
    let hi = ceil_char_boundary(s, end.saturating_add(radius));
    collapse_whitespace(&s[lo..hi])
}

/// `"cervical plexus block"` -> `"Cervical Plexus Block"`.
pub fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    let rest: String = chars.as_str().to_lowercase();
                    first.to_uppercase().collect::<String>() + &rest
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowercased alphanumerics only. Used for dedup keys.
pub fn normalize_key(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}
