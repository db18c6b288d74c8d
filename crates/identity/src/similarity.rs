//! Profile similarity used by the weakest linking heuristic.

use std::collections::BTreeSet;

/// The profile fields the heuristic compares.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileView<'a> {
    pub username: Option<&'a str>,
    pub display_name: Option<&'a str>,
    pub bio: Option<&'a str>,
}

/// Lowercased alphanumeric tokens of at least two characters.
pub fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard similarity of the token sets; 0.0 when either side is empty.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let a = tokens(a);
    let b = tokens(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count() as f64;
    let total = a.union(&b).count() as f64;
    shared / total
}

fn same_text(a: Option<&str>, b: Option<&str>) -> bool {
    match (a.map(str::trim), b.map(str::trim)) {
        (Some(a), Some(b)) if !a.is_empty() => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

/// 0.0 unless usernames match; otherwise 0.5 plus up to 0.5 for matching
/// display names or overlapping bios.
pub fn profile_score(a: &ProfileView<'_>, b: &ProfileView<'_>) -> f64 {
    if !same_text(a.username, b.username) {
        return 0.0;
    }
    let display = if same_text(a.display_name, b.display_name) { 1.0 } else { 0.0 };
    let bio = match (a.bio, b.bio) {
        (Some(x), Some(y)) => jaccard(x, y),
        _ => 0.0,
    };
    0.5 + 0.5 * f64::max(display, bio)
}
