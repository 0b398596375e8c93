//! Approximate text matching.
//!
//! A [`FuzzyString`] persists three facets of a text value: the original, a
//! diacritic-stripped form and a phonetic hash. Full-text indexes are built on
//! the hash facet, so a fuzzy search hashes its term the same way and matches
//! sound-alike words regardless of spelling or accents.
//!
//! Everything here is pure: identical input always yields identical output.

use serde::{Deserialize, Serialize};
use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

use crate::metaphone::DoubleMetaphone;

/// A text value stored together with its normalized form and phonetic hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FuzzyString {
    pub value: String,
    pub normalized: String,
    pub hash: String,
}

impl FuzzyString {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            normalized: strip_diacritics(&value),
            hash: phonetic_hash(&value),
            value,
        }
    }

    /// Path of the hash facet below a field named `field`, for text indexes.
    pub fn hash_path(field: &str) -> String {
        format!("{field}.hash")
    }
}

impl From<&str> for FuzzyString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FuzzyString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Removes diacritics, mapping accented Latin letters to their base letters.
///
/// Letters whose base form is not reachable through canonical decomposition
/// (`ø`, `ł`, `đ`, `ß`, `æ`, `œ`, `ı`) are mapped explicitly.
pub fn strip_diacritics(value: &str) -> String {
    let mut stripped = String::with_capacity(value.len());
    for c in value.nfd().filter(|c| !is_combining_mark(*c)) {
        match c {
            'ø' => stripped.push('o'),
            'Ø' => stripped.push('O'),
            'ł' => stripped.push('l'),
            'Ł' => stripped.push('L'),
            'đ' => stripped.push('d'),
            'Đ' => stripped.push('D'),
            'ß' => stripped.push_str("ss"),
            'æ' => stripped.push_str("ae"),
            'Æ' => stripped.push_str("AE"),
            'œ' => stripped.push_str("oe"),
            'Œ' => stripped.push_str("OE"),
            'ı' => stripped.push('i'),
            other => stripped.push(other),
        }
    }
    stripped
}

/// Computes the phonetic hash of a text value.
///
/// Diacritics are stripped first, the text is split on whitespace, each
/// token is encoded with Double Metaphone, and the per-token codes are joined
/// with single spaces in the original token order. Tokens without a code
/// (punctuation, digits) are dropped.
pub fn phonetic_hash(value: &str) -> String {
    let encoder = DoubleMetaphone::default();
    strip_diacritics(value)
        .split_whitespace()
        .map(|token| encoder.primary(token))
        .filter(|code| !code.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Levenshtein edit distance between two strings, counted in characters.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b = b.chars().collect::<Vec<_>>();
    let mut previous = (0..=b.len()).collect::<Vec<_>>();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != *cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Re-orders fuzzy search results by closeness to the search term.
///
/// Distances are computed case- and diacritic-insensitively between `term`
/// and the text `key` extracts from each item. Items farther than
/// `max_distance` are dropped when a limit is given. Ties keep their
/// original relative order.
pub fn rank_by_relevance<T>(
    items: Vec<T>,
    term: &str,
    key: impl Fn(&T) -> &str,
    max_distance: Option<usize>,
) -> Vec<T> {
    let term = strip_diacritics(term).to_lowercase();
    let mut scored = items
        .into_iter()
        .map(|item| {
            let text = strip_diacritics(key(&item)).to_lowercase();
            (levenshtein(&term, &text), item)
        })
        .filter(|(distance, _)| max_distance.is_none_or(|max| *distance <= max))
        .collect::<Vec<_>>();
    scored.sort_by_key(|(distance, _)| *distance);
    scored.into_iter().map(|(_, item)| item).collect()
}
