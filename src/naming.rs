//! Chapter filename parsing for the `NNN-name` convention.
//!
//! Chapter files carry an optional numeric prefix that fixes their document
//! order, followed by a slug:
//!
//! - `001-the-opening.md` → number 1, title "the opening"
//! - `012.txt` → number 12, no title
//! - `appendix.md` → unnumbered, title "appendix"
//!
//! Unnumbered chapters sort after every numbered one, by name.

use std::cmp::Ordering;

/// Parsed form of a chapter file stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterName {
    /// Ordering prefix, if the stem starts with digits followed by `-` or ends there.
    pub number: Option<u32>,
    /// The part after `NNN-`, dashes preserved. The whole stem when unnumbered.
    pub slug: String,
}

impl ChapterName {
    /// Human title: slug with dashes and underscores turned into spaces.
    /// `None` for number-only stems like `012`.
    pub fn title(&self) -> Option<String> {
        if self.slug.is_empty() {
            None
        } else {
            Some(self.slug.replace(['-', '_'], " "))
        }
    }

    /// Document order: numbered chapters first (by number, then slug),
    /// unnumbered ones after (by slug).
    pub fn document_order(&self, other: &Self) -> Ordering {
        match (self.number, other.number) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.slug.cmp(&other.slug)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.slug.cmp(&other.slug),
        }
    }
}

/// Parse a chapter file stem (extension already removed).
pub fn parse_chapter_name(stem: &str) -> ChapterName {
    let (prefix, rest) = match stem.split_once('-') {
        Some((prefix, rest)) => (prefix, Some(rest)),
        None => (stem, None),
    };
    match prefix.parse::<u32>() {
        Ok(number) => ChapterName {
            number: Some(number),
            slug: rest.unwrap_or_default().to_string(),
        },
        Err(_) => ChapterName {
            number: None,
            slug: stem.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_with_slug() {
        let n = parse_chapter_name("003-the-long-night");
        assert_eq!(n.number, Some(3));
        assert_eq!(n.slug, "the-long-night");
        assert_eq!(n.title().as_deref(), Some("the long night"));
    }

    #[test]
    fn number_only() {
        let n = parse_chapter_name("012");
        assert_eq!(n.number, Some(12));
        assert_eq!(n.slug, "");
        assert_eq!(n.title(), None);
    }

    #[test]
    fn number_with_trailing_dash() {
        let n = parse_chapter_name("007-");
        assert_eq!(n.number, Some(7));
        assert_eq!(n.title(), None);
    }

    #[test]
    fn unnumbered_keeps_whole_stem() {
        let n = parse_chapter_name("epilogue-part-two");
        assert_eq!(n.number, None);
        assert_eq!(n.slug, "epilogue-part-two");
        assert_eq!(n.title().as_deref(), Some("epilogue part two"));
    }

    #[test]
    fn underscores_become_spaces() {
        let n = parse_chapter_name("002-chapter_two");
        assert_eq!(n.title().as_deref(), Some("chapter two"));
    }

    #[test]
    fn numbered_sorts_before_unnumbered() {
        let a = parse_chapter_name("900-late");
        let b = parse_chapter_name("appendix");
        assert_eq!(a.document_order(&b), Ordering::Less);
        assert_eq!(b.document_order(&a), Ordering::Greater);
    }

    #[test]
    fn numbers_compare_numerically() {
        let a = parse_chapter_name("9-nine");
        let b = parse_chapter_name("10-ten");
        assert_eq!(a.document_order(&b), Ordering::Less);
    }
}
