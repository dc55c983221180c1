use crate::segment::{Segment, parse_source};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Identity of the segment every story starts from.
pub const ENTRY_IDENTITY: &str = "index.md";
const PLACEHOLDER_TITLE: &str = "Adventure Index";

/// A segment file as read from a session directory, before parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSegment {
    #[serde(rename = "filename")]
    pub identity: String,
    pub content: String,
}

impl RawSegment {
    pub fn new(identity: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            content: content.into(),
        }
    }
}

/// Stable handle to a segment inside one [`SegmentCollection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKey {
    Entry,
    Other(usize),
}

/// The parsed segments of one story. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentCollection {
    entry: Segment,
    others: Vec<Segment>,
}

impl SegmentCollection {
    /// Builds a collection from raw segment files, in input order. A missing
    /// `index.md` is replaced by a placeholder entry.
    pub fn build(raw: &[RawSegment]) -> Self {
        let entry = match raw.iter().find(|seg| seg.identity == ENTRY_IDENTITY) {
            Some(seg) => parse_source(&seg.identity, &seg.content),
            None => {
                warn!(segments = raw.len(), "story has no index.md, using placeholder entry");
                Segment::placeholder(ENTRY_IDENTITY, PLACEHOLDER_TITLE, "")
            }
        };
        let others = raw
            .iter()
            .filter(|seg| seg.identity != ENTRY_IDENTITY)
            .map(|seg| parse_source(&seg.identity, &seg.content))
            .collect();
        Self { entry, others }
    }

    /// Collection shown when the raw segments could not be obtained at all.
    pub fn failed(message: &str) -> Self {
        Self {
            entry: Segment::placeholder(ENTRY_IDENTITY, PLACEHOLDER_TITLE, message),
            others: Vec::new(),
        }
    }

    pub fn title(&self) -> &str {
        &self.entry.title
    }

    pub fn entry(&self) -> &Segment {
        &self.entry
    }

    pub fn others(&self) -> &[Segment] {
        &self.others
    }

    pub fn get(&self, key: SegmentKey) -> Option<&Segment> {
        match key {
            SegmentKey::Entry => Some(&self.entry),
            SegmentKey::Other(idx) => self.others.get(idx),
        }
    }

    /// Looks up a segment by its source identity, entry included.
    pub fn find_source(&self, identity: &str) -> Option<SegmentKey> {
        self.iter()
            .find(|(_, segment)| segment.source == identity)
            .map(|(key, _)| key)
    }

    /// Entry first, then the other segments in collection order.
    pub fn iter(&self) -> impl Iterator<Item = (SegmentKey, &Segment)> + '_ {
        std::iter::once((SegmentKey::Entry, &self.entry)).chain(
            self.others
                .iter()
                .enumerate()
                .map(|(idx, segment)| (SegmentKey::Other(idx), segment)),
        )
    }

    /// Number of segments, entry included.
    pub fn segment_count(&self) -> usize {
        self.others.len() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(identity: &str, title: &str) -> RawSegment {
        RawSegment::new(identity, format!("---\ntitle: {title}\n---\n\nText for {title}."))
    }

    #[test]
    fn entry_is_index_and_others_keep_order() {
        let collection = SegmentCollection::build(&[
            raw("cave.md", "The Cave"),
            raw("index.md", "Start Here"),
            raw("forest.md", "The Forest"),
        ]);
        assert_eq!(collection.entry().title, "Start Here");
        assert_eq!(collection.title(), "Start Here");
        let titles: Vec<_> = collection.others().iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, ["The Cave", "The Forest"]);
        assert_eq!(collection.segment_count(), 3);
    }

    #[test]
    fn missing_index_gets_placeholder() {
        let collection = SegmentCollection::build(&[raw("cave.md", "The Cave")]);
        assert_eq!(collection.entry().title, "Adventure Index");
        assert!(collection.entry().body.is_empty());
        assert!(collection.entry().choices.is_empty());
        assert_eq!(collection.others().len(), 1);
    }

    #[test]
    fn empty_input_still_has_an_entry() {
        let collection = SegmentCollection::build(&[]);
        assert_eq!(collection.entry().title, "Adventure Index");
        assert!(collection.others().is_empty());
    }

    #[test]
    fn failed_collection_carries_message() {
        let collection = SegmentCollection::failed("Error loading adventure.");
        assert_eq!(collection.entry().body, "Error loading adventure.");
        assert!(collection.others().is_empty());
    }

    #[test]
    fn duplicate_titles_are_kept_apart_by_source() {
        let collection = SegmentCollection::build(&[
            raw("a.md", "Same"),
            raw("b.md", "Same"),
        ]);
        assert_eq!(collection.find_source("b.md"), Some(SegmentKey::Other(1)));
        assert_eq!(collection.find_source("index.md"), Some(SegmentKey::Entry));
        assert_eq!(collection.find_source("c.md"), None);
    }

    #[test]
    fn raw_segment_uses_filename_on_the_wire() {
        let value: RawSegment =
            serde_json::from_str(r#"{"filename":"index.md","content":"x"}"#).unwrap();
        assert_eq!(value.identity, "index.md");
    }
}
