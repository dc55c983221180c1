use std::sync::Arc;

use crate::collection::{RawSegment, SegmentCollection, SegmentKey};
use crate::resolver::{resolve_key, slug};
use crate::segment::{Choice, Segment};

/// Navigation through one loaded story: the current segment is the top of
/// an explicit history stack whose root is always the entry segment.
/// Clones share the loaded collection.
#[derive(Debug, Clone, Default)]
pub struct Navigator {
    collection: Option<Arc<SegmentCollection>>,
    history: Vec<SegmentKey>,
}

impl Navigator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the collection from raw segments and starts at the entry.
    pub fn load(&mut self, raw: &[RawSegment]) -> &Segment {
        self.load_collection(SegmentCollection::build(raw))
    }

    pub fn load_collection(&mut self, collection: SegmentCollection) -> &Segment {
        self.history = vec![SegmentKey::Entry];
        self.collection.insert(Arc::new(collection)).entry()
    }

    /// Starts at the entry, then jumps straight to `story_path` when it names
    /// a segment file exactly (`path` or `path.md`).
    pub fn open(&mut self, story_path: Option<&str>) -> Option<&Segment> {
        let collection = self.collection.as_deref()?;
        self.history = vec![SegmentKey::Entry];
        if let Some(path) = story_path.filter(|path| !path.is_empty() && *path != "index") {
            let target = collection
                .find_source(path)
                .or_else(|| collection.find_source(&format!("{path}.md")));
            if let Some(key @ SegmentKey::Other(_)) = target {
                self.history.push(key);
            }
        }
        self.current()
    }

    /// Resolves `choice` and pushes the result. No-op without a story.
    pub fn select(&mut self, choice: &Choice) -> Option<&Segment> {
        let collection = self.collection.as_deref()?;
        let (key, _) = resolve_key(choice, collection);
        self.history.push(key);
        self.current()
    }

    /// Selects the `index`-th choice of the current segment.
    pub fn select_index(&mut self, index: usize) -> Option<&Segment> {
        let choice = self.current()?.choices.get(index)?.clone();
        self.select(&choice)
    }

    /// Steps back one segment; the entry is never popped.
    pub fn back(&mut self) -> Option<&Segment> {
        if self.history.len() > 1 {
            self.history.pop();
        }
        self.current()
    }

    pub fn restart(&mut self) -> Option<&Segment> {
        self.collection.as_deref()?;
        self.history = vec![SegmentKey::Entry];
        self.current()
    }

    pub fn is_loaded(&self) -> bool {
        self.collection.is_some()
    }

    pub fn collection(&self) -> Option<&SegmentCollection> {
        self.collection.as_deref()
    }

    pub fn current_key(&self) -> Option<SegmentKey> {
        self.history.last().copied()
    }

    pub fn current(&self) -> Option<&Segment> {
        let collection = self.collection.as_deref()?;
        collection.get(self.current_key()?)
    }

    pub fn history(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.history
            .iter()
            .filter_map(|key| self.collection.as_deref()?.get(*key))
    }

    pub fn depth(&self) -> usize {
        self.history.len()
    }

    pub fn can_go_back(&self) -> bool {
        self.history.len() > 1
    }

    /// URL path for the current segment: the slug of its title, or `None`
    /// at the entry.
    pub fn current_path(&self) -> Option<String> {
        match self.current_key()? {
            SegmentKey::Entry => None,
            SegmentKey::Other(_) => self.current().map(|segment| slug(&segment.title)),
        }
    }
}
