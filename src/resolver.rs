//! Maps a clicked [`Choice`] to the segment it should open.
//!
//! Resolution runs in three passes: the `index`/`start` shortcut, an exact
//! match on source identity, then fuzzy scoring of titles against the
//! target reference and the choice label. It always yields a segment; when
//! nothing scores, the entry segment is returned.

use crate::collection::{SegmentCollection, SegmentKey};
use crate::segment::{Choice, Segment};
use serde::Serialize;
use tracing::{debug, warn};

const ENTRY_REFS: [&str; 2] = ["index", "start"];

/// How a target was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Shortcut,
    Exact,
    Fuzzy { score: u32 },
    Fallback,
}

/// Everything a fuzzy rule may look at for one candidate segment.
pub struct Candidate<'a> {
    pub target_ref: &'a str,
    pub label: &'a str,
    pub title: &'a str,
    pub slug: &'a str,
    pub target_tokens: &'a [&'a str],
    pub title_words: &'a [&'a str],
}

/// One weighted fuzzy heuristic. Rules are evaluated independently and
/// their scores summed.
pub struct ScoreRule {
    pub name: &'static str,
    pub score: fn(&Candidate<'_>) -> u32,
}

pub const SCORE_RULES: [ScoreRule; 6] = [
    ScoreRule {
        name: "slug_equals_target",
        score: slug_equals_target,
    },
    ScoreRule {
        name: "title_equals_label",
        score: title_equals_label,
    },
    ScoreRule {
        name: "all_target_tokens_in_title",
        score: all_target_tokens_in_title,
    },
    ScoreRule {
        name: "target_token_matches",
        score: target_token_matches,
    },
    ScoreRule {
        name: "title_word_matches",
        score: title_word_matches,
    },
    ScoreRule {
        name: "slug_overlaps_target",
        score: slug_overlaps_target,
    },
];

/// Per-rule score breakdown for one candidate.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreCard {
    pub key_index: usize,
    pub title: String,
    pub rules: Vec<(&'static str, u32)>,
    pub total: u32,
}

/// Lower-case, whitespace runs collapsed to single hyphens.
pub fn slug(title: &str) -> String {
    title
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

fn overlaps(a: &str, b: &str) -> bool {
    a.contains(b) || b.contains(a)
}

fn slug_equals_target(c: &Candidate<'_>) -> u32 {
    if c.slug == c.target_ref { 100 } else { 0 }
}

fn title_equals_label(c: &Candidate<'_>) -> u32 {
    if c.title == c.label { 90 } else { 0 }
}

fn all_target_tokens_in_title(c: &Candidate<'_>) -> u32 {
    let all = c
        .target_tokens
        .iter()
        .all(|token| c.title_words.iter().any(|word| overlaps(word, token)));
    if all { 80 } else { 0 }
}

fn target_token_matches(c: &Candidate<'_>) -> u32 {
    let hits = c
        .target_tokens
        .iter()
        .filter(|token| c.title_words.iter().any(|word| overlaps(word, token)))
        .count();
    hits as u32 * 10
}

fn title_word_matches(c: &Candidate<'_>) -> u32 {
    let hits = c
        .title_words
        .iter()
        .filter(|word| word.chars().count() > 2)
        .filter(|word| c.target_tokens.iter().any(|token| overlaps(token, word)))
        .count();
    hits as u32 * 15
}

fn slug_overlaps_target(c: &Candidate<'_>) -> u32 {
    if overlaps(c.slug, c.target_ref) { 60 } else { 0 }
}

/// Scores every non-entry segment against a target reference and label.
/// Inputs are compared case-insensitively.
pub fn score_candidates(target_ref: &str, label: &str, collection: &SegmentCollection) -> Vec<ScoreCard> {
    let target_ref = target_ref.to_lowercase();
    let label = label.to_lowercase();
    let target_tokens: Vec<&str> = target_ref.split('-').collect();
    collection
        .others()
        .iter()
        .enumerate()
        .map(|(key_index, segment)| {
            let title = segment.title.to_lowercase();
            let slug = slug(&segment.title);
            let title_words: Vec<&str> = title.split_whitespace().collect();
            let candidate = Candidate {
                target_ref: &target_ref,
                label: &label,
                title: &title,
                slug: &slug,
                target_tokens: &target_tokens,
                title_words: &title_words,
            };
            let rules: Vec<_> = SCORE_RULES
                .iter()
                .map(|rule| (rule.name, (rule.score)(&candidate)))
                .collect();
            let total = rules.iter().map(|(_, score)| score).sum();
            ScoreCard {
                key_index,
                title: segment.title.clone(),
                rules,
                total,
            }
        })
        .collect()
}

/// Resolves a choice to a segment key and says how it got there.
pub fn resolve_key(choice: &Choice, collection: &SegmentCollection) -> (SegmentKey, Resolution) {
    let target_ref = choice.target_ref();

    if ENTRY_REFS.contains(&target_ref) {
        return (SegmentKey::Entry, Resolution::Shortcut);
    }

    let with_extension = format!("{target_ref}.md");
    if let Some(key) = collection
        .find_source(target_ref)
        .or_else(|| collection.find_source(&with_extension))
    {
        return (key, Resolution::Exact);
    }

    let mut best: Option<(usize, u32)> = None;
    for card in score_candidates(target_ref, &choice.label, collection) {
        debug!(title = %card.title, score = card.total, "scored candidate segment");
        if best.is_none_or(|(_, score)| card.total > score) {
            best = Some((card.key_index, card.total));
        }
    }

    match best {
        Some((idx, score)) if score > 0 => (SegmentKey::Other(idx), Resolution::Fuzzy { score }),
        _ => {
            warn!(target = %choice.target, label = %choice.label, "could not resolve choice, returning to entry");
            (SegmentKey::Entry, Resolution::Fallback)
        }
    }
}

/// Resolves a choice to the segment it should open. Never fails.
pub fn resolve<'a>(choice: &Choice, collection: &'a SegmentCollection) -> &'a Segment {
    let (key, _) = resolve_key(choice, collection);
    collection.get(key).unwrap_or_else(|| collection.entry())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::RawSegment;

    fn story(segments: &[(&str, &str)]) -> SegmentCollection {
        let raw: Vec<_> = segments
            .iter()
            .map(|(identity, title)| RawSegment::new(*identity, format!("---\ntitle: {title}\n---\nBody")))
            .collect();
        SegmentCollection::build(&raw)
    }

    #[test]
    fn slug_lowercases_and_hyphenates() {
        assert_eq!(slug("Deep in  the\tForest"), "deep-in-the-forest");
        assert_eq!(slug(""), "");
    }

    #[test]
    fn index_and_start_always_return_entry() {
        let collection = story(&[("index.md", "Begin"), ("start.md", "Start File")]);
        for target in ["/stories/index", "/stories/start", "index", "start"] {
            let (key, how) = resolve_key(&Choice::new("x", target), &collection);
            assert_eq!(key, SegmentKey::Entry);
            assert_eq!(how, Resolution::Shortcut);
        }
        let empty = SegmentCollection::build(&[]);
        assert_eq!(resolve(&Choice::new("x", "index"), &empty).title, "Adventure Index");
    }

    #[test]
    fn exact_identity_beats_fuzzy_titles() {
        let collection = story(&[
            ("index.md", "Begin"),
            ("forest.md", "The Forest"),
            ("deep-forest.md", "Deep in the Forest"),
        ]);
        let (key, how) = resolve_key(&Choice::new("Go", "/stories/deep-forest"), &collection);
        assert_eq!(how, Resolution::Exact);
        assert_eq!(collection.get(key).map(|s| s.title.as_str()), Some("Deep in the Forest"));

        let (_, how) = resolve_key(&Choice::new("Go", "/stories/forest.md"), &collection);
        assert_eq!(how, Resolution::Exact);
    }

    #[test]
    fn partial_title_match_wins_fuzzy_pass() {
        let collection = story(&[
            ("index.md", "Begin"),
            ("cave.md", "A Dark Cave"),
            ("forest.md", "The Forest"),
            ("river.md", "River Crossing"),
        ]);
        let segment = resolve(&Choice::new("Walk on", "/stories/forest-path"), &collection);
        assert_eq!(segment.title, "The Forest");
    }

    #[test]
    fn label_match_contributes_score() {
        let collection = story(&[("a.md", "Unrelated"), ("b.md", "Climb The Tower")]);
        let (key, how) = resolve_key(&Choice::new("climb the tower", "/stories/zzz"), &collection);
        assert_eq!(key, SegmentKey::Other(1));
        assert_eq!(how, Resolution::Fuzzy { score: 90 });
    }

    #[test]
    fn score_breakdown_sums_independent_rules() {
        let collection = story(&[("x.md", "Deep Forest")]);
        let cards = score_candidates("deep-forest", "Deep Forest", &collection);
        let card = &cards[0];
        let by_name: std::collections::HashMap<_, _> = card.rules.iter().cloned().collect();
        assert_eq!(by_name["slug_equals_target"], 100);
        assert_eq!(by_name["title_equals_label"], 90);
        assert_eq!(by_name["all_target_tokens_in_title"], 80);
        assert_eq!(by_name["target_token_matches"], 20);
        assert_eq!(by_name["title_word_matches"], 30);
        assert_eq!(by_name["slug_overlaps_target"], 60);
        assert_eq!(card.total, 380);
    }

    #[test]
    fn ties_go_to_first_in_collection_order() {
        let collection = story(&[("one.md", "The Bridge"), ("two.md", "The Bridge")]);
        let (key, _) = resolve_key(&Choice::new("?", "/stories/bridge"), &collection);
        assert_eq!(key, SegmentKey::Other(0));
    }

    #[test]
    fn nothing_matching_falls_back_to_entry() {
        let collection = story(&[("index.md", "Begin"), ("cave.md", "Cave")]);
        let (key, how) = resolve_key(&Choice::new("Fly", "/stories/zzz"), &collection);
        assert_eq!((key, how), (SegmentKey::Entry, Resolution::Fallback));

        let empty = SegmentCollection::build(&[]);
        assert_eq!(resolve(&Choice::new("Fly", "/stories/anything"), &empty).title, "Adventure Index");
        assert_eq!(resolve(&Choice::new("", ""), &empty).title, "Adventure Index");
    }

    #[test]
    fn empty_target_is_still_scored() {
        let collection = story(&[("index.md", "Begin"), ("river.md", "River"), ("cave.md", "The Cave")]);
        let (key, how) = resolve_key(&Choice::new("The Cave", "/stories/"), &collection);
        assert_eq!(collection.get(key).map(|s| s.title.as_str()), Some("The Cave"));
        assert!(matches!(how, Resolution::Fuzzy { .. }));

        let cards = score_candidates("", "", &collection);
        assert!(cards.iter().all(|card| card.total > 0));
    }
}
