use adventure_web::session::SessionStore;
use adventure_web::{
    Choice, Navigator, RawSegment, Resolution, SegmentCollection, format, parse, resolve,
    resolve_key,
};
use tempfile::TempDir;

fn forest_story() -> Vec<RawSegment> {
    vec![
        RawSegment::new(
            "index.md",
            "---\ntitle: \"The Beginning\"\n---\nYou wake at the edge of a wood.\n\n## Choices\n\n* [Follow the forest path](/stories/forest-path)\n* [Enter the cave](/stories/a-dark-cave)\n* [Look around](/stories/index)\n",
        ),
        RawSegment::new(
            "forest.md",
            "---\ntitle: The Forest\n---\n![Trees](/images/forest.png)\n\nBirdsong.\n\n## Choices\n\n* [Go deeper](/stories/deep-forest)\n* [Turn back](/stories/index)\n",
        ),
        RawSegment::new(
            "deep-forest.md",
            "---\ntitle: Deep in the Forest\n---\nIt is dark here.\n",
        ),
        RawSegment::new("cave.md", "---\ntitle: A Dark Cave\n---\nWater drips.\n"),
    ]
}

#[test]
fn titles_come_from_front_matter_or_default() {
    assert_eq!(parse("---\ntitle: Harbor\n---\nBoats.").title, "Harbor");
    assert_eq!(parse("---\nlayout: story\n---\nBoats.").title, "Untitled");
    assert_eq!(parse("No front matter at all.").title, "Untitled");
}

#[test]
fn every_choice_item_is_kept_even_when_malformed() {
    let segment = parse(
        "Body.\n\n## Choices\n\n* [North](/stories/north)\n* just some words\n- [South](/stories/south)\n",
    );
    let pairs: Vec<_> = segment
        .choices
        .iter()
        .map(|c| (c.label.as_str(), c.target.as_str()))
        .collect();
    assert_eq!(
        pairs,
        [("North", "/stories/north"), ("Unknown", "#"), ("South", "/stories/south")]
    );
}

#[test]
fn parse_accepts_any_input() {
    let garbage = String::from_utf8_lossy(&[0xff, 0x00, 0xfe, b'#', b'[', 0x80]).into_owned();
    let inputs = [
        String::new(),
        garbage,
        "---".to_string(),
        "---\n---".to_string(),
        "## Choices".to_string(),
        "![".to_string(),
        "* [unclosed(".to_string(),
        "\r\n\r\n## Choices\r\n* [a](b)\r\n".to_string(),
    ];
    for input in &inputs {
        let segment = parse(input);
        assert!(!segment.title.is_empty(), "{input:?}");
    }
}

#[test]
fn parsed_body_has_no_structural_markup_left() {
    let segment = parse(
        "---\ntitle: Ruins\n---\n![Stones](/images/ruins.png)\n\nOld stones.\n\n## Choices\n\n* [Leave](/stories/index)\n",
    );
    assert!(!segment.body.contains("---"));
    assert!(!segment.body.contains("!["));
    assert!(!segment.body.contains("## Choices"));
    assert_eq!(segment.body, "Old stones.");
    assert_eq!(segment.image.as_deref(), Some("/images/ruins.png"));
}

#[test]
fn index_target_always_opens_entry() {
    let collection = SegmentCollection::build(&forest_story());
    let empty = SegmentCollection::build(&[]);
    for target in ["index", "/stories/index", "start"] {
        let choice = Choice::new("Home", target);
        assert_eq!(resolve(&choice, &collection).title, "The Beginning");
        assert_eq!(resolve(&choice, &empty).title, empty.entry().title);
    }
}

#[test]
fn resolve_is_total() {
    let collection = SegmentCollection::build(&forest_story());
    let empty = SegmentCollection::build(&[]);
    let choices = [
        Choice::new("", ""),
        Choice::new("Unknown", "#"),
        Choice::new("???", "/stories/"),
        Choice::new("a b c", "/stories/zz-yy-xx"),
    ];
    for choice in &choices {
        resolve(choice, &collection);
        resolve(choice, &empty);
    }
}

#[test]
fn exact_identity_beats_fuzzy_scoring() {
    let collection = SegmentCollection::build(&forest_story());
    let (key, resolution) = resolve_key(&Choice::new("Go deeper", "/stories/deep-forest"), &collection);
    assert_eq!(resolution, Resolution::Exact);
    assert_eq!(collection.get(key).map(|s| s.title.as_str()), Some("Deep in the Forest"));
}

#[test]
fn partial_match_picks_related_title() {
    let collection = SegmentCollection::build(&forest_story());
    let choice = Choice::new("Follow the forest path", "/stories/forest-path");
    let (_, resolution) = resolve_key(&choice, &collection);
    assert!(matches!(resolution, Resolution::Fuzzy { .. }));
    assert_eq!(resolve(&choice, &collection).title, "The Forest");
}

#[test]
fn empty_target_is_decided_by_the_label() {
    let collection = SegmentCollection::build(&forest_story());
    let choice = Choice::new("A Dark Cave", "/stories/");
    assert_eq!(resolve(&choice, &collection).title, "A Dark Cave");
}

#[test]
fn emphasised_story_links_stay_interceptable() {
    let html = format("Go [**north**](/stories/north) or see ![a *misty* hill](/images/hill.png)");
    assert!(html.contains(r#"class="text-blue-600 hover:underline story-link"><strong>north</strong></a>"#));
    assert!(html.contains(r#"<img src="/images/hill.png" alt="a misty hill""#));
}

#[test]
fn back_and_restart_keep_entry_at_the_root() {
    let mut navigator = Navigator::new();
    navigator.load(&forest_story());
    navigator.back();
    assert_eq!(navigator.depth(), 1);

    navigator.select_index(0);
    navigator.select_index(0);
    navigator.select(&Choice::new("Turn back", "/stories/index"));
    assert_eq!(navigator.depth(), 4);

    navigator.restart();
    let titles: Vec<_> = navigator.history().map(|s| s.title.clone()).collect();
    assert_eq!(titles, ["The Beginning"]);
}

#[test]
fn formatter_survives_pathological_markup() {
    let long = "[x](".repeat(500);
    let inputs = [
        "[[[[[[(((((",
        "**unbalanced *markers",
        "![](",
        "[a](/stories/[b](c))",
        "# \n## \n### ",
        long.as_str(),
    ];
    for input in inputs {
        let html = format(input);
        assert!(!html.contains("<script"));
    }
}

#[test]
fn session_directory_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path());
    let session = store.create().unwrap();
    for raw in forest_story() {
        std::fs::write(session.output_dir().join(&raw.identity), &raw.content).unwrap();
    }

    let reopened = store.open(session.id()).unwrap();
    let mut navigator = Navigator::new();
    navigator.load_collection(reopened.load_collection());
    assert_eq!(navigator.collection().map(|c| c.segment_count()), Some(4));

    navigator.select_index(1);
    assert_eq!(navigator.current().map(|s| s.title.as_str()), Some("A Dark Cave"));
    assert_eq!(navigator.current_path().as_deref(), Some("a-dark-cave"));
}
