use adventure_web::{Choice, RawSegment, SegmentCollection, format, parse, resolve};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

const PLACES: &[&str] = &[
    "forest", "cave", "river", "castle", "village", "tower", "swamp", "harbor", "desert", "ruins",
];

fn segment_markdown(place: &str, next: &str) -> String {
    format!(
        "---\ntitle: The {place} path\n---\n![{place}](/images/{place}.png)\n\n# Arrival\n\nYou reach the **{place}**. It is *quiet* here, and the [old road](/stories/{next}) continues.\n\n- a lantern\n- a rope\n\n## Choices\n\n* [Go to the {next}](/stories/{next}-path)\n* [Head home](/stories/index)\n"
    )
}

fn story(copies: usize) -> Vec<RawSegment> {
    let mut raw = vec![RawSegment::new(
        "index.md",
        "---\ntitle: Crossroads\n---\nWhere to?\n\n## Choices\n\n* [Forest](/stories/forest)\n",
    )];
    for copy in 0..copies {
        for (idx, place) in PLACES.iter().enumerate() {
            let next = PLACES[(idx + 1) % PLACES.len()];
            raw.push(RawSegment::new(
                format!("{place}-{copy}.md"),
                segment_markdown(place, next),
            ));
        }
    }
    raw
}

fn bench_parse(c: &mut Criterion) {
    let markdown = segment_markdown("forest", "cave");
    c.bench_function("parse::segment", |b| {
        b.iter(|| black_box(parse(black_box(&markdown))));
    });
}

fn bench_format(c: &mut Criterion) {
    let body = parse(&segment_markdown("forest", "cave")).body;
    c.bench_function("format::body", |b| {
        b.iter(|| black_box(format(black_box(&body))));
    });
}

fn bench_build(c: &mut Criterion) {
    let raw = story(10);
    c.bench_function("collection::build_100", |b| {
        b.iter(|| black_box(SegmentCollection::build(black_box(&raw))));
    });
}

fn bench_resolve(c: &mut Criterion) {
    const CASES: &[(&str, &str, &str)] = &[
        ("exact", "Forest", "/stories/forest-0"),
        ("fuzzy", "Go to the cave", "/stories/cave-path"),
        ("fallback", "Nowhere", "/stories/zzz"),
    ];
    for &copies in &[1usize, 10] {
        let collection = SegmentCollection::build(&story(copies));
        for &(name, label, target) in CASES {
            let choice = Choice::new(label, target);
            c.bench_with_input(
                BenchmarkId::new(format!("resolve::{name}"), collection.segment_count()),
                &choice,
                |b, choice| {
                    b.iter(|| black_box(resolve(black_box(choice), &collection).title.len()));
                },
            );
        }
    }
}

criterion_group!(benches, bench_parse, bench_format, bench_build, bench_resolve);
criterion_main!(benches);
