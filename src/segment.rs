use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const DEFAULT_TITLE: &str = "Untitled";
const UNKNOWN_LABEL: &str = "Unknown";
const UNKNOWN_TARGET: &str = "#";

static FRONT_MATTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\A---\n((?s:.*?))\n---(?:\n|\z)").expect("front matter pattern"));
static TITLE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"title:\s*(.*)").expect("title pattern"));
static IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[(.*?)\]\((.*?)\)").expect("image pattern"));
static CHOICES_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^##[ \t]+Choices[ \t]*$").expect("choices heading pattern"));
static CHOICE_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(.*?)\]\((.*?)\)").expect("choice item pattern"));

/// A labelled link out of a segment, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub label: String,
    pub target: String,
}

impl Choice {
    pub fn new(label: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            target: target.into(),
        }
    }

    fn unknown() -> Self {
        Self::new(UNKNOWN_LABEL, UNKNOWN_TARGET)
    }

    /// The navigable reference: everything after the last `/` of the target.
    pub fn target_ref(&self) -> &str {
        self.target.rsplit('/').next().unwrap_or_default()
    }
}

/// One parsed story segment. `source` is the file it came from and is the
/// segment's identity inside a collection; titles may repeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub source: String,
    pub title: String,
    pub body: String,
    pub choices: Vec<Choice>,
    pub image: Option<String>,
}

impl Segment {
    pub(crate) fn placeholder(source: &str, title: &str, body: &str) -> Self {
        Self {
            source: source.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            choices: Vec::new(),
            image: None,
        }
    }
}

/// Parses a markdown segment document. Never fails: anything missing falls
/// back to a default (`Untitled`, no image, no choices).
pub fn parse(raw: &str) -> Segment {
    parse_source("", raw)
}

/// Same as [`parse`], stamping `source` as the segment identity.
pub fn parse_source(source: &str, raw: &str) -> Segment {
    let text = raw.replace("\r\n", "\n");

    let (title, mut body) = match FRONT_MATTER.captures(&text) {
        Some(caps) => {
            let title = caps
                .get(1)
                .and_then(|front| extract_title(front.as_str()))
                .unwrap_or_else(|| DEFAULT_TITLE.to_string());
            let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
            (title, text[end..].to_string())
        }
        None => (DEFAULT_TITLE.to_string(), text.clone()),
    };

    let image = IMAGE.captures(&body).and_then(|caps| {
        let whole = caps.get(0)?;
        let path = caps.get(2)?.as_str().to_string();
        Some((whole.range(), path))
    });
    let image = image.map(|(range, path)| {
        body.replace_range(range, "");
        path
    });

    let choices = match take_choices_section(&body) {
        Some((range, section)) => {
            let choices = parse_choice_items(&section);
            body.replace_range(range, "");
            choices
        }
        None => Vec::new(),
    };

    Segment {
        source: source.to_string(),
        title,
        body: body.trim().to_string(),
        choices,
        image,
    }
}

fn extract_title(front_matter: &str) -> Option<String> {
    let caps = TITLE_KEY.captures(front_matter)?;
    let value = unquote(caps.get(1)?.as_str().trim());
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Finds the last `## Choices` heading. Returns the byte range to cut from
/// the body (heading through terminator) and the section text.
fn take_choices_section(body: &str) -> Option<(std::ops::Range<usize>, String)> {
    let heading = CHOICES_HEADING.find_iter(body).last()?;
    let rest = &body[heading.end()..];
    let (section, consumed) = match rest.find("\n\n---") {
        Some(idx) => (&rest[..idx], idx + "\n\n---".len()),
        None => (rest, rest.len()),
    };
    Some((
        heading.start()..heading.end() + consumed,
        section.to_string(),
    ))
}

fn parse_choice_items(section: &str) -> Vec<Choice> {
    section
        .lines()
        .map(str::trim_start)
        .filter_map(|line| {
            line.strip_prefix("* ")
                .or_else(|| line.strip_prefix("- "))
                .map(str::trim)
        })
        .map(|item| match CHOICE_ITEM.captures(item) {
            Some(caps) => Choice::new(
                caps.get(1).map(|m| m.as_str()).unwrap_or_default(),
                caps.get(2).map(|m| m.as_str()).unwrap_or_default(),
            ),
            None => Choice::unknown(),
        })
        .collect()
}
