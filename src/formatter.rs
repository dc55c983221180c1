//! Segment body → HTML.
//!
//! The formatter is a fixed pipeline of stages over a small block/inline
//! representation. Inline tokens are either `Text`, which later stages may
//! still rewrite, or `Markup`, which is final output and never re-matched.
//! That is what keeps `**bold**` from being split by the italic rule and
//! rendered anchors from being picked up again by the plain-link rule.
//!
//! A stage still sees the whole line: markup from earlier stages stands in
//! as one opaque character, so `[**north**](/stories/north)` becomes a link
//! whose label keeps its `<strong>`.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

pub const STORY_LINK_CLASS: &str = "story-link";
const LINK_CLASS: &str = "text-blue-600 hover:underline";
const IMAGE_CLASS: &str = "my-4 rounded-lg max-w-full h-auto";
const LIST_CLASS: &str = "list-disc pl-5 my-3";

/// Heading prefixes, most specific first.
const HEADING_RULES: [(&str, u8); 3] = [("###", 3), ("##", 2), ("#", 1)];

static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.*?)\*\*").expect("bold pattern"));
static ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*(.*?)\*").expect("italic pattern"));
static IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[(.*?)\]\((.*?)\)").expect("image pattern"));
static STORY_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(.*?)\]\((/stories/.*?)\)").expect("story link pattern"));
static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(.*?)\]\((.*?)\)").expect("link pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
enum Inline {
    Text(String),
    Markup(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Block {
    Line(Vec<Inline>),
    Heading(u8, Vec<Inline>),
    List(Vec<Vec<Inline>>),
}

struct InlineRule {
    pattern: &'static Lazy<Regex>,
    render: fn(&FlatLine, &Captures<'_>) -> Vec<Inline>,
}

/// Stand-in for one `Markup` token while a stage matches over a line.
const MARKUP_STANDIN: char = '\u{FFFC}';

/// A token run flattened into one string for matching. Spans map byte
/// ranges back to their tokens; `None` marks text.
struct FlatLine {
    text: String,
    spans: Vec<(Range<usize>, Option<String>)>,
}

impl FlatLine {
    fn new(tokens: Vec<Inline>) -> Self {
        let mut text = String::new();
        let mut spans = Vec::with_capacity(tokens.len());
        for token in tokens {
            let start = text.len();
            match token {
                Inline::Text(chunk) => {
                    text.push_str(&chunk);
                    spans.push((start..text.len(), None));
                }
                Inline::Markup(markup) => {
                    text.push(MARKUP_STANDIN);
                    spans.push((start..text.len(), Some(markup)));
                }
            }
        }
        Self { text, spans }
    }

    /// Tokens covering `range`, markup restored and adjacent text merged.
    fn tokens(&self, range: Range<usize>) -> Vec<Inline> {
        let mut out: Vec<Inline> = Vec::new();
        for (span, markup) in &self.spans {
            let start = span.start.max(range.start);
            let end = span.end.min(range.end);
            if start >= end {
                continue;
            }
            let Some(markup) = markup else {
                let chunk = &self.text[start..end];
                if let Some(Inline::Text(prev)) = out.last_mut() {
                    prev.push_str(chunk);
                } else {
                    out.push(Inline::Text(chunk.to_string()));
                }
                continue;
            };
            out.push(Inline::Markup(markup.clone()));
        }
        out
    }

    /// Text inside `range` with markup dropped, for attribute values.
    fn plain(&self, range: Range<usize>) -> String {
        self.tokens(range)
            .into_iter()
            .filter_map(|token| match token {
                Inline::Text(text) => Some(text),
                Inline::Markup(_) => None,
            })
            .collect()
    }
}

/// Inline stages in application order.
static INLINE_RULES: [InlineRule; 5] = [
    InlineRule {
        pattern: &BOLD,
        render: render_bold,
    },
    InlineRule {
        pattern: &ITALIC,
        render: render_italic,
    },
    InlineRule {
        pattern: &IMAGE,
        render: render_image,
    },
    InlineRule {
        pattern: &STORY_LINK,
        render: render_story_link,
    },
    InlineRule {
        pattern: &LINK,
        render: render_link,
    },
];

/// Renders a segment body as HTML. Image paths are left untouched.
pub fn format(body: &str) -> String {
    let mut blocks = split_lines(body);
    headings(&mut blocks);
    for rule in &INLINE_RULES {
        apply_inline_rule(&mut blocks, rule);
    }
    let blocks = group_lists(blocks);
    paragraph_breaks(&render(&blocks))
}

fn split_lines(body: &str) -> Vec<Block> {
    body.split('\n')
        .map(|line| Block::Line(text_tokens(line)))
        .collect()
}

fn text_tokens(text: &str) -> Vec<Inline> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![Inline::Text(text.to_string())]
    }
}

fn headings(blocks: &mut [Block]) {
    for block in blocks.iter_mut() {
        let heading = match block {
            Block::Line(tokens) => match tokens.as_slice() {
                [Inline::Text(line)] => {
                    heading_level(line).map(|(level, content)| (level, content.to_string()))
                }
                _ => None,
            },
            _ => None,
        };
        if let Some((level, content)) = heading {
            *block = Block::Heading(level, text_tokens(&content));
        }
    }
}

fn heading_level(line: &str) -> Option<(u8, &str)> {
    HEADING_RULES.iter().find_map(|(prefix, level)| {
        let rest = line.strip_prefix(*prefix)?;
        if rest.starts_with(char::is_whitespace) {
            Some((*level, rest.trim_start()))
        } else {
            None
        }
    })
}

fn apply_inline_rule(blocks: &mut [Block], rule: &InlineRule) {
    for block in blocks.iter_mut() {
        match block {
            Block::Line(tokens) | Block::Heading(_, tokens) => rewrite_tokens(tokens, rule),
            Block::List(items) => items
                .iter_mut()
                .for_each(|tokens| rewrite_tokens(tokens, rule)),
        }
    }
}

fn rewrite_tokens(tokens: &mut Vec<Inline>, rule: &InlineRule) {
    if !tokens.iter().any(|token| matches!(token, Inline::Text(_))) {
        return;
    }
    let line = FlatLine::new(std::mem::take(tokens));
    let mut last = 0;
    for caps in rule.pattern.captures_iter(&line.text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        tokens.extend(line.tokens(last..whole.start()));
        tokens.extend((rule.render)(&line, &caps));
        last = whole.end();
    }
    tokens.extend(line.tokens(last..line.text.len()));
}

fn group(caps: &Captures<'_>, idx: usize) -> Range<usize> {
    caps.get(idx).map(|m| m.range()).unwrap_or(0..0)
}

fn wrap(open: &str, inner: Vec<Inline>, close: &str) -> Vec<Inline> {
    let mut tokens = vec![Inline::Markup(open.to_string())];
    tokens.extend(inner);
    tokens.push(Inline::Markup(close.to_string()));
    tokens
}

fn render_bold(line: &FlatLine, caps: &Captures<'_>) -> Vec<Inline> {
    wrap("<strong>", line.tokens(group(caps, 1)), "</strong>")
}

fn render_italic(line: &FlatLine, caps: &Captures<'_>) -> Vec<Inline> {
    wrap("<em>", line.tokens(group(caps, 1)), "</em>")
}

fn render_image(line: &FlatLine, caps: &Captures<'_>) -> Vec<Inline> {
    vec![Inline::Markup(format!(
        r#"<img src="{src}" alt="{alt}" class="{IMAGE_CLASS}" />"#,
        src = escape_html(&line.plain(group(caps, 2))),
        alt = escape_html(&line.plain(group(caps, 1))),
    ))]
}

fn render_story_link(line: &FlatLine, caps: &Captures<'_>) -> Vec<Inline> {
    let open = format!(
        r#"<a href="{href}" class="{LINK_CLASS} {STORY_LINK_CLASS}">"#,
        href = escape_html(&line.plain(group(caps, 2))),
    );
    wrap(&open, line.tokens(group(caps, 1)), "</a>")
}

fn render_link(line: &FlatLine, caps: &Captures<'_>) -> Vec<Inline> {
    let open = format!(
        r#"<a href="{href}" class="{LINK_CLASS}">"#,
        href = escape_html(&line.plain(group(caps, 2))),
    );
    wrap(&open, line.tokens(group(caps, 1)), "</a>")
}

fn list_item(block: &Block) -> Option<Vec<Inline>> {
    let Block::Line(tokens) = block else {
        return None;
    };
    let (Inline::Text(first), rest) = tokens.split_first()? else {
        return None;
    };
    let stripped = first.strip_prefix("- ")?;
    let mut item = text_tokens(stripped);
    item.extend(rest.iter().cloned());
    Some(item)
}

fn group_lists(blocks: Vec<Block>) -> Vec<Block> {
    let mut out: Vec<Block> = Vec::with_capacity(blocks.len());
    for block in blocks {
        match list_item(&block) {
            Some(item) => match out.last_mut() {
                Some(Block::List(items)) => items.push(item),
                _ => out.push(Block::List(vec![item])),
            },
            None => out.push(block),
        }
    }
    out
}

fn render(blocks: &[Block]) -> String {
    blocks
        .iter()
        .map(|block| match block {
            Block::Line(tokens) => render_inline(tokens),
            Block::Heading(level, tokens) => {
                format!("<h{level}>{}</h{level}>", render_inline(tokens))
            }
            Block::List(items) => {
                let mut html = format!(r#"<ul class="{LIST_CLASS}">"#);
                for item in items {
                    html.push_str("<li>");
                    html.push_str(&render_inline(item));
                    html.push_str("</li>\n");
                }
                html.push_str("</ul>");
                html
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_inline(tokens: &[Inline]) -> String {
    let mut html = String::new();
    for token in tokens {
        match token {
            Inline::Text(text) => html.push_str(&escape_html(text)),
            Inline::Markup(markup) => html.push_str(markup),
        }
    }
    html
}

fn paragraph_breaks(html: &str) -> String {
    html.replace("\n\n", "<br><br>")
}

pub(crate) fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_use_the_most_specific_rule() {
        assert_eq!(format("# One"), "<h1>One</h1>");
        assert_eq!(format("## Two"), "<h2>Two</h2>");
        assert_eq!(format("### Three"), "<h3>Three</h3>");
        assert_eq!(format("#### Four"), "#### Four");
        assert_eq!(format("#NoSpace"), "#NoSpace");
    }

    #[test]
    fn bold_runs_before_italic() {
        assert_eq!(
            format("**strong** and *soft*"),
            "<strong>strong</strong> and <em>soft</em>"
        );
        assert_eq!(
            format("**a** *b* **c**"),
            "<strong>a</strong> <em>b</em> <strong>c</strong>"
        );
    }

    #[test]
    fn story_links_are_tagged_for_interception() {
        let html = format("Go [into the cave](/stories/cave) or [read more](https://example.com).");
        assert!(html.contains(
            r#"<a href="/stories/cave" class="text-blue-600 hover:underline story-link">into the cave</a>"#
        ));
        assert!(html.contains(
            r#"<a href="https://example.com" class="text-blue-600 hover:underline">read more</a>"#
        ));
    }

    #[test]
    fn images_render_before_links() {
        let html = format("![A cave](/images/cave.png)");
        assert_eq!(
            html,
            r#"<img src="/images/cave.png" alt="A cave" class="my-4 rounded-lg max-w-full h-auto" />"#
        );
    }

    #[test]
    fn emphasis_inside_a_link_label_keeps_the_link() {
        assert_eq!(
            format("Go [**north**](/stories/north) now"),
            r#"Go <a href="/stories/north" class="text-blue-600 hover:underline story-link"><strong>north</strong></a> now"#
        );
        let html = format("[a *quiet* road](https://example.com)");
        assert!(html.contains(
            r#"<a href="https://example.com" class="text-blue-600 hover:underline">a <em>quiet</em> road</a>"#
        ));
    }

    #[test]
    fn emphasis_inside_image_alt_still_renders_the_image() {
        assert_eq!(
            format("![a *misty* hill](/images/hill.png)"),
            r#"<img src="/images/hill.png" alt="a misty hill" class="my-4 rounded-lg max-w-full h-auto" />"#
        );
    }

    #[test]
    fn literal_standin_char_in_text_is_kept_as_text() {
        let html = format("a \u{FFFC} **b**");
        assert_eq!(html, "a \u{FFFC} <strong>b</strong>");
    }

    #[test]
    fn consecutive_list_items_share_one_list() {
        let html = format("Pack:\n- rope\n- **lamp**\n\nDone");
        assert_eq!(html.matches("<ul").count(), 1);
        assert!(html.contains("<li>rope</li>\n<li><strong>lamp</strong></li>"));
        assert!(html.ends_with("</ul><br><br>Done"));
    }

    #[test]
    fn separate_lists_stay_separate() {
        let html = format("- a\nbreak\n- b");
        assert_eq!(html.matches("<ul").count(), 2);
    }

    #[test]
    fn blank_lines_become_breaks() {
        assert_eq!(format("one\n\ntwo"), "one<br><br>two");
        assert_eq!(format("one\ntwo"), "one\ntwo");
    }

    #[test]
    fn text_is_escaped_but_markup_is_not() {
        assert_eq!(
            format("<script>alert('x')</script> **ok**"),
            "&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt; <strong>ok</strong>"
        );
        let html = format(r#"[x](/stories/a"onclick="b)"#);
        assert!(html.contains(r#"href="/stories/a&quot;onclick=&quot;b""#));
    }

    #[test]
    fn pathological_input_terminates() {
        for input in ["[[[[(((", "](", "![](", "**", "*", "[a](b", "- ", "#", "\n\n\n\n"] {
            let _ = format(input);
        }
        let long = "[".repeat(10_000) + &"*".repeat(10_000);
        assert!(!format(&long).is_empty());
    }

    #[test]
    fn image_paths_are_preserved() {
        let html = format("![x](/generated/pic.png)");
        assert!(html.contains(r#"src="/generated/pic.png""#));
    }
}
