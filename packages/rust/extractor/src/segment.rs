//! L0 segmentation: split a document into anchorable units.
//!
//! A Markdown-style heading opens a new section; blank lines separate
//! paragraphs. Headings are not units themselves but are carried on every
//! paragraph beneath them.

use std::sync::LazyLock;

use regex::Regex;

use knowledgeforge_shared::{Anchor, AnchorId, SourceId};

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s{0,3}#{1,6}\s+(.+?)\s*#*\s*$").expect("valid regex"));

struct Cursor<'a> {
    source: &'a SourceId,
    section: u32,
    paragraph: u32,
    heading: Option<String>,
    lines: Vec<&'a str>,
    out: Vec<Anchor>,
}

impl Cursor<'_> {
    fn flush(&mut self) {
        if self.lines.is_empty() {
            return;
        }
        let text = self
            .lines
            .drain(..)
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("\n");
        self.paragraph += 1;
        self.out.push(Anchor {
            id: AnchorId::new(self.source, self.section, self.paragraph),
            section: self.section,
            paragraph: self.paragraph,
            heading: self.heading.clone(),
            text,
        });
    }

    fn open_section(&mut self, heading: &str) {
        self.flush();
        if self.paragraph > 0 {
            self.section += 1;
            self.paragraph = 0;
        }
        self.heading = Some(heading.to_string());
    }
}

/// Segment `content` into L0 anchors, in document order.
pub fn segment(source: &SourceId, content: &str) -> Vec<Anchor> {
    let mut cursor = Cursor {
        source,
        section: 1,
        paragraph: 0,
        heading: None,
        lines: Vec::new(),
        out: Vec::new(),
    };

    for line in content.lines() {
        if line.trim().is_empty() {
            cursor.flush();
        } else if let Some(caps) = HEADING_RE.captures(line) {
            cursor.open_section(caps[1].trim());
        } else {
            cursor.lines.push(line);
        }
    }
    cursor.flush();
    cursor.out
}

/// Text sent to the reasoning service for one anchor.
pub(crate) fn unit_context(anchor: &Anchor) -> String {
    match &anchor.heading {
        Some(heading) => format!("{heading}\n\n{}", anchor.text),
        None => anchor.text.clone(),
    }
}
