//! Markdown section splitting for section assembly.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// ATX heading: 1-6 hashes, a title, optional closing hashes.
static HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(#{1,6})[ \t]+(.+?)[ \t#]*$").expect("Invalid regex for markdown headings")
});

/// One heading and the text under it, up to the next heading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Heading line as written; `None` for text before the first heading.
    pub heading: Option<String>,
    /// Normalized heading used for matching across documents.
    pub key: Option<String>,
    pub body: String,
}

impl Section {
    fn render(&self) -> String {
        match &self.heading {
            Some(heading) if self.body.trim().is_empty() => heading.clone(),
            Some(heading) => format!("{}\n{}", heading, self.body.trim_end()),
            None => self.body.trim_end().to_string(),
        }
    }
}

fn normalize(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(':')
        .to_lowercase()
}

/// Splits markdown into sections at ATX headings, ignoring fenced code blocks.
pub fn split_sections(content: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current = Section {
        heading: None,
        key: None,
        body: String::new(),
    };
    let mut in_fence = false;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }

        let heading = if in_fence {
            None
        } else {
            HEADING.captures(line)
        };

        match heading {
            Some(caps) => {
                if current.heading.is_some() || !current.body.trim().is_empty() {
                    sections.push(current);
                }
                current = Section {
                    heading: Some(line.trim_end().to_string()),
                    key: Some(normalize(&caps[2])),
                    body: String::new(),
                };
            }
            None => {
                current.body.push_str(line);
                current.body.push('\n');
            }
        }
    }

    if current.heading.is_some() || !current.body.trim().is_empty() {
        sections.push(current);
    }
    sections
}

/// Keeps every section of `primary` and appends sections from `others`
/// whose heading has not appeared yet, in rank order.
pub fn assemble(primary: &str, others: &[&str]) -> String {
    let mut assembled = split_sections(primary);
    let mut seen: HashSet<String> = assembled.iter().filter_map(|s| s.key.clone()).collect();

    for other in others {
        for section in split_sections(other) {
            let Some(key) = section.key.clone() else {
                continue;
            };
            if section.body.trim().is_empty() {
                continue;
            }
            if seen.insert(key) {
                assembled.push(section);
            }
        }
    }

    assembled
        .iter()
        .map(Section::render)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
