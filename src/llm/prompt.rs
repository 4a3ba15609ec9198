//! Prompt assembly from a positional template and a list of sub-queries.
//!
//! Templates use composite-format placeholders: `{0}`, `{1}`, … are replaced
//! by the sub-query at that position, and `{{` / `}}` produce literal braces.
//!
//! ```
//! use promptgate::llm::prompt::{assemble, PromptTemplate};
//!
//! let template: PromptTemplate = "Write an ad for {0} aimed at {1}.".parse().unwrap();
//! let queries = vec!["coffee".to_owned(), "students".to_owned()];
//! assert_eq!(
//!     assemble(Some(&template), &queries).unwrap(),
//!     "Write an ad for coffee aimed at students."
//! );
//! assert_eq!(assemble(None, &queries).unwrap(), "coffee, students");
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::error::RelayError;

/// Separator used when no template is configured.
pub const QUERY_SEPARATOR: &str = ", ";

/// A template string that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unterminated placeholder starting at byte {position}")]
    Unterminated { position: usize },

    #[error("placeholder at byte {position} is not a non-negative index: {{{content}}}")]
    InvalidPlaceholder { position: usize, content: String },

    #[error("unmatched '}}' at byte {position}; write '}}}}' for a literal brace")]
    UnmatchedClose { position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Slot(usize),
}

/// A parsed, validated prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    source: String,
    segments: Vec<Segment>,
    slots: usize,
}

impl PromptTemplate {
    /// Number of sub-queries the template expects: one past the highest index used.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// The template as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn render(&self, queries: &[String]) -> String {
        let capacity = self.source.len() + queries.iter().map(String::len).sum::<usize>();
        let mut out = String::with_capacity(capacity);
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Slot(index) => out.push_str(&queries[*index]),
            }
        }
        out
    }
}

impl FromStr for PromptTemplate {
    type Err = TemplateError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut slots = 0;
        let mut chars = source.char_indices().peekable();

        while let Some((position, c)) = chars.next() {
            match c {
                '{' if chars.peek().map(|&(_, next)| next) == Some('{') => {
                    chars.next();
                    text.push('{');
                }
                '}' if chars.peek().map(|&(_, next)| next) == Some('}') => {
                    chars.next();
                    text.push('}');
                }
                '}' => return Err(TemplateError::UnmatchedClose { position }),
                '{' => {
                    let mut content = String::new();
                    let mut closed = false;
                    for (_, inner) in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        content.push(inner);
                    }
                    if !closed {
                        return Err(TemplateError::Unterminated { position });
                    }
                    let index: usize = content
                        .trim()
                        .parse()
                        .map_err(|_| TemplateError::InvalidPlaceholder {
                            position,
                            content: content.clone(),
                        })?;
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Slot(index));
                    slots = slots.max(index + 1);
                }
                other => text.push(other),
            }
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Self {
            source: source.to_owned(),
            segments,
            slots,
        })
    }
}

impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Builds the prompt for `queries`.
///
/// With a template, the number of queries must equal [`PromptTemplate::slots`].
/// Without one, the queries are joined with [`QUERY_SEPARATOR`] in order.
///
/// # Errors
///
/// [`RelayError::TemplateMismatch`] when the counts differ.
pub fn assemble(template: Option<&PromptTemplate>, queries: &[String]) -> Result<String, RelayError> {
    match template {
        None => Ok(queries.join(QUERY_SEPARATOR)),
        Some(template) if template.slots() != queries.len() => Err(RelayError::TemplateMismatch {
            expected: template.slots(),
            supplied: queries.len(),
        }),
        Some(template) => Ok(template.render(queries)),
    }
}

/// Rejects an assembled prompt longer than `max` characters.
///
/// # Errors
///
/// [`RelayError::PromptTooLong`] carrying the observed and maximum lengths.
pub fn check_length(prompt: &str, max: Option<usize>) -> Result<(), RelayError> {
    let Some(max) = max else {
        return Ok(());
    };
    let length = prompt.chars().count();
    if length > max {
        return Err(RelayError::PromptTooLong { length, max });
    }
    Ok(())
}
