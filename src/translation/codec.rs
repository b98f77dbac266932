/*!
 * Batch encoder, tolerant decoder and structural validator.
 *
 * A batch is sent as one compact JSON object on the first line of the prompt,
 * followed by an instruction stating the exact element count and any
 * paragraph context. The response must carry an object with a `lines` array
 * whose element ids are exactly the request's ids.
 */

use log::debug;
use regex::Regex;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

use super::scheduler::{text_size, Batch};
use crate::database::{LineRef, TranslatedLine};

/// Contexts this short carry no useful information
pub const MIN_CONTEXT_CHARS: usize = 5;

/// Length of response previews kept for diagnostics
pub const PREVIEW_CHARS: usize = 500;

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[a-zA-Z]*\s*\n?(.*?)```").expect("fence pattern is valid"));

/// One sentence element, in requests and responses alike
///
/// Ids may also arrive as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineElement {
    #[serde(deserialize_with = "lenient_id")]
    pub para_id: i64,
    #[serde(deserialize_with = "lenient_id")]
    pub line_id: i64,
    pub text: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Number(i64),
    Text(String),
}

fn lenient_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match IdRepr::deserialize(deserializer)? {
        IdRepr::Number(id) => Ok(id),
        IdRepr::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid id: {:?}", text))),
    }
}

impl LineElement {
    pub fn line_ref(&self) -> LineRef {
        LineRef::new(self.para_id, self.line_id)
    }
}

/// Structured request region of a prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub chunk_id: usize,
    pub book: String,
    pub expected_count: usize,
    pub lines: Vec<LineElement>,
}

impl RequestPayload {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            chunk_id: batch.batch_id,
            book: batch.book_id.clone(),
            expected_count: batch.len(),
            lines: batch
                .lines
                .iter()
                .map(|l| LineElement {
                    para_id: l.line.para_id,
                    line_id: l.line.line_id,
                    text: l.source_text.clone(),
                })
                .collect(),
        }
    }

    /// Recover the request from an encoded prompt
    pub fn from_prompt(prompt: &str) -> Option<Self> {
        prompt.lines().next().and_then(|first| serde_json::from_str(first).ok())
    }
}

/// Structured response region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<usize>,
    pub lines: Vec<LineElement>,
}

impl ResponsePayload {
    pub fn from_lines(lines: Vec<LineElement>) -> Self {
        Self { chunk_id: None, lines }
    }
}

/// Auxiliary text attached to one paragraph of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParagraphContext {
    pub para_id: i64,
    pub text: String,
}

/// Response text that does not contain a usable structured region
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("response is empty")]
    Empty,

    #[error("no structured region found in response: {0}")]
    NoStructuredRegion(String),
}

/// Identifier sets of request and response differ
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructuralMismatch {
    pub expected: Vec<LineRef>,
    pub actual: Vec<LineRef>,
    pub missing: Vec<LineRef>,
    pub unexpected: Vec<LineRef>,
    pub duplicated: Vec<LineRef>,
}

impl fmt::Display for StructuralMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected {} element(s), got {} (missing: {}, unexpected: {}, duplicated: {})",
            self.expected.len(),
            self.actual.len(),
            join_refs(&self.missing),
            join_refs(&self.unexpected),
            join_refs(&self.duplicated)
        )
    }
}

fn join_refs(refs: &[LineRef]) -> String {
    if refs.is_empty() {
        return "none".to_string();
    }
    refs.iter().map(LineRef::to_string).collect::<Vec<_>>().join(" ")
}

/// First `PREVIEW_CHARS` characters of a response
pub fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Encode a batch and its paragraph contexts into a prompt
pub fn encode(batch: &Batch, contexts: &[ParagraphContext]) -> String {
    let payload = RequestPayload::from_batch(batch);
    // Serializing plain strings and integers cannot fail
    let json = serde_json::to_string(&payload).unwrap_or_default();

    let mut prompt = json;
    prompt.push_str("\n\n");
    prompt.push_str(&format!(
        "IMPORTANT: The object above contains exactly {count} element(s) in \"lines\". \
         Reply with a single JSON object of the form {{\"lines\": [...]}} containing exactly {count} \
         element(s), one per input element, each with the same \"para_id\" and \"line_id\" and the \
         translation in \"text\". Do not merge, split, skip or add elements.",
        count = batch.len()
    ));

    let mut seen = HashSet::new();
    for context in contexts {
        let text = context.text.trim();
        if text_size(text) <= MIN_CONTEXT_CHARS || !seen.insert(context.para_id) {
            continue;
        }
        prompt.push_str(&format!("\n\nReference for paragraph {}:\n{}", context.para_id, text));
    }

    prompt
}

/// Extract the response elements from free-form response text
///
/// The whole text is tried first, then fenced code blocks, then every
/// balanced `{...}` region from the smallest up.
pub fn decode(text: &str) -> Result<Vec<LineElement>, DecodeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }

    let fenced = FENCED_BLOCK.captures_iter(trimmed).filter_map(|c| c.get(1)).map(|m| m.as_str().trim());
    let mut objects = balanced_objects(trimmed);
    objects.sort_by_key(|region| region.len());

    std::iter::once(trimmed)
        .chain(fenced)
        .chain(objects)
        .find_map(|candidate| serde_json::from_str::<ResponsePayload>(candidate).ok())
        .map(|payload| payload.lines)
        .ok_or_else(|| DecodeError::NoStructuredRegion(preview(trimmed)))
}

/// Every balanced `{...}` region of `text`, string literals respected
fn balanced_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut regions = Vec::new();

    for (start, _) in bytes.iter().enumerate().filter(|(_, b)| **b == b'{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (offset, byte) in bytes[start..].iter().enumerate() {
            if in_string {
                match byte {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        regions.push(&text[start..=start + offset]);
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    regions
}

/// Check that `elements` answer exactly the sentences of `batch`
///
/// On success the translations are returned in batch order.
pub fn validate(batch: &Batch, elements: Vec<LineElement>) -> Result<Vec<TranslatedLine>, StructuralMismatch> {
    let expected = batch.line_refs();
    let actual: Vec<LineRef> = elements.iter().map(LineElement::line_ref).collect();

    let mut counts: HashMap<LineRef, usize> = HashMap::new();
    for line in &actual {
        *counts.entry(*line).or_default() += 1;
    }
    let expected_set: HashSet<LineRef> = expected.iter().copied().collect();

    let missing: Vec<LineRef> = expected.iter().copied().filter(|l| !counts.contains_key(l)).collect();
    let mut unexpected: Vec<LineRef> = counts.keys().copied().filter(|l| !expected_set.contains(l)).collect();
    let mut duplicated: Vec<LineRef> = counts.iter().filter(|(_, n)| **n > 1).map(|(l, _)| *l).collect();
    unexpected.sort();
    duplicated.sort();

    if !missing.is_empty() || !unexpected.is_empty() || !duplicated.is_empty() || actual.len() != expected.len() {
        return Err(StructuralMismatch {
            expected,
            actual,
            missing,
            unexpected,
            duplicated,
        });
    }

    let mut texts: HashMap<LineRef, String> = elements.into_iter().map(|e| (e.line_ref(), e.text)).collect();
    let translations = batch
        .lines
        .iter()
        .map(|l| TranslatedLine {
            line: l.line,
            source_text: l.source_text.clone(),
            translated_text: texts.remove(&l.line).unwrap_or_default().trim().to_string(),
        })
        .collect();

    debug!("Batch {} of book {} passed structural validation", batch.batch_id, batch.book_id);
    Ok(translations)
}
