//! Quote resolution: anchor model-produced items onto extracted blocks.
//!
//! The model is asked to quote the document verbatim and to name the
//! `[P#B#]` tag of the block it critiques. Neither can be trusted: tags are
//! sometimes off by one, and quotes drift through paraphrase and OCR noise.
//! Resolution therefore runs in three steps, stopping at the first accepted
//! block:
//!
//! 1. **Hinted lookup**: the block with exactly `(page_hint, block_index)`.
//! 2. **Scoring**: every candidate block is ranked, first those on the hinted
//!    page, then the whole document. A block whose normalised text contains
//!    the normalised quote ranks above any token-overlap match; token overlap
//!    only orders the rest.
//! 3. **Verification**: whatever step 1 or 2 picked is accepted only if its
//!    normalised text literally contains the normalised quote.
//!
//! An item with no accepted block is dropped. It is never anchored to a
//! "close enough" block, so every item's bounding box is one a verified quote
//! came from.

use crate::model::{ReviewItem, Severity, TextBlock};
use serde::{Deserialize, Deserializer};
use tracing::debug;

/// Quotes shorter than this (in characters) are only resolved by an exact
/// position hint.
pub const MIN_SCORED_QUOTE_CHARS: usize = 6;

/// Characters that separate tokens besides whitespace.
const TOKEN_SEPARATORS: &[char] = &[
    '。', '、', '，', '．', '.', ',', '!', '?', ';', ':', '！', '？', '；', '：', '(', ')', '（',
    '）', '「', '」', '『', '』', '・', '/', '"', '\'',
];

/// One critique as returned by the completion service, before resolution.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CandidateItem {
    pub quote: String,
    pub message: String,
    pub suggestion: String,
    pub severity: String,
    #[serde(deserialize_with = "positive_index")]
    pub page_hint: Option<u32>,
    #[serde(deserialize_with = "positive_index")]
    pub block_index: Option<u32>,
}

/// Accept `1`, `1.0` or `"1"`; anything non-positive or unreadable is `None`.
fn positive_index<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    let n = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(n.filter(|n| n.is_finite() && *n >= 1.0 && n.fract() == 0.0 && *n <= u32::MAX as f64)
        .map(|n| n as u32))
}

/// Items that survived resolution, plus what was lost on the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub items: Vec<ReviewItem>,
    /// Candidates handed to the resolver.
    pub raw: usize,
    /// Candidates discarded (blank quote or no verified block).
    pub dropped: usize,
}

/// Lower-case and strip all whitespace, including the full-width space.
pub fn normalize_text(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// De-duplicated tokens of at least two characters, in first-seen order.
pub fn tokens(s: &str) -> Vec<String> {
    let lower = s.to_lowercase();
    let mut out: Vec<String> = Vec::new();
    for token in lower.split(|c: char| c.is_whitespace() || TOKEN_SEPARATORS.contains(&c)) {
        if token.chars().count() >= 2 && !out.iter().any(|t| t == token) {
            out.push(token.to_string());
        }
    }
    out
}

/// Whether the normalised quote occurs in the normalised block text.
pub fn quote_in_block(quote: &str, block_text: &str) -> bool {
    let q = normalize_text(quote);
    !q.is_empty() && normalize_text(block_text).contains(&q)
}

/// Ranking key of one block for one quote. Higher is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Rank {
    contains_quote: bool,
    score: u32,
}

fn rank(block_text: &str, quote_norm: &str, quote_tokens: &[String]) -> Rank {
    let block_norm = normalize_text(block_text);
    if block_norm.is_empty() {
        return Rank {
            contains_quote: false,
            score: 0,
        };
    }
    if block_norm.contains(quote_norm) {
        return Rank {
            contains_quote: true,
            score: 100,
        };
    }
    if quote_norm.contains(&block_norm) {
        return Rank {
            contains_quote: false,
            score: 100,
        };
    }
    let block_tokens = tokens(block_text);
    let shared = quote_tokens
        .iter()
        .filter(|t| block_tokens.contains(t))
        .count() as u32;
    Rank {
        contains_quote: false,
        score: shared * 10,
    }
}

/// The best-ranked block among `candidates` with a positive score. Ties go to
/// the earliest block.
fn best_block<'a>(
    candidates: impl Iterator<Item = &'a TextBlock>,
    quote_norm: &str,
    quote_tokens: &[String],
) -> Option<&'a TextBlock> {
    let mut best: Option<(Rank, &TextBlock)> = None;
    for block in candidates {
        let r = rank(&block.text, quote_norm, quote_tokens);
        if r.score == 0 {
            continue;
        }
        if best.map_or(true, |(b, _)| r > b) {
            best = Some((r, block));
        }
    }
    best.map(|(_, block)| block)
}

/// Find the verified block for one candidate item.
pub fn resolve_block<'a>(item: &CandidateItem, blocks: &'a [TextBlock]) -> Option<&'a TextBlock> {
    let quote = item.quote.trim();
    let quote_norm = normalize_text(quote);
    if quote_norm.is_empty() {
        return None;
    }
    let verified = |b: &&TextBlock| normalize_text(&b.text).contains(&quote_norm);

    if let (Some(page), Some(index)) = (item.page_hint, item.block_index) {
        let hinted = blocks
            .iter()
            .find(|b| b.page_number == page && b.block_index == index);
        if let Some(block) = hinted.filter(verified) {
            return Some(block);
        }
    }

    if quote.chars().count() < MIN_SCORED_QUOTE_CHARS {
        return None;
    }
    let quote_tokens = tokens(quote);

    if let Some(page) = item.page_hint {
        let on_page = blocks.iter().filter(|b| b.page_number == page);
        if let Some(block) = best_block(on_page, &quote_norm, &quote_tokens).filter(verified) {
            return Some(block);
        }
    }

    best_block(blocks.iter(), &quote_norm, &quote_tokens).filter(verified)
}

/// Resolve every candidate; unresolvable ones are dropped and counted.
pub fn resolve_items(candidates: &[CandidateItem], blocks: &[TextBlock]) -> Resolution {
    let mut resolution = Resolution {
        raw: candidates.len(),
        ..Default::default()
    };
    for candidate in candidates {
        match resolve_block(candidate, blocks) {
            Some(block) => {
                let suggestion = Some(candidate.suggestion.trim().to_string());
                resolution.items.push(ReviewItem::on_block(
                    block,
                    Severity::parse_lenient(&candidate.severity),
                    candidate.message.trim(),
                    suggestion,
                ));
            }
            None => {
                debug!(
                    "Dropped unanchored item (hint P{:?}B{:?}): {:?}",
                    candidate.page_hint, candidate.block_index, candidate.quote
                );
                resolution.dropped += 1;
            }
        }
    }
    resolution
}
