//! Review generation: completion calls, decoding, resolution and the single
//! narrowed retry.
//!
//! ```text
//! first pass ──▶ resolve ──▶ anchored ≥ min? ──yes──▶ done
//!                                │ no
//!                                ▼
//!                 retry over selected blocks ──▶ resolve ──▶ keep the better pass
//!                                                               │ nothing anchored
//!                                                               ▼
//!                                                        heuristic fallback
//! ```
//!
//! The completion capability is called at most twice per review. A provider
//! error or undecodable answer on the first pass goes straight to the
//! heuristic reviewer; on the retry it just leaves the first pass in place.
//!
//! A decoded retry does not automatically win: its items replace the first
//! pass only when it anchors at least as many of them. A retry that anchors
//! fewer is discarded, though its unanchored items still count as dropped.
//! Score and summary always come from the first pass.

use super::decode_lenient;
use super::fallback::{heuristic_review, FALLBACK_SCORE};
use super::resolve::{resolve_items, CandidateItem, Resolution};
use crate::completion::CompletionClient;
use crate::config::ReviewConfig;
use crate::error::{CompletionError, StageError};
use crate::model::{Review, ReviewItem, TextBlock};
use crate::prompts::{
    block_listing, retry_prompt, review_prompt, PromptContext, DEFAULT_SUMMARY, REVIEW_SYSTEM_PROMPT,
    RETRY_SYSTEM_PROMPT,
};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use tokio::time::Instant;
use tracing::{info, warn};

/// Blocks shorter than this are not offered to the retry prompt.
const MIN_RETRY_BLOCK_CHARS: usize = 12;

/// Pages with no selected block are backfilled with blocks at least this long.
const MIN_BACKFILL_BLOCK_CHARS: usize = 8;

/// The JSON object the review prompts ask for.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReviewResponse {
    #[serde(deserialize_with = "lenient_score")]
    score: Option<u32>,
    summary: String,
    items: Vec<CandidateItem>,
}

/// Accept `80`, `80.5` or `"80"`. Non-positive or unreadable is `None`.
fn lenient_score<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    let n = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(n.filter(|n| n.is_finite() && *n >= 1.0).map(|n| n.round().min(100.0) as u32))
}

/// Everything the generator needs for one review.
pub struct GenerateRequest<'a> {
    pub blocks: &'a [TextBlock],
    pub context: PromptContext<'a>,
    pub config: &'a ReviewConfig,
    pub completion: Option<&'a dyn CompletionClient>,
    /// Caller deadline, honoured only around completion calls.
    pub deadline: Option<Instant>,
}

/// The review, its anchored items and how they were obtained.
#[derive(Debug, Clone)]
pub struct Generated {
    pub review: Review,
    pub items: Vec<ReviewItem>,
    pub completion_calls: usize,
    /// Items returned by the model in the pass that was kept.
    pub raw_items: usize,
    /// Items dropped across both passes.
    pub dropped_items: usize,
    pub retried: bool,
    pub fallback_used: bool,
    pub errors: Vec<StageError>,
}

/// Produce a review for `request.blocks`. Never returns an empty item list.
pub async fn generate_review(request: GenerateRequest<'_>) -> Generated {
    let GenerateRequest {
        blocks,
        context,
        config,
        completion,
        deadline,
    } = request;

    let mut out = Generated {
        review: Review::new(FALLBACK_SCORE, DEFAULT_SUMMARY),
        items: Vec::new(),
        completion_calls: 0,
        raw_items: 0,
        dropped_items: 0,
        retried: false,
        fallback_used: false,
        errors: Vec::new(),
    };

    let client = match completion {
        Some(c) if !blocks.is_empty() => c,
        Some(_) => {
            warn!("No text blocks to review, using heuristic review");
            return with_fallback(out, blocks, config);
        }
        None => {
            warn!("No completion provider, using heuristic review");
            out.errors.push(StageError::GenerationFailed {
                detail: "no completion provider configured".into(),
            });
            return with_fallback(out, blocks, config);
        }
    };

    // ── First pass ───────────────────────────────────────────────────────
    let listing = block_listing(blocks, Some(config.prompt_char_budget));
    let prompt = review_prompt(&context, &listing);
    let first = match request_pass(
        client,
        REVIEW_SYSTEM_PROMPT,
        &prompt,
        config,
        deadline,
        &mut out.completion_calls,
    )
    .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!("Review generation failed, using heuristic review: {}", e);
            out.errors.push(e);
            return with_fallback(out, blocks, config);
        }
    };

    out.review = Review::new(
        first.score.unwrap_or(FALLBACK_SCORE),
        non_blank(&first.summary).unwrap_or(DEFAULT_SUMMARY),
    );
    let mut kept = resolve_pass(&first.items, blocks);
    out.dropped_items += kept.dropped;
    info!(
        "First pass: {} items returned, {} anchored",
        kept.raw,
        kept.items.len()
    );

    // ── Narrowed retry ───────────────────────────────────────────────────
    if kept.items.len() < config.min_anchored_items {
        out.retried = true;
        let selected = select_review_blocks(blocks, config.retry_block_cap);
        let prompt = retry_prompt(&context, &block_listing(&selected, None));
        warn!(
            "Only {} of {} items anchored, retrying over {} blocks",
            kept.items.len(),
            config.min_anchored_items,
            selected.len()
        );
        let second = request_pass(
            client,
            RETRY_SYSTEM_PROMPT,
            &prompt,
            config,
            deadline,
            &mut out.completion_calls,
        )
        .await;
        match second {
            Ok(second) => {
                let retry = resolve_pass(&second.items, blocks);
                out.dropped_items += retry.dropped;
                info!(
                    "Retry: {} items returned, {} anchored",
                    retry.raw,
                    retry.items.len()
                );
                if retry.items.len() >= kept.items.len() {
                    kept = retry;
                }
            }
            Err(e) => {
                warn!("Retry failed, keeping first pass: {}", e);
                out.errors.push(e);
            }
        }
    }

    out.raw_items = kept.raw;
    if kept.items.is_empty() {
        warn!("No item could be anchored, using heuristic review");
        return with_fallback(out, blocks, config);
    }
    out.items = kept.items;
    out
}

/// Issue one completion call and decode its answer. `calls` counts calls
/// actually sent, so a call skipped for an expired deadline is not counted.
async fn request_pass(
    client: &dyn CompletionClient,
    system_prompt: &str,
    user_prompt: &str,
    config: &ReviewConfig,
    deadline: Option<Instant>,
    calls: &mut usize,
) -> Result<ReviewResponse, StageError> {
    if deadline.is_some_and(|at| Instant::now() >= at) {
        return Err(CompletionError::DeadlineExceeded.into());
    }
    *calls += 1;
    let call = client.complete_json(
        system_prompt,
        user_prompt,
        config.temperature,
        config.max_tokens,
    );
    let raw = match deadline {
        Some(at) => tokio::time::timeout_at(at, call)
            .await
            .unwrap_or(Err(CompletionError::DeadlineExceeded)),
        None => call.await,
    }?;
    decode_lenient::<ReviewResponse>(&raw).map_err(|e| StageError::GenerationFailed {
        detail: format!("undecodable review: {e}"),
    })
}

/// Drop blank quotes, then resolve the rest.
fn resolve_pass(candidates: &[CandidateItem], blocks: &[TextBlock]) -> Resolution {
    let quoted: Vec<CandidateItem> = candidates
        .iter()
        .filter(|c| !c.quote.trim().is_empty())
        .cloned()
        .collect();
    let mut resolution = resolve_items(&quoted, blocks);
    resolution.raw = candidates.len();
    resolution.dropped += candidates.len() - quoted.len();
    resolution
}

fn with_fallback(mut out: Generated, blocks: &[TextBlock], config: &ReviewConfig) -> Generated {
    let (review, items) = heuristic_review(blocks, config.max_heuristic_items);
    info!("Heuristic review produced {} items", items.len());
    out.review = review;
    out.items = items;
    out.fallback_used = true;
    out
}

fn non_blank(s: &str) -> Option<&str> {
    Some(s.trim()).filter(|s| !s.is_empty())
}

/// Blocks offered to the retry prompt.
///
/// Substantive blocks (at least 12 characters, not a label ending in a
/// colon) are ranked by length and the longest `cap` kept. Pages left
/// without a block are backfilled with their blocks of at least 8
/// characters. The result is in document order.
pub fn select_review_blocks(blocks: &[TextBlock], cap: usize) -> Vec<TextBlock> {
    if cap == 0 {
        return Vec::new();
    }

    let mut substantive: Vec<&TextBlock> = blocks
        .iter()
        .filter(|b| {
            let text = b.text.trim();
            text.chars().count() >= MIN_RETRY_BLOCK_CHARS && !text.ends_with(':') && !text.ends_with('：')
        })
        .collect();
    substantive.sort_by_key(|b| std::cmp::Reverse(b.text.trim().chars().count()));
    substantive.truncate(cap);

    let covered: HashSet<u32> = substantive.iter().map(|b| b.page_number).collect();
    let mut selected = substantive;
    for block in blocks {
        if selected.len() >= cap {
            break;
        }
        if covered.contains(&block.page_number) {
            continue;
        }
        if block.text.trim().chars().count() >= MIN_BACKFILL_BLOCK_CHARS {
            selected.push(block);
        }
    }

    let mut selected: Vec<TextBlock> = selected.into_iter().cloned().collect();
    selected.sort_by_key(|b| (b.page_number, b.block_index));
    selected
}
