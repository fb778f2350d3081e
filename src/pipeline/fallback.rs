//! Heuristic reviewer used when the completion service produced nothing
//! usable.
//!
//! Each substantive block is classified by lexical cues (Japanese and
//! English section vocabulary) and gets the fixed message for its category.
//! Education and work-history blocks are skipped: they are mostly dates and
//! school names, and critiquing them is noise.
//!
//! The output is never empty. A document with blocks always gets at least
//! one item anchored to a real block; only a document with no blocks at all
//! gets the single item on [`BoundingBox::DEFAULT`].

use crate::model::{BoundingBox, Review, ReviewItem, Severity, TextBlock};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Score given to every heuristic review.
pub const FALLBACK_SCORE: u32 = 70;

/// Blocks shorter than this (in characters) are not classified.
const MIN_CLASSIFIED_CHARS: usize = 12;

/// Blocks shorter than this get no generic item in the second pass.
const MIN_GENERIC_CHARS: usize = 16;

const DETAILED_SUMMARY: &str =
    "The document was reviewed. Making each section more specific will make it more convincing.";

const MINIMAL_SUMMARY: &str =
    "The main sections were reviewed. Adding concrete detail is the main improvement.";

const GENERIC_MESSAGE: &str = "The outcome and your role are hard to see in this passage.";
const GENERIC_SUGGESTION: &str =
    "Add one sentence each on measurable results, your role and what you did differently.";

static MOTIVATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)志望|動機|motivation|why i (?:want|applied)|reason for applying").unwrap());
static SELF_PR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)自己(?:pr|ｐｒ)|self[- ]?(?:pr|promotion)|about me|strengths?\b").unwrap());
static HISTORY_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)学歴|職歴|education|work history|employment history").unwrap());
static LICENSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)資格|免許|licen[cs]e|certifica(?:te|tion)").unwrap());
static SKILL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)得意|特技|スキル|skills?\b").unwrap());
static STUDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)学生時代|extracurricular|student (?:life|activities)|club activit").unwrap());

/// What a block is about, as far as keywords can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Motivation,
    SelfPromotion,
    License,
    Skill,
    StudentActivity,
    Generic,
}

impl Category {
    pub fn label(self) -> &'static str {
        match self {
            Category::Motivation => "motivation",
            Category::SelfPromotion => "pr",
            Category::License => "license",
            Category::Skill => "skill",
            Category::StudentActivity => "student",
            Category::Generic => "generic",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Category::Motivation => "The reasons behind your motivation read as abstract.",
            Category::SelfPromotion => "The self-promotion lists strengths without showing them.",
            Category::License => "It is unclear how this qualification helps in the role.",
            Category::Skill => "The skills are described too abstractly to picture them at work.",
            Category::StudentActivity => "The scale and outcome of this activity are hard to see.",
            Category::Generic => GENERIC_MESSAGE,
        }
    }

    pub fn suggestion(self) -> &'static str {
        match self {
            Category::Motivation => {
                "State in one sentence where the employer's business meets your experience, then add how you would contribute."
            }
            Category::SelfPromotion => {
                "Add one sentence each on a measurable result, what you did differently, and why you could repeat it."
            }
            Category::License => "Add one sentence on what the qualification taught you and where you would use it.",
            Category::Skill => "Add how long you have used each skill, what you built with it and what you owned.",
            Category::StudentActivity => "Add concrete numbers: how many people, how long, and what came of it.",
            Category::Generic => GENERIC_SUGGESTION,
        }
    }
}

/// Classify one block. `None` means the block is deliberately left alone.
pub fn classify(text: &str) -> Option<Category> {
    if MOTIVATION.is_match(text) {
        Some(Category::Motivation)
    } else if SELF_PR.is_match(text) {
        Some(Category::SelfPromotion)
    } else if HISTORY_HEADER.is_match(text) {
        None
    } else if LICENSE.is_match(text) {
        Some(Category::License)
    } else if SKILL.is_match(text) {
        Some(Category::Skill)
    } else if STUDENT.is_match(text) {
        Some(Category::StudentActivity)
    } else {
        Some(Category::Generic)
    }
}

/// Keyword-driven items, at most `max_items`, de-duplicated by
/// `(page, block, category)`. Empty when no block is substantive.
pub fn heuristic_items(blocks: &[TextBlock], max_items: usize) -> Vec<ReviewItem> {
    let mut items = Vec::new();
    if max_items == 0 {
        return items;
    }

    let mut seen = HashSet::new();
    for block in blocks {
        let text = block.text.trim();
        if text.chars().count() < MIN_CLASSIFIED_CHARS {
            continue;
        }
        let Some(category) = classify(text) else {
            continue;
        };
        if !seen.insert((block.page_number, block.block_index, category)) {
            continue;
        }
        items.push(item_for(block, category));
        if items.len() >= max_items {
            return items;
        }
    }

    if items.is_empty() {
        for block in blocks {
            if block.text.trim().chars().count() < MIN_GENERIC_CHARS {
                continue;
            }
            items.push(item_for(block, Category::Generic));
            if items.len() >= max_items {
                break;
            }
        }
    }
    items
}

fn item_for(block: &TextBlock, category: Category) -> ReviewItem {
    ReviewItem::on_block(
        block,
        Severity::Info,
        category.message(),
        Some(category.suggestion().to_string()),
    )
}

/// A complete heuristic review. Never returns an empty item list.
pub fn heuristic_review(blocks: &[TextBlock], max_items: usize) -> (Review, Vec<ReviewItem>) {
    let items = heuristic_items(blocks, max_items);
    if !items.is_empty() {
        return (Review::new(FALLBACK_SCORE, DETAILED_SUMMARY), items);
    }
    (Review::new(FALLBACK_SCORE, MINIMAL_SUMMARY), vec![minimal_item(blocks)])
}

/// The single generic item: on the first block with text if there is one,
/// otherwise on page 1 at the default box.
fn minimal_item(blocks: &[TextBlock]) -> ReviewItem {
    let anchor = blocks
        .iter()
        .find(|b| !b.text.trim().is_empty())
        .or_else(|| blocks.first());
    match anchor {
        Some(block) => item_for(block, Category::Generic),
        None => ReviewItem {
            review_id: 0,
            page_number: 1,
            bbox: BoundingBox::DEFAULT,
            severity: Severity::Info,
            message: GENERIC_MESSAGE.to_string(),
            suggestion: Some(GENERIC_SUGGESTION.to_string()),
        },
    }
}
