//! Prompts for the review completion calls.
//!
//! Both review prompts list the document as `[P<page>B<index>] <text>` lines.
//! The tags double as the `page_hint` / `block_index` the model is asked to
//! return, which is what lets the resolver anchor items by position.

use crate::model::TextBlock;

/// System prompt for the first review pass.
pub const REVIEW_SYSTEM_PROMPT: &str = "You are an expert reviewer of résumés and job-application entry sheets. \
You always give concrete rewrite suggestions and you quote the document verbatim.";

/// System prompt for the narrowed retry pass.
pub const RETRY_SYSTEM_PROMPT: &str = "You are an expert reviewer of résumés and job-application entry sheets.";

/// Summary used when the model returns none.
pub const DEFAULT_SUMMARY: &str =
    "The document was reviewed. Making each section more specific about outcomes is the main improvement.";

/// The JSON shape both review prompts demand.
const OUTPUT_SCHEMA: &str = r#"{"score":0-100,"summary":"short summary","items":[{"quote":"a sentence copied from the document","message":"the issue","suggestion":"the rewrite","severity":"info|warning|critical","page_hint":1,"block_index":1}]}"#;

/// Request-level context forwarded into the review prompts.
#[derive(Debug, Clone, Default)]
pub struct PromptContext<'a> {
    pub company_name: &'a str,
    pub job_title: &'a str,
    pub candidate_type: &'a str,
    /// Employer profile from the enrichment step; empty when unavailable.
    pub employer_context: &'a str,
}

/// Render blocks as `[P#B#] text` lines.
///
/// Blocks with blank text are skipped. With a `budget`, lines are appended in
/// document order until the next one would push the listing past `budget`
/// characters; a single oversized first line is cut at the budget so the
/// listing is never empty while text exists.
pub fn block_listing(blocks: &[TextBlock], budget: Option<usize>) -> String {
    let mut out = String::new();
    let mut used = 0usize;
    for block in blocks {
        let text = block.text.trim();
        if text.is_empty() {
            continue;
        }
        let line = format!("[P{}B{}] {}\n", block.page_number, block.block_index, text);
        let len = line.chars().count();
        if let Some(limit) = budget {
            if used + len > limit {
                if out.is_empty() {
                    out.extend(line.chars().take(limit));
                }
                break;
            }
        }
        used += len;
        out.push_str(&line);
    }
    out
}

fn context_section(ctx: &PromptContext<'_>) -> String {
    format!(
        "Company: {}\nPosition: {}\nEmployer profile (reference): {}\nCandidate type: {}\n",
        ctx.company_name.trim(),
        ctx.job_title.trim(),
        ctx.employer_context.trim(),
        ctx.candidate_type.trim(),
    )
}

/// User prompt for the first review pass over the (budgeted) block listing.
pub fn review_prompt(ctx: &PromptContext<'_>, listing: &str) -> String {
    format!(
        r#"Below is the OCR text of a résumé or entry sheet.
Review it and return at most 8 improvement points as JSON.
Every item must include a short quote that appears verbatim in the text; the quote is used to locate the item.
Do not point out missing information ("not stated", "left blank"). Only critique what the text actually says.
Use the P# of the [P#B#] tag at the start of each line as page_hint, and the B# as block_index.
Each item must belong to exactly one block. Overall summaries or general evaluations are not items.
message and suggestion must quote or summarise the block they refer to.
suggestion must show how to fix it, with concrete words: numbers, role, results, reproducibility.
Write message, suggestion and summary in the language of the document.

{context}If the company is blank, review from a general point of view.
Only critique education or work history entries when they are clearly inconsistent or incomplete.
Judge how the document would be read against this employer's expectations (ideal candidate, business domain, evaluation axes).
Prefer advice tailored to this employer over generic advice.

Output only this JSON:
{schema}

OCR text:
{listing}"#,
        context = context_section(ctx),
        schema = OUTPUT_SCHEMA,
        listing = listing,
    )
}

/// User prompt for the narrowed retry pass over an explicit block list.
pub fn retry_prompt(ctx: &PromptContext<'_>, listing: &str) -> String {
    format!(
        r#"From the block list below, return at most 8 points, each tied to one block.
Every item must include block_index and page_hint, and quote must be copied verbatim from that block's text.
No overall summaries or general evaluations. Critique block by block.
suggestion must be a concrete rewrite (numbers, role, results, reproducibility).
Write message, suggestion and summary in the language of the document.

{context}Only critique education or work history entries when they are clearly inconsistent or incomplete.

Block list:
{listing}
Output only this JSON:
{schema}"#,
        context = context_section(ctx),
        listing = listing,
        schema = OUTPUT_SCHEMA,
    )
}

/// Prompt for the employer-profile fallback used when the report service is
/// unavailable.
pub fn employer_profile_prompt(company_name: &str) -> String {
    format!(
        r#"Company: {}
Summarise what this employer looks for when hiring (ideal candidate, evaluation axes, business domain).
Do not state uncertain facts as certain; stay within what can be said in general.
Output only this JSON:
{{"summary":"a 200-300 character company overview","evaluation_axes":["axis 1","axis 2"],"keywords":["keyword 1","keyword 2"]}}"#,
        company_name.trim()
    )
}
