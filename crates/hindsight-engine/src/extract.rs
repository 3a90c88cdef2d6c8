//! Fact extraction: turn raw retained text into discrete
//! [`MemoryUnit`](crate::memory::MemoryUnit) candidates (SPEC_FULL.md
//! §4.2).
//!
//! Long documents are split into overlapping chunks before extraction
//! so no single LLM call exceeds its context budget; each chunk is
//! extracted independently and the results concatenated. Relative
//! dates inside a fact ("last Tuesday", "three years ago") are
//! resolved against the call's `event_date` anchor — the document's
//! own timestamp for retained documents, or the caller-supplied anchor
//! for a bare `retain()` call with no document.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::error::Result;
use crate::llm::{call_structured, CallScope, LlmClient, Message};
use crate::memory::FactType;

/// Characters per chunk before a document is split. Chosen so a chunk
/// plus the extraction prompt comfortably fits a typical 8k-context
/// model's budget at the embedding service's `MAX_TEXT_LENGTH`-scale
/// granularity.
pub const CHUNK_SIZE_CHARS: usize = 4000;
/// Overlap between consecutive chunks so a fact split across a chunk
/// boundary still appears whole in at least one chunk.
pub const CHUNK_OVERLAP_CHARS: usize = 200;

/// One fact as proposed by the extractor LLM, before it becomes a full
/// `MemoryUnit` (id/embedding/bank_id are assigned by the retain
/// pipeline, not the extractor).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractedFact {
    pub text: String,
    pub fact_type: FactType,
    pub event_date: Option<String>,
    pub occurred_start: Option<String>,
    pub occurred_end: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExtractionResponse {
    facts: Vec<ExtractedFact>,
}

/// A fact after its relative/absolute date strings have been resolved
/// to concrete instants against the extraction anchor.
#[derive(Debug, Clone)]
pub struct ResolvedFact {
    pub text: String,
    pub fact_type: FactType,
    pub event_date: Option<DateTime<Utc>>,
    pub occurred_start: Option<DateTime<Utc>>,
    pub occurred_end: Option<DateTime<Utc>>,
}

/// Split `text` into overlapping chunks of at most `CHUNK_SIZE_CHARS`,
/// breaking at the nearest preceding whitespace so a chunk never cuts
/// a word in half. A text shorter than one chunk yields a single
/// chunk equal to the input.
pub fn chunk_text(text: &str) -> Vec<String> {
    if text.len() <= CHUNK_SIZE_CHARS {
        return vec![text.to_string()];
    }
    let bytes = text.as_bytes();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < bytes.len() {
        let mut end = (start + CHUNK_SIZE_CHARS).min(bytes.len());
        if end < bytes.len() {
            if let Some(ws) = text[start..end].rfind(char::is_whitespace) {
                end = start + ws;
            }
        }
        chunks.push(text[start..end].trim().to_string());
        if end >= bytes.len() {
            break;
        }
        start = end.saturating_sub(CHUNK_OVERLAP_CHARS);
    }
    chunks.into_iter().filter(|c| !c.is_empty()).collect()
}

const EXTRACTION_SYSTEM_PROMPT: &str = "You extract discrete, atomic facts from text for a long-term \
memory store. Each fact is one of: experience (something that happened), world (a general, \
time-invariant fact), or opinion (a belief or preference). Never produce an 'observation' fact_type \
yourself — that type is reserved for the consolidation engine. Preserve relative date expressions \
verbatim in event_date/occurred_start/occurred_end (e.g. 'last Tuesday', 'three years ago') rather \
than guessing an absolute date; resolution happens downstream.";

/// Run extraction over every chunk of `text`, concatenating results.
/// `anchor` is the instant relative dates inside the text are resolved
/// against — a document's own timestamp, or `retain()`'s caller-
/// supplied anchor when there is no source document.
pub async fn extract_facts(llm: &dyn LlmClient, text: &str, anchor: DateTime<Utc>) -> Result<Vec<ResolvedFact>> {
    let mut resolved = Vec::new();
    for chunk in chunk_text(text) {
        let response = extract_chunk(llm, &chunk).await?;
        for fact in response.facts {
            resolved.push(ResolvedFact {
                event_date: fact.event_date.as_deref().and_then(|s| resolve_date(s, anchor)),
                occurred_start: fact.occurred_start.as_deref().and_then(|s| resolve_date(s, anchor)),
                occurred_end: fact.occurred_end.as_deref().and_then(|s| resolve_date(s, anchor)),
                text: fact.text,
                fact_type: fact.fact_type,
            });
        }
    }
    Ok(resolved)
}

async fn extract_chunk(llm: &dyn LlmClient, chunk: &str) -> Result<ExtractionResponse> {
    let messages = [
        Message::system(EXTRACTION_SYSTEM_PROMPT),
        Message::user(format!(
            "Extract facts from this text as JSON: {{\"facts\": [{{\"text\": \"...\", \"fact_type\": \"experience|world|opinion\", \
             \"event_date\": null, \"occurred_start\": null, \"occurred_end\": null}}]}}\n\nText:\n{chunk}"
        )),
    ];
    call_structured(llm, &messages, CallScope::Memory, 2, std::time::Duration::from_secs(30)).await
}

/// Resolve a date expression to an absolute instant, anchored on
/// `anchor` — the call's `event_date` per SPEC_FULL.md §4.2 ("relative
/// temporal expressions are resolved to absolute dates using
/// `event_date` as the anchor"). ISO-8601 literals are parsed directly;
/// everything else goes through [`resolve_relative`]. An expression
/// this resolver doesn't recognize returns `None` rather than guessing —
/// a wrong absolute date would corrupt the best-date priority chain.
fn resolve_date(raw: &str, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|ndt| DateTime::from_naive_utc_and_offset(ndt, Utc));
    }
    resolve_relative(raw, anchor)
}

/// Handles the relative expressions the extractor is instructed to
/// preserve verbatim: same-day markers ("today", "last night"), single-
/// step offsets ("yesterday", "tomorrow"), "N <unit>(s) ago"/"in N
/// <unit>(s)", "last/next <unit>", and "last/next <weekday>". Months
/// and years shift the anchor's naive date by calendar units (not a
/// fixed day count) so "a month ago" on the 31st lands on a valid day
/// in the preceding month. Case-insensitive; unrecognized text is `None`.
fn resolve_relative(raw: &str, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = raw.trim().to_lowercase();

    let shift_days = |days: i64| Some(anchor + Duration::days(days));
    let shift_months = |months: i32| shift_months_keep_time(anchor, months);

    match text.as_str() {
        "today" | "this morning" | "this afternoon" | "this evening" | "tonight" => return shift_days(0),
        "yesterday" | "last night" => return shift_days(-1),
        "tomorrow" | "tomorrow night" => return shift_days(1),
        "last week" => return shift_days(-7),
        "next week" => return shift_days(7),
        "last month" => return shift_months(-1),
        "next month" => return shift_months(1),
        "last year" => return shift_months(-12),
        "next year" => return shift_months(12),
        _ => {}
    }

    if let Some(weekday_offset) = resolve_weekday(&text, anchor) {
        return Some(weekday_offset);
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    // "N day(s)/week(s)/month(s)/year(s) ago"
    if words.len() == 3 && words[2] == "ago" {
        if let Ok(n) = words[0].parse::<i64>() {
            return apply_unit_offset(anchor, words[1], -n);
        }
    }
    // "in N day(s)/week(s)/month(s)/year(s)"
    if words.len() == 3 && words[0] == "in" {
        if let Ok(n) = words[2].parse::<i64>() {
            return apply_unit_offset(anchor, words[1], n);
        }
    }

    None
}

fn apply_unit_offset(anchor: DateTime<Utc>, unit: &str, n: i64) -> Option<DateTime<Utc>> {
    match unit.trim_end_matches('s') {
        "day" => Some(anchor + Duration::days(n)),
        "week" => Some(anchor + Duration::days(n * 7)),
        "month" => shift_months_keep_time(anchor, n as i32),
        "year" => shift_months_keep_time(anchor, n as i32 * 12),
        _ => None,
    }
}

/// Shift `at`'s calendar date by `months` (positive or negative),
/// clamping to the shifted month's last day when the original day
/// doesn't exist there (e.g. Jan 31 minus one month -> Feb 28/29).
fn shift_months_keep_time(at: DateTime<Utc>, months: i32) -> Option<DateTime<Utc>> {
    use chrono::Datelike;
    let total_months = at.year() * 12 + (at.month() as i32 - 1) + months;
    let new_year = total_months.div_euclid(12);
    let new_month = (total_months.rem_euclid(12) + 1) as u32;
    let mut day = at.day();
    while chrono::NaiveDate::from_ymd_opt(new_year, new_month, day).is_none() {
        day -= 1;
    }
    let naive_date = chrono::NaiveDate::from_ymd_opt(new_year, new_month, day)?;
    let naive = naive_date.and_time(at.time());
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// "last/next <weekday>", e.g. "last Tuesday", "next Friday".
fn resolve_weekday(text: &str, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
    use chrono::{Datelike, Weekday};
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() != 2 {
        return None;
    }
    let target: Weekday = match words[1] {
        "monday" => Weekday::Mon,
        "tuesday" => Weekday::Tue,
        "wednesday" => Weekday::Wed,
        "thursday" => Weekday::Thu,
        "friday" => Weekday::Fri,
        "saturday" => Weekday::Sat,
        "sunday" => Weekday::Sun,
        _ => return None,
    };
    let anchor_weekday = anchor.weekday().num_days_from_monday() as i64;
    let target_weekday = target.num_days_from_monday() as i64;
    match words[0] {
        "last" => {
            let mut delta = anchor_weekday - target_weekday;
            if delta <= 0 {
                delta += 7;
            }
            Some(anchor - Duration::days(delta))
        }
        "next" => {
            let mut delta = target_weekday - anchor_weekday;
            if delta <= 0 {
                delta += 7;
            }
            Some(anchor + Duration::days(delta))
        }
        _ => None,
    }
}
