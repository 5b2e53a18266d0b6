//! Answer engine: remote model first, deterministic local fallbacks after.
//!
//! Tier 1 sends the question and candidate sources to the hosted model.
//! Tier 2 handles price-intent questions from structured plans, then from
//! a raw-text price scan. Tier 3 picks the best source by token overlap
//! and returns a snippet. An answer is always produced — the external
//! model is never load-bearing for availability.

use std::sync::OnceLock;

use regex::Regex;

use crate::completion;
use crate::config::ModelConfig;
use crate::error::Result;
use crate::models::{dedupe_plans, Source};
use crate::normalize::truncate_chars;

pub const MSG_NO_SOURCES: &str =
    "まだ資料がありません。先にPDF・テキスト・URLのいずれかを追加してください。";
pub const MSG_NO_USABLE_TEXT: &str = "資料から回答に使えるテキストが見つかりませんでした。";
pub const PRICE_HEADER: &str = "料金情報:";
pub const PRICE_UNKNOWN: &str = "価格不明";

/// Candidate sources sent to the model.
const REMOTE_SOURCES_MAX: usize = 5;
/// Per-source summary cut for the model prompt.
const REMOTE_SUMMARY_MAX_CHARS: usize = 350;
/// Per-source text cut for the model prompt.
const REMOTE_TEXT_MAX_CHARS: usize = 1800;
/// Snippet window around the earliest token hit.
const SNIPPET_BEFORE: usize = 80;
const SNIPPET_AFTER: usize = 220;
/// Unique price-shaped matches taken from raw text.
const PRICE_TEXT_MATCHES_MAX: usize = 5;

const PRICE_INTENT_KEYWORDS: &[&str] = &["料金", "価格", "費用", "プラン", "月額", "値段"];

const SYSTEM_PROMPT: &str =
    "あなたは社内ナレッジに基づいて質問に答えるアシスタントです。資料に無いことは推測せず、その旨を伝えてください。";

/// Answer a question against the candidate sources of the active scope.
///
/// `selected` pins a single source ("this document only"); `None` means
/// all candidates. Remote failures are logged and swallowed — they force
/// the local fallback, never an error to the caller.
pub async fn answer(
    config: &ModelConfig,
    client: &reqwest::Client,
    question: &str,
    selected: Option<&Source>,
    candidates: &[Source],
) -> String {
    if candidates.is_empty() {
        return MSG_NO_SOURCES.to_string();
    }

    if config.is_enabled() {
        match answer_remote(config, client, question, selected, candidates).await {
            Ok(reply) => {
                let trimmed = reply.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
                tracing::warn!("chat model returned an empty reply");
            }
            Err(e) => {
                tracing::warn!(error = %e, "chat model call failed, using local fallback");
            }
        }
    }

    local_answer(question, candidates)
}

// ============ Remote tier ============

async fn answer_remote(
    config: &ModelConfig,
    client: &reqwest::Client,
    question: &str,
    selected: Option<&Source>,
    candidates: &[Source],
) -> Result<String> {
    let mut prompt = String::new();
    prompt.push_str(&format!("質問: {}\n", question));
    match selected {
        Some(source) => prompt.push_str(&format!("対象資料: {}\n", source.name)),
        None => prompt.push_str("対象資料: すべて\n"),
    }
    prompt.push_str("\n資料:\n");
    for source in candidates.iter().take(REMOTE_SOURCES_MAX) {
        prompt.push_str(&format!("## {}\n", source.name));
        if let Some(summary) = &source.summary {
            prompt.push_str(&format!(
                "要約: {}\n",
                truncate_chars(summary, REMOTE_SUMMARY_MAX_CHARS)
            ));
        }
        if !source.pricing_plans.is_empty() {
            for plan in &source.pricing_plans {
                prompt.push_str(&format!("- {}\n", format_plan_line(plan)));
            }
        }
        prompt.push_str(&format!(
            "本文: {}\n\n",
            truncate_chars(&source.text, REMOTE_TEXT_MAX_CHARS)
        ));
    }

    completion::chat(config, client, SYSTEM_PROMPT, &prompt).await
}

// ============ Local tiers ============

/// Deterministic fallback: price branch when the question asks about
/// cost, token-overlap snippet otherwise.
pub fn local_answer(question: &str, candidates: &[Source]) -> String {
    if is_price_intent(question) {
        if let Some(block) = price_answer(candidates) {
            return block;
        }
    }
    general_answer(question, candidates)
}

/// A question is price-intent when it contains any pricing keyword.
pub fn is_price_intent(question: &str) -> bool {
    PRICE_INTENT_KEYWORDS.iter().any(|k| question.contains(k))
}

fn yen_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[0-9]{1,3}(?:,[0-9]{3})+円/月|[0-9]+円/月").expect("yen regex")
    })
}

/// Price branch: structured plans from any candidate first; only when no
/// candidate carries plans, scan raw text for price-shaped substrings.
fn price_answer(candidates: &[Source]) -> Option<String> {
    let plans = dedupe_plans(
        candidates
            .iter()
            .flat_map(|s| s.pricing_plans.iter().cloned()),
    );
    if !plans.is_empty() {
        let lines: Vec<String> = plans.iter().map(format_plan_line).collect();
        return Some(format!("{}\n{}", PRICE_HEADER, lines.join("\n")));
    }

    let mut matches: Vec<String> = Vec::new();
    for source in candidates {
        for m in yen_re().find_iter(&source.text) {
            let hit = m.as_str().to_string();
            if !matches.contains(&hit) {
                matches.push(hit);
                if matches.len() >= PRICE_TEXT_MATCHES_MAX {
                    break;
                }
            }
        }
        if matches.len() >= PRICE_TEXT_MATCHES_MAX {
            break;
        }
    }
    if matches.is_empty() {
        None
    } else {
        Some(format!("{}\n{}", PRICE_HEADER, matches.join("\n")))
    }
}

fn format_plan_line(plan: &crate::models::PricingPlan) -> String {
    match plan.price_monthly_yen {
        Some(amount) => format!("{}: {}円/月", plan.name, format_number(amount)),
        None => format!("{}: {}", plan.name, PRICE_UNKNOWN),
    }
}

fn format_number(n: i64) -> String {
    let s = n.abs().to_string();
    let mut grouped = String::with_capacity(s.len() + s.len() / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*c);
    }
    let grouped: String = grouped.chars().rev().collect();
    if n < 0 {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

/// General branch: token-overlap scoring with first-seen tie-break.
fn general_answer(question: &str, candidates: &[Source]) -> String {
    let folded = question.to_lowercase();
    let tokens: Vec<&str> = folded
        .split_whitespace()
        .filter(|t| t.chars().count() >= 2)
        .collect();

    let mut best: Option<&Source> = None;
    let mut best_score: i64 = -1;
    for source in candidates {
        if source.text.trim().is_empty() {
            continue;
        }
        let haystack = source.text.to_lowercase();
        let score = tokens.iter().filter(|t| haystack.contains(**t)).count() as i64;
        // Strictly greater: an earlier candidate keeps the lead on ties.
        if score > best_score {
            best = Some(source);
            best_score = score;
        }
    }

    let Some(winner) = best else {
        return MSG_NO_USABLE_TEXT.to_string();
    };

    if best_score <= 0 {
        if let Some(summary) = winner.summary.as_deref().filter(|s| !s.trim().is_empty()) {
            return format!("{} の概要: {}", winner.name, summary);
        }
    }

    let haystack = winner.text.to_lowercase();
    let hit_char_idx = tokens
        .iter()
        .filter_map(|t| haystack.find(*t))
        .min()
        .map(|byte_idx| haystack[..byte_idx].chars().count())
        .unwrap_or(0);
    let snippet = snippet_window(&winner.text, hit_char_idx);
    format!("「{}」を参照: {}", winner.name, snippet)
}

/// Window of [hit − 80, hit + 220] characters, clamped to the text,
/// whitespace-collapsed.
fn snippet_window(text: &str, center: usize) -> String {
    let start = center.saturating_sub(SNIPPET_BEFORE);
    let end = center + SNIPPET_AFTER;
    let window: String = text.chars().skip(start).take(end - start).collect();
    window.split_whitespace().collect::<Vec<_>>().join(" ")
}
