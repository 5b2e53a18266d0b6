//! Analysis pipeline: summary and pricing-plan extraction for a source.
//!
//! Model-first with a deterministic regex fallback. The fallback runs
//! when no credential is configured, the call fails, or the reply yields
//! nothing usable — ingestion never blocks on the hosted model.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::completion;
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::models::{dedupe_plans, PricingPlan};
use crate::normalize::truncate_chars;

/// Plans retained per source after dedup.
pub const MAX_PLANS: usize = 8;
/// Fallback summary length.
const SUMMARY_FALLBACK_CHARS: usize = 180;
/// Text sent to the model is cut to this many characters.
const ANALYSIS_TEXT_MAX_CHARS: usize = 22_000;
/// Sentinel summary when a source has no extractable text.
pub const EMPTY_TEXT_SUMMARY: &str = "テキストを抽出できませんでした";

const SYSTEM_PROMPT: &str = "あなたは社内資料を要約するアシスタントです。必ずJSONのみで回答してください。";

/// Result of analyzing one source.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub summary: String,
    pub plans: Vec<PricingPlan>,
}

/// Analyze a named source text: hosted model when configured, local
/// fallback otherwise. Never fails — degradation is the contract.
pub async fn analyze(
    config: &ModelConfig,
    client: &reqwest::Client,
    name: &str,
    text: &str,
) -> Analysis {
    if config.is_enabled() {
        match analyze_remote(config, client, name, text).await {
            Ok(analysis) if !analysis.summary.is_empty() || !analysis.plans.is_empty() => {
                return analysis;
            }
            Ok(_) => {
                tracing::warn!(source = name, "model analysis returned nothing usable");
            }
            Err(e) => {
                tracing::warn!(source = name, error = %e, "model analysis failed");
            }
        }
    }
    local_analysis(text)
}

// ============ Remote path ============

async fn analyze_remote(
    config: &ModelConfig,
    client: &reqwest::Client,
    name: &str,
    text: &str,
) -> Result<Analysis> {
    let prompt = format!(
        "次の資料を分析してください。\n\
         資料名: {}\n\
         本文:\n{}\n\n\
         以下の形式の厳密なJSONのみを出力してください。\n\
         {{\"summary\": \"200文字以内の要約\", \"plans\": [{{\"name\": \"プラン名\", \"priceMonthlyYen\": 1000, \"note\": \"\"}}]}}\n\
         料金プランが見つからない場合は plans を空配列にしてください。",
        name,
        truncate_chars(text, ANALYSIS_TEXT_MAX_CHARS)
    );

    let reply = completion::chat(config, client, SYSTEM_PROMPT, &prompt).await?;
    let raw = parse_reply(&reply)
        .ok_or_else(|| Error::RemoteService("no JSON object in model reply".to_string()))?;

    let mut plans = dedupe_plans(raw.plans.into_iter().map(|p| PricingPlan {
        name: p.name,
        price_monthly_yen: coerce_price(&p.price_monthly_yen),
        note: p.note,
    }));
    plans.truncate(MAX_PLANS);

    Ok(Analysis {
        summary: raw.summary.trim().to_string(),
        plans,
    })
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    plans: Vec<RawPlan>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    name: String,
    #[serde(rename = "priceMonthlyYen", default)]
    price_monthly_yen: serde_json::Value,
    #[serde(default)]
    note: String,
}

/// Direct parse first; models love to wrap JSON in prose, so on failure
/// retry against the first balanced `{...}` substring of the reply.
fn parse_reply(reply: &str) -> Option<RawAnalysis> {
    if let Ok(parsed) = serde_json::from_str::<RawAnalysis>(reply) {
        return Some(parsed);
    }
    let candidate = first_json_object(reply)?;
    serde_json::from_str::<RawAnalysis>(candidate).ok()
}

/// Locate the first balanced top-level `{...}` substring, respecting
/// string literals and escapes.
fn first_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Number-or-absent: integers pass through, finite floats round, numeric
/// strings (with thousands separators) parse. Everything else is absent.
fn coerce_price(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i)
            } else {
                n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)
            }
        }
        serde_json::Value::String(s) => s.replace(',', "").trim().parse::<i64>().ok(),
        _ => None,
    }
}

// ============ Local fallback ============

/// Deterministic fallback: leading-text summary plus regex-scanned plans.
pub fn local_analysis(text: &str) -> Analysis {
    let trimmed = text.trim();
    let summary = if trimmed.is_empty() {
        EMPTY_TEXT_SUMMARY.to_string()
    } else {
        truncate_chars(trimmed, SUMMARY_FALLBACK_CHARS)
    };
    Analysis {
        summary,
        plans: plans_from_text(text),
    }
}

fn plan_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // <plan name: 1-20 word/CJK chars> <amount with optional thousands separators>円/月
    RE.get_or_init(|| {
        Regex::new(
            r"([0-9A-Za-zぁ-んァ-ヶー々一-龠]{1,20}?)\s*([0-9]{1,3}(?:,[0-9]{3})+|[0-9]+)円/月",
        )
        .expect("plan regex")
    })
}

/// Scan text for "`<name> <amount>円/月`" shapes, dedup by (name, amount),
/// cap at [`MAX_PLANS`].
pub fn plans_from_text(text: &str) -> Vec<PricingPlan> {
    let mut plans = Vec::new();
    for cap in plan_re().captures_iter(text) {
        let name = cap[1].to_string();
        let amount = cap[2].replace(',', "").parse::<i64>().ok();
        plans.push(PricingPlan {
            name,
            price_monthly_yen: amount,
            note: String::new(),
        });
    }
    let mut deduped = dedupe_plans(plans);
    deduped.truncate(MAX_PLANS);
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_extracts_plans_from_japanese_text() {
        let plans = plans_from_text("プランA 3,000円/月 プランB 5,000円/月");
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].name, "プランA");
        assert_eq!(plans[0].price_monthly_yen, Some(3000));
        assert_eq!(plans[1].name, "プランB");
        assert_eq!(plans[1].price_monthly_yen, Some(5000));
    }

    #[test]
    fn fallback_dedupes_and_caps() {
        let mut text = String::new();
        for _ in 0..3 {
            text.push_str("基本 1,000円/月 ");
        }
        for i in 0..12 {
            text.push_str(&format!("プラン{} {}00円/月 ", i, i + 1));
        }
        let plans = plans_from_text(&text);
        assert!(plans.len() <= MAX_PLANS);
        assert_eq!(
            plans.iter().filter(|p| p.name == "基本").count(),
            1,
            "duplicates must collapse"
        );
    }

    #[test]
    fn fallback_summary_truncates_to_180_chars() {
        let text = "あ".repeat(500);
        let analysis = local_analysis(&text);
        assert_eq!(analysis.summary.chars().count(), 180);
    }

    #[test]
    fn fallback_summary_sentinel_for_empty_text() {
        let analysis = local_analysis("   ");
        assert_eq!(analysis.summary, EMPTY_TEXT_SUMMARY);
        assert!(analysis.plans.is_empty());
    }

    #[test]
    fn balanced_object_recovered_from_prose() {
        let reply = "こちらが結果です。\n{\"summary\": \"a {quoted} brace\", \"plans\": []}\nご確認ください。";
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.summary, "a {quoted} brace");
    }

    #[test]
    fn balanced_scan_handles_nested_and_escaped() {
        let raw = r#"noise {"summary": "he said \"{\"", "plans": [{"name": "x", "priceMonthlyYen": 5}]} tail"#;
        let obj = first_json_object(raw).unwrap();
        assert!(obj.starts_with('{') && obj.ends_with('}'));
        let parsed: RawAnalysis = serde_json::from_str(obj).unwrap();
        assert_eq!(parsed.plans.len(), 1);
    }

    #[test]
    fn price_coercion() {
        use serde_json::json;
        assert_eq!(coerce_price(&json!(1000)), Some(1000));
        assert_eq!(coerce_price(&json!(980.4)), Some(980));
        assert_eq!(coerce_price(&json!("3,000")), Some(3000));
        assert_eq!(coerce_price(&json!("unknown")), None);
        assert_eq!(coerce_price(&json!(null)), None);
        assert_eq!(coerce_price(&json!([1])), None);
    }
}
