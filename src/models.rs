//! Core data models for the knowledge-chat pipeline.
//!
//! These types represent the sources, threads, and messages that flow
//! through ingestion, storage, and answering, plus the organization
//! entities referenced by the team scope.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Current wall-clock time as UTC epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Origin of a source's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Pdf,
    Text,
    Url,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Pdf => "pdf",
            SourceType::Text => "text",
            SourceType::Url => "url",
        }
    }

    /// Parse a stored marker; unknown values fall back to pdf, the
    /// implicit default for uploaded binaries.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "text" => SourceType::Text,
            "url" => SourceType::Url,
            _ => SourceType::Pdf,
        }
    }
}

/// A single pricing plan extracted from a source.
///
/// `price_monthly_yen` is either a real number or absent ("unknown") —
/// never NaN. Dedup key is the (name, price) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPlan {
    pub name: String,
    #[serde(rename = "priceMonthlyYen", default)]
    pub price_monthly_yen: Option<i64>,
    #[serde(default)]
    pub note: String,
}

/// Drop empty-name entries and collapse duplicates by (name, price),
/// keeping the first occurrence of each key.
pub fn dedupe_plans<I>(plans: I) -> Vec<PricingPlan>
where
    I: IntoIterator<Item = PricingPlan>,
{
    let mut seen: HashSet<(String, Option<i64>)> = HashSet::new();
    let mut out = Vec::new();
    for plan in plans {
        let name = plan.name.trim();
        if name.is_empty() {
            continue;
        }
        if seen.insert((name.to_string(), plan.price_monthly_yen)) {
            out.push(PricingPlan {
                name: name.to_string(),
                price_monthly_yen: plan.price_monthly_yen,
                note: plan.note,
            });
        }
    }
    out
}

/// A unit of ingested knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    /// Normalized full text.
    pub text: String,
    pub summary: Option<String>,
    #[serde(rename = "pricingPlans", default)]
    pub pricing_plans: Vec<PricingPlan>,
    /// Blob location; absent for pasted text and URLs.
    pub storage_path: Option<String>,
    pub source_type: SourceType,
    /// Back-reference (not ownership) to the personal source this team
    /// copy was made from.
    pub inherited_from: Option<String>,
    pub created_at: i64,
}

/// The partition context that determines which collections are visible
/// and writable. Exhaustively matched everywhere — never optional fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Personal,
    Team { team_id: String, team_name: String },
}

impl Scope {
    pub fn is_team(&self) -> bool {
        matches!(self, Scope::Team { .. })
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            Scope::Personal => "personal",
            Scope::Team { .. } => "team",
        }
    }
}

/// A conversation container holding ordered messages. Team threads own
/// their own source sub-collection; personal threads share the user's
/// global personal collection.
#[derive(Debug, Clone)]
pub struct Thread {
    pub id: String,
    pub owner_uid: String,
    pub scope: Scope,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Assistant => "assistant",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        if s == "assistant" {
            Sender::Assistant
        } else {
            Sender::User
        }
    }
}

/// Immutable chat message, ordered by creation time ascending within a
/// thread.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub sender: Sender,
    pub text: String,
    pub created_at: i64,
}

/// Organization owning members and teams.
#[derive(Debug, Clone)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub seat_limit: i64,
    pub seat_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Owner,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Member => "member",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        if s == "owner" {
            MemberRole::Owner
        } else {
            MemberRole::Member
        }
    }
}

/// A user within exactly one company.
#[derive(Debug, Clone)]
pub struct Member {
    pub uid: String,
    pub company_id: String,
    pub email: String,
    pub display_name: String,
    pub role: MemberRole,
}

/// A named group of members within a company. The creator is implicitly
/// a member even when absent from `member_uids`.
#[derive(Debug, Clone)]
pub struct Team {
    pub id: String,
    pub company_id: String,
    pub name: String,
    pub created_by: String,
    pub member_uids: Vec<String>,
}

impl Team {
    pub fn has_member(&self, uid: &str) -> bool {
        self.created_by == uid || self.member_uids.iter().any(|m| m == uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(name: &str, price: Option<i64>) -> PricingPlan {
        PricingPlan {
            name: name.to_string(),
            price_monthly_yen: price,
            note: String::new(),
        }
    }

    #[test]
    fn dedupe_drops_empty_names() {
        let out = dedupe_plans(vec![plan("", Some(100)), plan("  ", None), plan("Basic", None)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Basic");
    }

    #[test]
    fn dedupe_collapses_name_price_pairs() {
        let out = dedupe_plans(vec![
            plan("Basic", Some(1000)),
            plan("Basic", Some(1000)),
            plan("Basic", Some(2000)),
            plan("Basic", None),
            plan("Basic", None),
        ]);
        // Same name with distinct prices survives; exact pairs collapse.
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let out = dedupe_plans(vec![
            PricingPlan {
                name: "Pro".to_string(),
                price_monthly_yen: Some(5000),
                note: "first".to_string(),
            },
            PricingPlan {
                name: "Pro".to_string(),
                price_monthly_yen: Some(5000),
                note: "second".to_string(),
            },
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].note, "first");
    }

    #[test]
    fn team_membership_includes_creator() {
        let team = Team {
            id: "t1".to_string(),
            company_id: "c1".to_string(),
            name: "dev".to_string(),
            created_by: "alice".to_string(),
            member_uids: vec!["bob".to_string()],
        };
        assert!(team.has_member("alice"));
        assert!(team.has_member("bob"));
        assert!(!team.has_member("carol"));
    }
}
