//! Knowledge store: source lifecycle across personal and team scopes.
//!
//! A source lives in exactly one scope container — a user's global
//! personal collection, or a team thread's document sub-collection.
//! Team inheritance is a point-in-time deep copy, never a live link.
//!
//! Live queries follow the subscribe → full-snapshot-per-change →
//! unsubscribe contract: every subscription emits the complete ordered
//! result set immediately and again after each relevant write, until the
//! receiver is dropped. Callers switching scope drop the old
//! subscription before opening the next one so stale-scope snapshots
//! never land after a switch.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::KnowledgeConfig;
use crate::error::{Error, Result};
use crate::models::{now_ms, Member, PricingPlan, Scope, Source, SourceType, Team};

/// Collection-level change notifications driving live queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    PersonalSources { uid: String },
    ThreadSources { thread_id: String },
    Threads { uid: String },
    Messages { thread_id: String },
    Teams { company_id: String },
    Members { company_id: String },
}

/// Shared change bus. Writers notify after committing; watch tasks
/// requery and emit fresh snapshots.
#[derive(Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn notify(&self, event: ChangeEvent) {
        // No receivers is fine — nothing is watching yet.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live query handle. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx }
    }

    /// Next full-result-set snapshot, or `None` once the watch ends.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// Which scope container a store call reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeContext {
    /// The user's global personal collection, shared by every personal
    /// thread.
    Personal { uid: String },
    /// A specific team thread's document sub-collection.
    TeamThread { uid: String, thread_id: String },
}

impl ScopeContext {
    pub fn for_scope(uid: &str, scope: &Scope, thread_id: &str) -> Self {
        match scope {
            Scope::Personal => ScopeContext::Personal {
                uid: uid.to_string(),
            },
            Scope::Team { .. } => ScopeContext::TeamThread {
                uid: uid.to_string(),
                thread_id: thread_id.to_string(),
            },
        }
    }

    fn event(&self) -> ChangeEvent {
        match self {
            ScopeContext::Personal { uid } => ChangeEvent::PersonalSources { uid: uid.clone() },
            ScopeContext::TeamThread { thread_id, .. } => ChangeEvent::ThreadSources {
                thread_id: thread_id.clone(),
            },
        }
    }
}

/// Fields for a new source; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct SourceDraft {
    pub name: String,
    pub text: String,
    pub summary: Option<String>,
    pub pricing_plans: Vec<PricingPlan>,
    pub storage_path: Option<String>,
    pub source_type: SourceType,
}

pub struct KnowledgeStore {
    pool: SqlitePool,
    blobs: Arc<dyn BlobStore>,
    bus: ChangeBus,
    limits: KnowledgeConfig,
}

impl KnowledgeStore {
    pub fn new(
        pool: SqlitePool,
        blobs: Arc<dyn BlobStore>,
        bus: ChangeBus,
        limits: KnowledgeConfig,
    ) -> Self {
        Self {
            pool,
            blobs,
            bus,
            limits,
        }
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Persist a new source in the given scope container.
    pub async fn create_source(&self, ctx: &ScopeContext, draft: SourceDraft) -> Result<Source> {
        let source = Source {
            id: Uuid::new_v4().to_string(),
            name: draft.name,
            text: draft.text,
            summary: draft.summary,
            pricing_plans: draft.pricing_plans,
            storage_path: draft.storage_path,
            source_type: draft.source_type,
            inherited_from: None,
            created_at: now_ms(),
        };

        let (owner_uid, thread_id) = match ctx {
            ScopeContext::Personal { uid } => (uid.as_str(), None),
            ScopeContext::TeamThread { uid, thread_id } => (uid.as_str(), Some(thread_id.as_str())),
        };

        insert_source(&self.pool, owner_uid, thread_id, &source).await?;
        self.bus.notify(ctx.event());
        Ok(source)
    }

    /// Sources in the scope, newest first, capped per scope kind.
    pub async fn list_sources(&self, ctx: &ScopeContext) -> Result<Vec<Source>> {
        query_sources(&self.pool, &self.limits, ctx).await
    }

    /// Fetch one source from the scope, if present.
    pub async fn get_source(&self, ctx: &ScopeContext, id: &str) -> Result<Option<Source>> {
        let row = match ctx {
            ScopeContext::Personal { uid } => {
                sqlx::query(
                    "SELECT * FROM sources WHERE id = ? AND owner_uid = ? AND thread_id IS NULL",
                )
                .bind(id)
                .bind(uid)
                .fetch_optional(&self.pool)
                .await?
            }
            ScopeContext::TeamThread { thread_id, .. } => {
                sqlx::query("SELECT * FROM sources WHERE id = ? AND thread_id = ?")
                    .bind(id)
                    .bind(thread_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        Ok(row.map(|r| row_to_source(&r)))
    }

    /// Live query over the scope's sources.
    pub fn watch_sources(&self, ctx: ScopeContext) -> Subscription<Vec<Source>> {
        let pool = self.pool.clone();
        let limits = self.limits.clone();
        let mut events = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let wanted = ctx.event();
            // Initial snapshot, then one per relevant change.
            loop {
                match query_sources(&pool, &limits, &ctx).await {
                    Ok(snapshot) => {
                        if tx.send(snapshot).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "source watch query failed"),
                }
                loop {
                    match events.recv().await {
                        Ok(ev) if ev == wanted => break,
                        Ok(_) => continue,
                        // Missed events: requery to catch up.
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });

        Subscription { rx }
    }

    /// Copy the selected personal sources into a team thread's document
    /// sub-collection, stamping each copy with a back-reference to its
    /// original. Returns the number of copies made.
    pub async fn inherit_into_thread(
        &self,
        uid: &str,
        source_ids: &[String],
        thread_id: &str,
    ) -> Result<usize> {
        let mut copied = 0usize;
        for source_id in source_ids {
            let row = sqlx::query(
                "SELECT * FROM sources WHERE id = ? AND owner_uid = ? AND thread_id IS NULL",
            )
            .bind(source_id)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                tracing::warn!(%source_id, "inherit skipped: personal source not found");
                continue;
            };
            let original = row_to_source(&row);

            let copy = Source {
                id: Uuid::new_v4().to_string(),
                inherited_from: Some(original.id.clone()),
                created_at: now_ms(),
                ..original
            };
            insert_source(&self.pool, uid, Some(thread_id), &copy).await?;
            copied += 1;
        }

        if copied > 0 {
            self.bus.notify(ChangeEvent::ThreadSources {
                thread_id: thread_id.to_string(),
            });
        }
        Ok(copied)
    }

    /// Delete a source from the scope.
    ///
    /// The underlying blob is removed only when the source has a storage
    /// path AND (the scope is personal, OR the team copy is not
    /// inherited) — an inherited copy never deletes the original owner's
    /// blob. Blob delete failures are logged, never surfaced.
    ///
    /// Callers collect explicit user confirmation before invoking this.
    pub async fn delete_source(&self, ctx: &ScopeContext, id: &str) -> Result<()> {
        let Some(source) = self.get_source(ctx, id).await? else {
            tracing::warn!(id, "delete skipped: source not found in scope");
            return Ok(());
        };

        sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        let owns_blob = match ctx {
            ScopeContext::Personal { .. } => true,
            ScopeContext::TeamThread { .. } => source.inherited_from.is_none(),
        };
        if owns_blob {
            if let Some(path) = &source.storage_path {
                if let Err(e) = self.blobs.delete(path).await {
                    tracing::warn!(%path, error = %e, "blob delete failed");
                }
            }
        }

        self.bus.notify(ctx.event());
        Ok(())
    }

    // ============ Teams ============

    /// Create a team within a company. The creator must already be a
    /// member of the company and is implicitly a member of the team.
    pub async fn create_team(
        &self,
        company_id: &str,
        name: &str,
        created_by: &str,
        member_uids: &[String],
    ) -> Result<Team> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("team name must not be empty".to_string()));
        }

        let is_member: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM members WHERE uid = ? AND company_id = ?",
        )
        .bind(created_by)
        .bind(company_id)
        .fetch_one(&self.pool)
        .await?;
        if !is_member {
            return Err(Error::Authorization(format!(
                "{} is not a member of company {}",
                created_by, company_id
            )));
        }

        let team = Team {
            id: Uuid::new_v4().to_string(),
            company_id: company_id.to_string(),
            name: name.to_string(),
            created_by: created_by.to_string(),
            member_uids: member_uids.to_vec(),
        };

        sqlx::query(
            "INSERT INTO teams (id, company_id, name, created_by, member_uids) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&team.id)
        .bind(&team.company_id)
        .bind(&team.name)
        .bind(&team.created_by)
        .bind(serde_json::to_string(&team.member_uids).unwrap_or_else(|_| "[]".to_string()))
        .execute(&self.pool)
        .await?;

        self.bus.notify(ChangeEvent::Teams {
            company_id: company_id.to_string(),
        });
        Ok(team)
    }

    /// Live query over a company's members.
    pub fn watch_members(&self, company_id: String) -> Subscription<Vec<Member>> {
        let pool = self.pool.clone();
        let mut events = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                match crate::bootstrap::list_members(&pool, &company_id).await {
                    Ok(snapshot) => {
                        if tx.send(snapshot).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "member watch query failed"),
                }
                loop {
                    match events.recv().await {
                        Ok(ChangeEvent::Members { company_id: c }) if c == company_id => break,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });

        Subscription::new(rx)
    }

    /// Teams of a company visible to `uid` (membership gate).
    pub async fn teams_for_member(&self, company_id: &str, uid: &str) -> Result<Vec<Team>> {
        let teams = query_teams(&self.pool, company_id).await?;
        Ok(teams.into_iter().filter(|t| t.has_member(uid)).collect())
    }

    /// Live query over a member's visible teams.
    pub fn watch_teams(&self, company_id: String, uid: String) -> Subscription<Vec<Team>> {
        let pool = self.pool.clone();
        let mut events = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                match query_teams(&pool, &company_id).await {
                    Ok(teams) => {
                        let visible: Vec<Team> =
                            teams.into_iter().filter(|t| t.has_member(&uid)).collect();
                        if tx.send(visible).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "team watch query failed"),
                }
                loop {
                    match events.recv().await {
                        Ok(ChangeEvent::Teams { company_id: c }) if c == company_id => break,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });

        Subscription { rx }
    }
}

// ============ Row mapping & shared queries ============

async fn insert_source(
    pool: &SqlitePool,
    owner_uid: &str,
    thread_id: Option<&str>,
    source: &Source,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sources (id, owner_uid, thread_id, name, text, summary, pricing_plans,
                             storage_path, source_type, inherited_from, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&source.id)
    .bind(owner_uid)
    .bind(thread_id)
    .bind(&source.name)
    .bind(&source.text)
    .bind(&source.summary)
    .bind(serde_json::to_string(&source.pricing_plans).unwrap_or_else(|_| "[]".to_string()))
    .bind(&source.storage_path)
    .bind(source.source_type.as_str())
    .bind(&source.inherited_from)
    .bind(source.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

async fn query_sources(
    pool: &SqlitePool,
    limits: &KnowledgeConfig,
    ctx: &ScopeContext,
) -> Result<Vec<Source>> {
    let rows = match ctx {
        ScopeContext::Personal { uid } => {
            sqlx::query(
                r#"
                SELECT * FROM sources
                WHERE owner_uid = ? AND thread_id IS NULL
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?
                "#,
            )
            .bind(uid)
            .bind(limits.personal_limit)
            .fetch_all(pool)
            .await?
        }
        ScopeContext::TeamThread { thread_id, .. } => {
            sqlx::query(
                r#"
                SELECT * FROM sources
                WHERE thread_id = ?
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?
                "#,
            )
            .bind(thread_id)
            .bind(limits.team_limit)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows.iter().map(row_to_source).collect())
}

async fn query_teams(pool: &SqlitePool, company_id: &str) -> Result<Vec<Team>> {
    let rows = sqlx::query("SELECT * FROM teams WHERE company_id = ? ORDER BY name")
        .bind(company_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_team).collect())
}

fn row_to_source(row: &SqliteRow) -> Source {
    let plans_json: String = row.get("pricing_plans");
    let source_type: String = row.get("source_type");
    Source {
        id: row.get("id"),
        name: row.get("name"),
        text: row.get("text"),
        summary: row.get("summary"),
        pricing_plans: serde_json::from_str(&plans_json).unwrap_or_default(),
        storage_path: row.get("storage_path"),
        source_type: SourceType::from_str_lossy(&source_type),
        inherited_from: row.get("inherited_from"),
        created_at: row.get("created_at"),
    }
}

fn row_to_team(row: &SqliteRow) -> Team {
    let uids_json: String = row.get("member_uids");
    Team {
        id: row.get("id"),
        company_id: row.get("company_id"),
        name: row.get("name"),
        created_by: row.get("created_by"),
        member_uids: serde_json::from_str(&uids_json).unwrap_or_default(),
    }
}
