//! Chat threads: lazy creation, scope switching, ordered messages.
//!
//! A session tracks the active scope and thread selection explicitly —
//! there is no ambient global state. The first write action in a scope
//! creates a thread if none is selected; an explicit "new chat" always
//! creates one, inheriting selected personal sources into team threads
//! before first use. Concurrent asks against one thread are serialized
//! by a per-thread in-flight guard so replies land in question order.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use crate::answer;
use crate::config::ModelConfig;
use crate::error::Result;
use crate::models::{now_ms, Message, Scope, Sender, Team, Thread};
use crate::store::{ChangeBus, ChangeEvent, KnowledgeStore, ScopeContext, Subscription};

/// Per-user conversation state: the active scope and thread selection.
#[derive(Debug, Clone)]
pub struct Session {
    pub uid: String,
    pub scope: Scope,
    pub active_thread: Option<String>,
}

impl Session {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            scope: Scope::Personal,
            active_thread: None,
        }
    }

    /// Switching the active team clears the thread selection, forcing
    /// re-selection or lazy creation under the new scope.
    pub fn switch_scope(&mut self, scope: Scope) {
        if self.scope != scope {
            self.scope = scope;
            self.active_thread = None;
        }
    }

    /// Reconcile against the user's current team list: if the selected
    /// team no longer exists, revert to the personal scope.
    pub fn sync_teams(&mut self, teams: &[Team]) {
        if let Scope::Team { team_id, .. } = &self.scope {
            if !teams.iter().any(|t| &t.id == team_id) {
                self.scope = Scope::Personal;
                self.active_thread = None;
            }
        }
    }
}

pub struct ChatThreads {
    pool: SqlitePool,
    bus: ChangeBus,
    /// One guard per thread id; asks lock it for their full duration.
    ask_guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChatThreads {
    pub fn new(pool: SqlitePool, bus: ChangeBus) -> Self {
        Self {
            pool,
            bus,
            ask_guards: Mutex::new(HashMap::new()),
        }
    }

    /// Create a thread in the session's scope and select it.
    pub async fn create_thread(&self, session: &mut Session) -> Result<Thread> {
        let now = now_ms();
        let thread = Thread {
            id: Uuid::new_v4().to_string(),
            owner_uid: session.uid.clone(),
            scope: session.scope.clone(),
            created_at: now,
            updated_at: now,
        };

        let (team_id, team_name) = match &thread.scope {
            Scope::Personal => (None, None),
            Scope::Team { team_id, team_name } => {
                (Some(team_id.as_str()), Some(team_name.as_str()))
            }
        };

        sqlx::query(
            r#"
            INSERT INTO threads (id, owner_uid, scope_type, team_id, team_name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&thread.id)
        .bind(&thread.owner_uid)
        .bind(thread.scope.type_str())
        .bind(team_id)
        .bind(team_name)
        .bind(thread.created_at)
        .bind(thread.updated_at)
        .execute(&self.pool)
        .await?;

        session.active_thread = Some(thread.id.clone());
        self.bus.notify(ChangeEvent::Threads {
            uid: session.uid.clone(),
        });
        Ok(thread)
    }

    /// Lazy creation: return the selected thread, creating one first if
    /// none is selected. Every write action goes through here.
    pub async fn ensure_active_thread(&self, session: &mut Session) -> Result<String> {
        if let Some(id) = &session.active_thread {
            return Ok(id.clone());
        }
        let thread = self.create_thread(session).await?;
        Ok(thread.id)
    }

    /// Explicit "new chat": always creates a fresh thread, bypassing the
    /// lazy rule. For team scope, the caller-selected personal sources
    /// are copied into the new thread's document collection before use.
    pub async fn new_chat(
        &self,
        session: &mut Session,
        store: &KnowledgeStore,
        inherit_ids: &[String],
    ) -> Result<Thread> {
        let thread = self.create_thread(session).await?;
        if session.scope.is_team() && !inherit_ids.is_empty() {
            store
                .inherit_into_thread(&session.uid, inherit_ids, &thread.id)
                .await?;
        }
        Ok(thread)
    }

    /// Threads for the session's scope, most recently updated first.
    pub async fn list_threads(&self, uid: &str, scope: &Scope) -> Result<Vec<Thread>> {
        query_threads(&self.pool, uid, scope).await
    }

    /// Live query over the scope's threads.
    pub fn watch_threads(&self, uid: String, scope: Scope) -> Subscription<Vec<Thread>> {
        let pool = self.pool.clone();
        let mut events = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                match query_threads(&pool, &uid, &scope).await {
                    Ok(snapshot) => {
                        if tx.send(snapshot).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "thread watch query failed"),
                }
                loop {
                    match events.recv().await {
                        Ok(ChangeEvent::Threads { uid: u }) if u == uid => break,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });

        Subscription::new(rx)
    }

    /// Append an immutable message and bump the thread's `updated_at`.
    pub async fn append_message(
        &self,
        thread_id: &str,
        sender: Sender,
        text: &str,
    ) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            sender,
            text: text.to_string(),
            created_at: now_ms(),
        };

        sqlx::query(
            "INSERT INTO messages (id, thread_id, sender, text, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.thread_id)
        .bind(message.sender.as_str())
        .bind(&message.text)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        self.touch_thread(thread_id).await?;
        self.bus.notify(ChangeEvent::Messages {
            thread_id: thread_id.to_string(),
        });
        Ok(message)
    }

    /// Bump `updated_at`, e.g. after a source is added to the thread's
    /// scope.
    pub async fn touch_thread(&self, thread_id: &str) -> Result<()> {
        let row = sqlx::query("UPDATE threads SET updated_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        if row.rows_affected() > 0 {
            if let Some(uid) =
                sqlx::query_scalar::<_, String>("SELECT owner_uid FROM threads WHERE id = ?")
                    .bind(thread_id)
                    .fetch_optional(&self.pool)
                    .await?
            {
                self.bus.notify(ChangeEvent::Threads { uid });
            }
        }
        Ok(())
    }

    /// Messages of a thread, strictly ordered by creation time ascending
    /// (enforced by the read query).
    pub async fn list_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        query_messages(&self.pool, thread_id).await
    }

    /// Live query over a thread's messages.
    pub fn watch_messages(&self, thread_id: String) -> Subscription<Vec<Message>> {
        let pool = self.pool.clone();
        let mut events = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                match query_messages(&pool, &thread_id).await {
                    Ok(snapshot) => {
                        if tx.send(snapshot).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "message watch query failed"),
                }
                loop {
                    match events.recv().await {
                        Ok(ChangeEvent::Messages { thread_id: t }) if t == thread_id => break,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });

        Subscription::new(rx)
    }

    /// Ask a question in the session's scope: write the user message,
    /// run the answer engine over the scope's sources, write the
    /// assistant reply. Asks against the same thread are serialized so a
    /// second question waits for the first reply.
    pub async fn ask(
        &self,
        session: &mut Session,
        store: &KnowledgeStore,
        model: &ModelConfig,
        client: &reqwest::Client,
        question: &str,
        selected_source_id: Option<&str>,
    ) -> Result<Message> {
        let thread_id = self.ensure_active_thread(session).await?;

        let guard = {
            let mut guards = self.ask_guards.lock().await;
            guards
                .entry(thread_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _in_flight = guard.lock().await;

        self.append_message(&thread_id, Sender::User, question)
            .await?;

        let ctx = ScopeContext::for_scope(&session.uid, &session.scope, &thread_id);
        let candidates = store.list_sources(&ctx).await?;
        let selected = match selected_source_id {
            Some(id) => candidates.iter().find(|s| s.id == id),
            None => None,
        };

        let reply = answer::answer(model, client, question, selected, &candidates).await;
        self.append_message(&thread_id, Sender::Assistant, &reply)
            .await
    }
}

// ============ Shared queries ============

async fn query_threads(pool: &SqlitePool, uid: &str, scope: &Scope) -> Result<Vec<Thread>> {
    let rows = match scope {
        Scope::Personal => {
            sqlx::query(
                r#"
                SELECT * FROM threads
                WHERE owner_uid = ? AND scope_type = 'personal'
                ORDER BY updated_at DESC, rowid DESC
                "#,
            )
            .bind(uid)
            .fetch_all(pool)
            .await?
        }
        Scope::Team { team_id, .. } => {
            sqlx::query(
                r#"
                SELECT * FROM threads
                WHERE owner_uid = ? AND scope_type = 'team' AND team_id = ?
                ORDER BY updated_at DESC, rowid DESC
                "#,
            )
            .bind(uid)
            .bind(team_id)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows.iter().map(row_to_thread).collect())
}

async fn query_messages(pool: &SqlitePool, thread_id: &str) -> Result<Vec<Message>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM messages
        WHERE thread_id = ?
        ORDER BY created_at ASC, rowid ASC
        "#,
    )
    .bind(thread_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_message).collect())
}

fn row_to_thread(row: &SqliteRow) -> Thread {
    let scope_type: String = row.get("scope_type");
    let scope = if scope_type == "team" {
        Scope::Team {
            team_id: row.get::<Option<String>, _>("team_id").unwrap_or_default(),
            team_name: row.get::<Option<String>, _>("team_name").unwrap_or_default(),
        }
    } else {
        Scope::Personal
    };
    Thread {
        id: row.get("id"),
        owner_uid: row.get("owner_uid"),
        scope,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_message(row: &SqliteRow) -> Message {
    let sender: String = row.get("sender");
    Message {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        sender: Sender::from_str_lossy(&sender),
        text: row.get("text"),
        created_at: row.get("created_at"),
    }
}
