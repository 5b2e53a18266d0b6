//! Ingestion orchestration: extract → analyze → blob upload → source row.
//!
//! [`Pipeline`] wires the store, thread manager, blob store, and model
//! client together and is the entry point the CLI and server use. Every
//! ingest is a write action, so it ensures an active thread first and
//! bumps the thread's `updated_at` when the source lands.

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::analyze;
use crate::blob::{personal_document_path, team_document_path, BlobStore, UploadProgress};
use crate::config::{KnowledgeConfig, ModelConfig};
use crate::error::Result;
use crate::extract::{self, Extracted};
use crate::models::{now_ms, Message, Scope, Source, SourceType};
use crate::store::{ChangeBus, KnowledgeStore, ScopeContext, SourceDraft};
use crate::threads::{ChatThreads, Session};

pub struct Pipeline {
    pub store: KnowledgeStore,
    pub threads: ChatThreads,
    blobs: Arc<dyn BlobStore>,
    model: ModelConfig,
    client: reqwest::Client,
}

impl Pipeline {
    pub fn new(
        pool: SqlitePool,
        blobs: Arc<dyn BlobStore>,
        model: ModelConfig,
        knowledge: KnowledgeConfig,
        client: reqwest::Client,
    ) -> Self {
        let bus = ChangeBus::new();
        Self {
            store: KnowledgeStore::new(pool.clone(), blobs.clone(), bus.clone(), knowledge),
            threads: ChatThreads::new(pool, bus),
            blobs,
            model,
            client,
        }
    }

    /// Ingest an uploaded PDF. The decoded bytes are also stored as a
    /// blob under the scope's path convention, with upload progress.
    pub async fn ingest_pdf(
        &self,
        session: &mut Session,
        file_name: &str,
        bytes: &[u8],
        progress: &dyn UploadProgress,
    ) -> Result<Source> {
        let extracted = extract::extract_pdf(file_name, bytes)?;
        self.finish(session, extracted, SourceType::Pdf, Some((file_name, bytes)), progress)
            .await
    }

    /// Ingest an uploaded or pasted text document. No blob is stored.
    pub async fn ingest_text(
        &self,
        session: &mut Session,
        file_name: &str,
        mime: &str,
        content: &str,
    ) -> Result<Source> {
        let extracted = extract::extract_text_file(file_name, mime, content)?;
        self.finish(session, extracted, SourceType::Text, None, &crate::blob::NoProgress)
            .await
    }

    /// Ingest a web page by URL. No blob is stored.
    pub async fn ingest_url(&self, session: &mut Session, url: &str) -> Result<Source> {
        let extracted = extract::extract_url(&self.client, url).await?;
        self.finish(session, extracted, SourceType::Url, None, &crate::blob::NoProgress)
            .await
    }

    /// Ask a question in the session's active scope.
    pub async fn ask(
        &self,
        session: &mut Session,
        question: &str,
        selected_source_id: Option<&str>,
    ) -> Result<Message> {
        self.threads
            .ask(
                session,
                &self.store,
                &self.model,
                &self.client,
                question,
                selected_source_id,
            )
            .await
    }

    async fn finish(
        &self,
        session: &mut Session,
        extracted: Extracted,
        source_type: SourceType,
        blob: Option<(&str, &[u8])>,
        progress: &dyn UploadProgress,
    ) -> Result<Source> {
        let thread_id = self.threads.ensure_active_thread(session).await?;

        let analysis =
            analyze::analyze(&self.model, &self.client, &extracted.title, &extracted.text).await;

        let storage_path = match blob {
            Some((file_name, bytes)) => {
                let ts = now_ms();
                let path = match &session.scope {
                    Scope::Personal => personal_document_path(&session.uid, file_name, ts),
                    Scope::Team { .. } => {
                        team_document_path(&session.uid, &thread_id, file_name, ts)
                    }
                };
                self.blobs.put(&path, bytes, progress).await?;
                Some(path)
            }
            None => None,
        };

        // No compensating delete if the row insert fails after a
        // successful upload; the orphaned blob is an accepted gap.
        let ctx = ScopeContext::for_scope(&session.uid, &session.scope, &thread_id);
        let source = self
            .store
            .create_source(
                &ctx,
                SourceDraft {
                    name: extracted.title,
                    text: extracted.text,
                    summary: Some(analysis.summary),
                    pricing_plans: analysis.plans,
                    storage_path,
                    source_type,
                },
            )
            .await?;

        self.threads.touch_thread(&thread_id).await?;
        Ok(source)
    }
}
