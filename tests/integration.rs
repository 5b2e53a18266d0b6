//! End-to-end tests over the library API: ingestion with fallback
//! analysis, scoped answering, team inheritance, blob ownership on
//! delete, live queries, and organization bootstrap.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use kachat::blob::{BlobStore, LocalBlobStore, NoProgress};
use kachat::bootstrap::{add_member, bootstrap_org, OrgBootstrap};
use kachat::config::{BlobConfig, Config, DbConfig, KnowledgeConfig, ModelConfig, ServerConfig};
use kachat::error::Error;
use kachat::ingest::Pipeline;
use kachat::models::{Scope, Sender, SourceType};
use kachat::store::{ScopeContext, SourceDraft};
use kachat::threads::Session;
use kachat::{db, migrate};

struct TestEnv {
    _tmp: TempDir,
    pipeline: Pipeline,
    blobs: Arc<LocalBlobStore>,
    pool: sqlx::SqlitePool,
}

async fn setup() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let config = Config {
        db: DbConfig {
            path: tmp.path().join("data/kachat.sqlite"),
        },
        blob: BlobConfig {
            root: tmp.path().join("blobs"),
        },
        model: ModelConfig::default(),
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
        knowledge: KnowledgeConfig::default(),
    };

    let pool = db::connect(&config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();

    let blobs = Arc::new(LocalBlobStore::new(config.blob.root.clone()));
    let client = reqwest::Client::new();
    let pipeline = Pipeline::new(
        pool.clone(),
        blobs.clone(),
        config.model.clone(),
        config.knowledge.clone(),
        client,
    );

    TestEnv {
        _tmp: tmp,
        pipeline,
        blobs,
        pool,
    }
}

// ============ Ingestion & fallback analysis ============

#[tokio::test]
async fn ingest_text_without_credential_uses_fallback_analysis() {
    let env = setup().await;
    let mut session = Session::new("alice");

    let source = env
        .pipeline
        .ingest_text(
            &mut session,
            "plans.txt",
            "text/plain",
            "プランA 3,000円/月 プランB 5,000円/月",
        )
        .await
        .unwrap();

    assert_eq!(source.source_type, SourceType::Text);
    assert_eq!(source.pricing_plans.len(), 2);
    assert_eq!(source.pricing_plans[0].name, "プランA");
    assert_eq!(source.pricing_plans[0].price_monthly_yen, Some(3000));
    assert_eq!(source.pricing_plans[1].name, "プランB");
    assert_eq!(source.pricing_plans[1].price_monthly_yen, Some(5000));
    assert!(source.summary.as_deref().unwrap().starts_with("プランA"));

    // The write action lazily created a thread.
    assert!(session.active_thread.is_some());
}

#[tokio::test]
async fn ingest_rejects_unsupported_file_type() {
    let env = setup().await;
    let mut session = Session::new("alice");
    let err = env
        .pipeline
        .ingest_text(&mut session, "app.exe", "application/octet-stream", "x")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn ingest_url_rejects_private_host_before_fetch() {
    let env = setup().await;
    let mut session = Session::new("alice");
    let err = env
        .pipeline
        .ingest_url(&mut session, "http://10.0.0.5/page")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Fetch(_)));
    assert!(err.to_string().contains("not allowed"));
}

// ============ PDF path ============

/// Minimal valid single-page PDF containing `phrase`, built with correct
/// xref byte offsets so the decoder can parse it.
fn minimal_pdf(phrase: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET\n", phrase);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(
        format!(
            "4 0 obj << /Length {} >> stream\n{}endstream endobj\n",
            content.len(),
            content
        )
        .as_bytes(),
    );
    let o5 = out.len();
    out.extend_from_slice(
        b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

#[tokio::test]
async fn ingest_pdf_stores_blob_and_extracted_text() {
    let env = setup().await;
    let mut session = Session::new("alice");

    let pdf = minimal_pdf("quarterly report contents");
    let source = env
        .pipeline
        .ingest_pdf(&mut session, "report.pdf", &pdf, &NoProgress)
        .await
        .unwrap();

    assert_eq!(source.source_type, SourceType::Pdf);
    assert!(source.text.contains("quarterly report contents"));

    let path = source.storage_path.as_deref().expect("pdf must have a blob");
    assert!(path.starts_with("users/alice/documents/"));
    let addr = env.blobs.address_for_read(path).await.unwrap();
    assert_eq!(std::fs::read(addr).unwrap(), pdf);
}

#[tokio::test]
async fn ingest_invalid_pdf_writes_nothing() {
    let env = setup().await;
    let mut session = Session::new("alice");

    let err = env
        .pipeline
        .ingest_pdf(&mut session, "bad.pdf", b"not a pdf", &NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Extraction(_)));

    let ctx = ScopeContext::Personal {
        uid: "alice".to_string(),
    };
    assert!(env.pipeline.store.list_sources(&ctx).await.unwrap().is_empty());
}

// ============ Asking ============

#[tokio::test]
async fn ask_price_question_prefers_structured_plans() {
    let env = setup().await;
    let mut session = Session::new("alice");

    env.pipeline
        .ingest_text(
            &mut session,
            "plans.txt",
            "text/plain",
            "プランA 3,000円/月 プランB 5,000円/月",
        )
        .await
        .unwrap();

    let reply = env
        .pipeline
        .ask(&mut session, "このサービスの料金は?", None)
        .await
        .unwrap();

    assert_eq!(reply.sender, Sender::Assistant);
    assert!(reply.text.starts_with("料金情報:"), "got: {}", reply.text);
    assert!(reply.text.contains("プランA: 3,000円/月"));
    assert!(reply.text.contains("プランB: 5,000円/月"));

    // The thread holds the user question then the assistant reply.
    let thread_id = session.active_thread.clone().unwrap();
    let messages = env.pipeline.threads.list_messages(&thread_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].sender, Sender::User);
    assert_eq!(messages[1].sender, Sender::Assistant);
    assert!(messages[0].created_at <= messages[1].created_at);
}

#[tokio::test]
async fn ask_with_no_sources_returns_fixed_message() {
    let env = setup().await;
    let mut session = Session::new("nobody");
    let reply = env.pipeline.ask(&mut session, "何でもいいので", None).await.unwrap();
    assert_eq!(reply.text, kachat::answer::MSG_NO_SOURCES);
}

#[tokio::test]
async fn concurrent_asks_on_one_thread_never_interleave() {
    let env = setup().await;
    let mut session = Session::new("alice");
    env.pipeline
        .ingest_text(&mut session, "notes.txt", "text/plain", "rust deployment notes")
        .await
        .unwrap();

    let pipeline = Arc::new(env.pipeline);
    let s1 = session.clone();
    let s2 = session.clone();
    let p1 = pipeline.clone();
    let p2 = pipeline.clone();

    let (a, b) = tokio::join!(
        tokio::spawn(async move {
            let mut s = s1;
            p1.ask(&mut s, "first question about rust", None).await
        }),
        tokio::spawn(async move {
            let mut s = s2;
            p2.ask(&mut s, "second question about deployment", None).await
        }),
    );
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    let thread_id = session.active_thread.unwrap();
    let messages = pipeline.threads.list_messages(&thread_id).await.unwrap();
    assert_eq!(messages.len(), 4);
    // Serialized asks produce strict user/assistant alternation.
    for pair in messages.chunks(2) {
        assert_eq!(pair[0].sender, Sender::User);
        assert_eq!(pair[1].sender, Sender::Assistant);
    }
}

// ============ Threads & scope switching ============

#[tokio::test]
async fn new_chat_always_creates_a_fresh_thread() {
    let env = setup().await;
    let mut session = Session::new("alice");

    let first = env
        .pipeline
        .threads
        .ensure_active_thread(&mut session)
        .await
        .unwrap();
    let second = env
        .pipeline
        .threads
        .new_chat(&mut session, &env.pipeline.store, &[])
        .await
        .unwrap();
    assert_ne!(first, second.id);
    assert_eq!(session.active_thread.as_deref(), Some(second.id.as_str()));

    // Lazy rule: with a selection present, ensure returns it unchanged.
    let third = env
        .pipeline
        .threads
        .ensure_active_thread(&mut session)
        .await
        .unwrap();
    assert_eq!(third, second.id);
}

// ============ Team inheritance & blob ownership ============

#[tokio::test]
async fn inheritance_copies_snapshot_and_never_deletes_original_blob() {
    let env = setup().await;
    let uid = "alice";
    let personal = ScopeContext::Personal {
        uid: uid.to_string(),
    };

    // A personal source backed by a blob.
    let blob_path = "users/alice/documents/1-manual.pdf";
    env.blobs.put(blob_path, b"pdf bytes", &NoProgress).await.unwrap();
    let original = env
        .pipeline
        .store
        .create_source(
            &personal,
            SourceDraft {
                name: "manual.pdf".to_string(),
                text: "導入マニュアル".to_string(),
                summary: Some("summary".to_string()),
                pricing_plans: vec![],
                storage_path: Some(blob_path.to_string()),
                source_type: SourceType::Pdf,
            },
        )
        .await
        .unwrap();

    // New team chat inheriting the personal source.
    let mut session = Session::new(uid);
    session.switch_scope(Scope::Team {
        team_id: "t1".to_string(),
        team_name: "dev".to_string(),
    });
    let thread = env
        .pipeline
        .threads
        .new_chat(&mut session, &env.pipeline.store, &[original.id.clone()])
        .await
        .unwrap();

    let team_ctx = ScopeContext::TeamThread {
        uid: uid.to_string(),
        thread_id: thread.id.clone(),
    };
    let copies = env.pipeline.store.list_sources(&team_ctx).await.unwrap();
    assert_eq!(copies.len(), 1);
    let copy = &copies[0];
    assert_eq!(copy.inherited_from.as_deref(), Some(original.id.as_str()));
    assert_ne!(copy.id, original.id);
    assert_eq!(copy.name, original.name);
    assert_eq!(copy.text, original.text);
    assert_eq!(copy.summary, original.summary);
    assert_eq!(copy.storage_path, original.storage_path);

    // Deleting the inherited copy must not delete the owner's blob.
    env.pipeline
        .store
        .delete_source(&team_ctx, &copy.id)
        .await
        .unwrap();
    assert!(env.blobs.address_for_read(blob_path).await.is_ok());
    assert!(env.pipeline.store.list_sources(&team_ctx).await.unwrap().is_empty());

    // Deleting the original personal source does delete the blob.
    env.pipeline
        .store
        .delete_source(&personal, &original.id)
        .await
        .unwrap();
    assert!(env.blobs.address_for_read(blob_path).await.is_err());
}

#[tokio::test]
async fn deleting_the_original_does_not_propagate_to_the_copy() {
    let env = setup().await;
    let uid = "alice";
    let personal = ScopeContext::Personal {
        uid: uid.to_string(),
    };
    let original = env
        .pipeline
        .store
        .create_source(
            &personal,
            SourceDraft {
                name: "notes.txt".to_string(),
                text: "共有メモ".to_string(),
                summary: None,
                pricing_plans: vec![],
                storage_path: None,
                source_type: SourceType::Text,
            },
        )
        .await
        .unwrap();

    let mut session = Session::new(uid);
    session.switch_scope(Scope::Team {
        team_id: "t1".to_string(),
        team_name: "dev".to_string(),
    });
    let thread = env
        .pipeline
        .threads
        .new_chat(&mut session, &env.pipeline.store, &[original.id.clone()])
        .await
        .unwrap();

    env.pipeline
        .store
        .delete_source(&personal, &original.id)
        .await
        .unwrap();

    let team_ctx = ScopeContext::TeamThread {
        uid: uid.to_string(),
        thread_id: thread.id,
    };
    let copies = env.pipeline.store.list_sources(&team_ctx).await.unwrap();
    assert_eq!(copies.len(), 1, "the copy is a snapshot, not a live link");
}

// ============ Listing caps & live queries ============

#[tokio::test]
async fn personal_listing_is_capped_and_newest_first() {
    let env = setup().await;
    let personal = ScopeContext::Personal {
        uid: "alice".to_string(),
    };
    for i in 0..25 {
        env.pipeline
            .store
            .create_source(
                &personal,
                SourceDraft {
                    name: format!("doc-{}", i),
                    text: "x".to_string(),
                    summary: None,
                    pricing_plans: vec![],
                    storage_path: None,
                    source_type: SourceType::Text,
                },
            )
            .await
            .unwrap();
    }

    let sources = env.pipeline.store.list_sources(&personal).await.unwrap();
    assert_eq!(sources.len(), 20);
    assert_eq!(sources[0].name, "doc-24");
}

#[tokio::test]
async fn watch_sources_emits_full_snapshots_on_change() {
    let env = setup().await;
    let personal = ScopeContext::Personal {
        uid: "alice".to_string(),
    };

    let mut sub = env.pipeline.store.watch_sources(personal.clone());
    let initial = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .unwrap()
        .unwrap();
    assert!(initial.is_empty());

    env.pipeline
        .store
        .create_source(
            &personal,
            SourceDraft {
                name: "doc.txt".to_string(),
                text: "hello".to_string(),
                summary: None,
                pricing_plans: vec![],
                storage_path: None,
                source_type: SourceType::Text,
            },
        )
        .await
        .unwrap();

    let updated = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].name, "doc.txt");
}

// ============ Organization bootstrap ============

#[tokio::test]
async fn bootstrap_is_idempotent_and_seat_limit_gates_signup() {
    let env = setup().await;
    let org = OrgBootstrap {
        company_id: "acme".to_string(),
        company_name: "Acme Inc".to_string(),
        seat_limit: 2,
        owner_uid: "owner1".to_string(),
        owner_email: "owner@acme.example".to_string(),
        owner_name: "Owner".to_string(),
    };

    let first = bootstrap_org(&env.pool, &org).await.unwrap();
    assert_eq!(first.seat_count, 1);

    // Re-running with the same ids updates rather than duplicates.
    let second = bootstrap_org(&env.pool, &org).await.unwrap();
    assert_eq!(second.seat_count, 1);
    assert_eq!(second.seat_limit, 2);

    let bus = env.pipeline.store.bus();
    add_member(&env.pool, bus, "acme", "bob", "bob@acme.example", "Bob")
        .await
        .unwrap();
    let err = add_member(&env.pool, bus, "acme", "carol", "carol@acme.example", "Carol")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization(_)));

    // Re-adding an existing member is a merge, not a new seat.
    add_member(&env.pool, bus, "acme", "bob", "bob@acme.example", "Robert")
        .await
        .unwrap();
}

#[tokio::test]
async fn bootstrap_rejects_bad_inputs() {
    let env = setup().await;
    let mut org = OrgBootstrap {
        company_id: "acme".to_string(),
        company_name: "Acme".to_string(),
        seat_limit: 0,
        owner_uid: "o".to_string(),
        owner_email: "o@acme.example".to_string(),
        owner_name: String::new(),
    };
    assert!(matches!(
        bootstrap_org(&env.pool, &org).await.unwrap_err(),
        Error::Validation(_)
    ));

    org.seat_limit = 5;
    org.owner_email = "not-an-email".to_string();
    assert!(matches!(
        bootstrap_org(&env.pool, &org).await.unwrap_err(),
        Error::Validation(_)
    ));
}

// ============ Teams ============

#[tokio::test]
async fn team_creation_requires_company_membership() {
    let env = setup().await;
    bootstrap_org(
        &env.pool,
        &OrgBootstrap {
            company_id: "acme".to_string(),
            company_name: "Acme".to_string(),
            seat_limit: 5,
            owner_uid: "owner1".to_string(),
            owner_email: "owner@acme.example".to_string(),
            owner_name: "Owner".to_string(),
        },
    )
    .await
    .unwrap();

    let team = env
        .pipeline
        .store
        .create_team("acme", "platform", "owner1", &["bob".to_string()])
        .await
        .unwrap();
    assert!(team.has_member("owner1"));

    let err = env
        .pipeline
        .store
        .create_team("acme", "rogue", "stranger", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization(_)));

    // Membership filters visibility; a removed team reverts the session.
    let visible = env
        .pipeline
        .store
        .teams_for_member("acme", "bob")
        .await
        .unwrap();
    assert_eq!(visible.len(), 1);
    let none = env
        .pipeline
        .store
        .teams_for_member("acme", "stranger")
        .await
        .unwrap();
    assert!(none.is_empty());

    let mut session = Session::new("bob");
    session.switch_scope(Scope::Team {
        team_id: "gone-team".to_string(),
        team_name: "old".to_string(),
    });
    session.sync_teams(&visible);
    assert_eq!(session.scope, Scope::Personal);
}
