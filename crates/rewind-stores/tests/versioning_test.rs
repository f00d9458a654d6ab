//! End-to-end tests: ledger, ancestry, handles and both SQLite backends.

use std::sync::Arc;

use async_trait::async_trait;
use rewind_core::{
    field, Embedder, FieldType, ModelHandle, Payload, RecordStoreProvider, Rewind, RewindConfig,
    RewindError, RewindResult, SchemaDescriptor, TurnStatus,
};
use rewind_stores::{RecordStoreConfig, RecordStoreFactory};
use serde_json::{json, Value};

fn payload(value: Value) -> Payload {
    value.as_object().cloned().unwrap()
}

fn users_schema() -> SchemaDescriptor {
    SchemaDescriptor::builder("users")
        .key("id", FieldType::Text)
        .field("name", FieldType::Text)
        .indexed("age", FieldType::Integer)
        .build()
        .unwrap()
}

fn documents_schema() -> SchemaDescriptor {
    SchemaDescriptor::builder("documents")
        .key("id", FieldType::Text)
        .field("title", FieldType::Text)
        .vector("embedding", 3)
        .build()
        .unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn open() -> Rewind {
    init_tracing();
    Rewind::open(RewindConfig::in_memory(RecordStoreProvider::Sqlite))
        .await
        .unwrap()
}

async fn register(
    rewind: &Rewind,
    provider: RecordStoreProvider,
    schema: SchemaDescriptor,
) -> ModelHandle {
    let store =
        RecordStoreFactory::create(&RecordStoreConfig::in_memory(provider), schema).unwrap();
    rewind.register(store).await.unwrap()
}

const PROVIDERS: [RecordStoreProvider; 2] =
    [RecordStoreProvider::Sqlite, RecordStoreProvider::SqliteVec];

/// Root R and fork C: a commit on R after the fork point stays invisible from C.
#[tokio::test]
async fn test_fork_keeps_parent_history_at_fork_point() {
    for provider in PROVIDERS {
        let rewind = open().await;
        let users = register(&rewind, provider, users_schema()).await;
        let ledger = rewind.ledger();
        let root = rewind.main_branch_id().await;

        let turn = ledger.open_turn(root, None).await.unwrap();
        users
            .save_in_turn(turn.id, payload(json!({"id": "u1", "name": "John"})))
            .await
            .unwrap();
        ledger.commit_turn(turn.id).await.unwrap();
        assert_eq!(
            users.get("u1", Some(root), None).await.unwrap(),
            Some(payload(json!({"id": "u1", "name": "John"})))
        );

        let child = ledger.create_branch(Some(root), Some(0)).await.unwrap();

        let turn = ledger.open_turn(root, None).await.unwrap();
        users
            .save_in_turn(turn.id, payload(json!({"id": "u1", "name": "Jane"})))
            .await
            .unwrap();
        ledger.commit_turn(turn.id).await.unwrap();

        let on_child = users.get("u1", Some(child.id), None).await.unwrap().unwrap();
        let on_root = users.get("u1", Some(root), None).await.unwrap().unwrap();
        assert_eq!(on_child["name"], json!("John"), "{:?}", provider);
        assert_eq!(on_root["name"], json!("Jane"), "{:?}", provider);
    }
}

#[tokio::test]
async fn test_fork_writes_shadow_parent() {
    let rewind = open().await;
    let users = register(&rewind, RecordStoreProvider::Sqlite, users_schema()).await;
    let root = rewind.main_branch_id().await;

    users
        .save(payload(json!({"id": "u1", "name": "John", "age": 30})), None)
        .await
        .unwrap();
    users
        .save(payload(json!({"id": "u2", "name": "Mary", "age": 41})), None)
        .await
        .unwrap();

    let fork = rewind.fork(Some("what-if".into())).await.unwrap();
    users
        .save(payload(json!({"id": "u1", "name": "John", "age": 60})), None)
        .await
        .unwrap();
    // Added on the parent after the fork: never seen from the fork.
    users
        .save(payload(json!({"id": "u3", "name": "Ann", "age": 50})), Some(root))
        .await
        .unwrap();

    let on_fork = users.query(Some(fork.id)).fetch().await.unwrap();
    let ages: Vec<(&str, i64)> = on_fork
        .iter()
        .map(|p| (p["id"].as_str().unwrap(), p["age"].as_i64().unwrap()))
        .collect();
    assert_eq!(ages, vec![("u1", 60), ("u2", 41)]);

    let on_root = users.query(Some(root)).fetch().await.unwrap();
    assert_eq!(on_root.len(), 3);
    assert_eq!(on_root[0]["age"], json!(30));
}

#[tokio::test]
async fn test_save_then_get_round_trips() {
    for provider in PROVIDERS {
        let rewind = open().await;
        let documents = register(&rewind, provider, documents_schema()).await;

        let original = payload(json!({
            "id": "d1",
            "title": "Notes",
            "embedding": [0.25, 0.5, 1.0],
            "extra": {"tags": ["a", "b"], "draft": false}
        }));
        let saved = documents.save(original.clone(), None).await.unwrap();
        assert_eq!(saved.logical_key, "d1");
        assert_eq!(saved.branch_id, rewind.main_branch_id().await);

        let fetched = documents.get("d1", None, None).await.unwrap();
        assert_eq!(fetched, Some(original));

        let turn = rewind.ledger().require_turn(saved.turn_id).await.unwrap();
        assert_eq!(turn.status, TurnStatus::Committed);
    }
}

#[tokio::test]
async fn test_saves_join_open_turn_until_commit() {
    let rewind = open().await;
    let users = register(&rewind, RecordStoreProvider::Sqlite, users_schema()).await;

    let turn = rewind.begin(Some("batch".into())).await.unwrap();
    let a = users
        .save(payload(json!({"id": "u1", "name": "John"})), None)
        .await
        .unwrap();
    let b = users
        .save(payload(json!({"id": "u2", "name": "Jane"})), None)
        .await
        .unwrap();
    assert_eq!(a.turn_id, turn.id);
    assert_eq!(b.turn_id, turn.id);

    // Staged data is never observable.
    assert_eq!(users.get("u1", None, None).await.unwrap(), None);
    assert!(users.query(None).fetch().await.unwrap().is_empty());

    let (committed, next) = rewind.commit(None).await.unwrap();
    assert_eq!(committed.message.as_deref(), Some("batch"));
    assert_eq!(next.index, committed.index + 1);
    assert_eq!(users.query(None).fetch().await.unwrap().len(), 2);

    // Same key twice in one turn.
    users
        .save(payload(json!({"id": "u1", "name": "Johnny"})), None)
        .await
        .unwrap();
    let err = users
        .save(payload(json!({"id": "u1", "name": "Jon"})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RewindError::DuplicateLogicalKeyInTurn { .. }));
}

#[tokio::test]
async fn test_revert_discards_and_is_not_repeatable() {
    let rewind = open().await;
    let users = register(&rewind, RecordStoreProvider::Sqlite, users_schema()).await;
    users
        .save(payload(json!({"id": "u1", "name": "John"})), None)
        .await
        .unwrap();

    let turn = rewind.begin(None).await.unwrap();
    users
        .save(payload(json!({"id": "u1", "name": "Mallory"})), None)
        .await
        .unwrap();
    let reverted = rewind.revert(None).await.unwrap();
    assert_eq!(reverted.status, TurnStatus::Reverted);

    let current = users.get("u1", None, None).await.unwrap().unwrap();
    assert_eq!(current["name"], json!("John"));

    let err = rewind.ledger().revert_turn(turn.id).await.unwrap_err();
    assert!(matches!(err, RewindError::InvalidTurnState { .. }));

    // The reverted index stays consumed.
    let saved = users
        .save(payload(json!({"id": "u2", "name": "Jane"})), None)
        .await
        .unwrap();
    let next = rewind.ledger().require_turn(saved.turn_id).await.unwrap();
    assert_eq!(next.index, turn.index + 1);

    let err = users
        .save_in_turn(turn.id, payload(json!({"id": "u3"})))
        .await
        .unwrap_err();
    assert!(matches!(err, RewindError::InvalidTurnState { .. }));
}

async fn older_than_25(users: &ModelHandle) -> Vec<Payload> {
    users
        .query(None)
        .filter(field("age").gt(25))
        .limit(2)
        .fetch()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_filtered_limit_is_stable() {
    for provider in PROVIDERS {
        let rewind = open().await;
        let users = register(&rewind, provider, users_schema()).await;
        for (id, age) in [("u5", 40), ("u1", 30), ("u4", 20), ("u3", 26), ("u2", 25)] {
            users
                .save(payload(json!({"id": id, "age": age})), None)
                .await
                .unwrap();
        }

        let first = older_than_25(&users).await;
        let ids: Vec<&str> = first.iter().map(|p| p["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["u1", "u3"], "{:?}", provider);
        assert_eq!(older_than_25(&users).await, first);

        let page = users
            .query(None)
            .filter(field("age").gt(25))
            .order_by("age", false)
            .offset(1)
            .fetch()
            .await
            .unwrap();
        let ids: Vec<&str> = page.iter().map(|p| p["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["u1", "u3"], "{:?}", provider);
    }
}

#[tokio::test]
async fn test_delete_hides_key_from_then_on() {
    let rewind = open().await;
    let users = register(&rewind, RecordStoreProvider::Sqlite, users_schema()).await;
    let saved = users
        .save(payload(json!({"id": "u1", "name": "John"})), None)
        .await
        .unwrap();
    let index = rewind.ledger().require_turn(saved.turn_id).await.unwrap().index;

    let fork = rewind.ledger().fork_from_turn(saved.turn_id, None).await.unwrap();
    assert_eq!(fork.name, format!("branch_from_{}", saved.turn_id));

    users.delete("u1", None).await.unwrap();
    assert_eq!(users.get("u1", None, None).await.unwrap(), None);
    assert!(users.query(None).fetch().await.unwrap().is_empty());

    // History and forks taken earlier still see it.
    assert!(users.get("u1", None, Some(index)).await.unwrap().is_some());
    assert!(users.get("u1", Some(fork.id), None).await.unwrap().is_some());
    assert_eq!(users.record_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_detached_repo_reads_history_and_refuses_writes() {
    let rewind = open().await;
    let users = register(&rewind, RecordStoreProvider::Sqlite, users_schema()).await;
    let first = users
        .save(payload(json!({"id": "u1", "name": "John"})), None)
        .await
        .unwrap();
    users
        .save(payload(json!({"id": "u1", "name": "Jane"})), None)
        .await
        .unwrap();

    let main = rewind.main_branch_id().await;
    let repo = rewind.checkout(main, Some(first.turn_id)).await.unwrap();
    assert!(repo.is_detached());

    let seen = users.get("u1", None, None).await.unwrap().unwrap();
    assert_eq!(seen["name"], json!("John"));

    let err = users
        .save(payload(json!({"id": "u2"})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RewindError::DetachedRepo { .. }));

    // Forking from a detached cursor branches at the checked-out turn.
    let fork = rewind.fork(None).await.unwrap();
    users
        .save(payload(json!({"id": "u2", "name": "Ann"})), None)
        .await
        .unwrap();
    let names: Vec<Value> = users
        .query(Some(fork.id))
        .fetch()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p["name"].clone())
        .collect();
    assert_eq!(names, vec![json!("John"), json!("Ann")]);
}

#[tokio::test]
async fn test_concurrent_saves_each_get_a_turn() {
    let rewind = open().await;
    let users = register(&rewind, RecordStoreProvider::Sqlite, users_schema()).await;

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let users = users.clone();
            tokio::spawn(async move {
                users
                    .save(payload(json!({"id": format!("u{}", i), "age": i})), None)
                    .await
            })
        })
        .collect();
    let mut turns = Vec::new();
    for task in tasks {
        turns.push(task.await.unwrap().unwrap().turn_id);
    }
    turns.sort();
    turns.dedup();
    assert_eq!(turns.len(), 8);

    let main = rewind.ledger().require_branch(rewind.main_branch_id().await).await.unwrap();
    assert_eq!(main.turn_counter, 8);
    assert_eq!(users.query(None).fetch().await.unwrap().len(), 8);
}

#[tokio::test]
async fn test_similarity_needs_vector_backend() {
    let rewind = open().await;
    let relational = register(&rewind, RecordStoreProvider::Sqlite, documents_schema()).await;
    relational
        .save(payload(json!({"id": "d1", "embedding": [1.0, 0.0, 0.0]})), None)
        .await
        .unwrap();

    let err = relational
        .query(None)
        .filter(field("embedding").similar_to(vec![1.0, 0.0, 0.0]))
        .fetch()
        .await
        .unwrap_err();
    assert!(matches!(err, RewindError::UnsupportedPredicate { .. }));

    let err = relational
        .query(None)
        .filter(field("missing").eq(1))
        .fetch()
        .await
        .unwrap_err();
    assert!(matches!(err, RewindError::UnknownField { .. }));
}

/// Embeds text as the counts of the letters a, b and c.
struct LetterEmbedder;

#[async_trait]
impl Embedder for LetterEmbedder {
    async fn embed(&self, text: &str) -> RewindResult<Vec<f32>> {
        Ok(['a', 'b', 'c']
            .iter()
            .map(|l| text.chars().filter(|c| c == l).count() as f32)
            .collect())
    }
}

#[tokio::test]
async fn test_text_similarity_through_embedder() {
    let rewind = open().await.with_embedder(Arc::new(LetterEmbedder));
    let documents = register(&rewind, RecordStoreProvider::SqliteVec, documents_schema()).await;
    for (id, embedding) in [
        ("mostly-a", [1.0, 0.1, 0.0]),
        ("mostly-b", [0.0, 1.0, 0.1]),
        ("mostly-c", [0.1, 0.0, 1.0]),
    ] {
        documents
            .save(payload(json!({"id": id, "embedding": embedding})), None)
            .await
            .unwrap();
    }

    let records = documents
        .query(None)
        .filter(field("embedding").similar_to_text("bbb"))
        .limit(1)
        .fetch_records()
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].logical_key, "mostly-b");
    assert!(records[0].score.unwrap() > 0.9);
}

#[tokio::test]
async fn test_model_lookup_and_namespaces() {
    let rewind = open().await;
    register(&rewind, RecordStoreProvider::Sqlite, users_schema()).await;
    register(&rewind, RecordStoreProvider::SqliteVec, documents_schema()).await;

    assert_eq!(rewind.namespaces().names(), vec!["documents", "users"]);
    let users = rewind.model("users").unwrap();
    users
        .save(payload(json!({"id": "u1"})), None)
        .await
        .unwrap();

    let counts = rewind.namespaces().record_counts().await.unwrap();
    assert_eq!(
        counts,
        vec![("documents".to_string(), 0), ("users".to_string(), 1)]
    );

    rewind.namespaces().drop_namespace("users").await.unwrap();
    assert!(matches!(
        rewind.model("users"),
        Err(RewindError::NamespaceNotFound { .. })
    ));
}
