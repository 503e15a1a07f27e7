mod common;

use common::{FakeCloud, FakeHandler, Fault, options, registry, store};
use serde_json::json;
use std::sync::Arc;
use stratum_engine::{
    ActionType, Cancellation, Declaration, EngineError, HandlerRegistry, LifecycleEvent,
    PassReport, Phase, ReplaceStrategy, ResourceHandler, ResourcePolicy, Scope, run,
};
use stratum_state::{
    FileSystemStateStore, MemoryStateStore, ResourceStatus, ScopePath, SecretCipher, StateStore,
};

fn root_path() -> ScopePath {
    ScopePath::root("shop", "dev").unwrap()
}

async fn pass(
    phase: Phase,
    store: &Arc<MemoryStateStore>,
    registry: &HandlerRegistry,
    decls: Vec<Declaration>,
) -> stratum_engine::Result<PassReport> {
    run(options(phase), store.clone(), registry.clone(), move |scope| async move {
        for decl in decls {
            scope.apply(decl).await?;
        }
        Ok(())
    })
    .await
}

#[tokio::test]
async fn test_unchanged_declaration_is_a_noop() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    let decl = || Declaration::new("assets", bucket.clone(), json!({"size": 1}));
    let first = pass(Phase::Up, &store, &registry, vec![decl()]).await.unwrap();
    assert_eq!(first.fqns(ActionType::Create), ["shop/dev/assets".to_string()]);
    let recorded = store.get(&root_path(), "assets").await.unwrap().unwrap();
    let writes = store.write_count();

    let second = pass(Phase::Up, &store, &registry, vec![decl()]).await.unwrap();
    assert_eq!(second.count(ActionType::NoOp), 1);
    assert!(!second.has_changes());

    // No handler call and no write on the second pass
    assert_eq!(cloud.calls().len(), 1);
    assert_eq!(store.write_count(), writes);
    let again = store.get(&root_path(), "assets").await.unwrap().unwrap();
    assert_eq!(again.output, recorded.output);
    assert_eq!(again.status, ResourceStatus::Created);
}

#[tokio::test]
async fn test_changed_props_update_in_place() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("assets", bucket.clone(), json!({"size": 1}))],
    )
    .await
    .unwrap();
    let report = pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("assets", bucket.clone(), json!({"size": 2}))],
    )
    .await
    .unwrap();

    assert_eq!(report.count(ActionType::Update), 1);
    assert_eq!(
        cloud.calls_for("shop/dev/assets"),
        vec![LifecycleEvent::Create, LifecycleEvent::Update]
    );
    let record = store.get(&root_path(), "assets").await.unwrap().unwrap();
    assert_eq!(record.props, json!({"size": 2}));
    assert_eq!(record.output["props"], json!({"size": 2}));
}

#[tokio::test]
async fn test_forced_and_always_fresh_resources_are_refreshed() {
    let cloud = FakeCloud::new();
    let lookup = FakeHandler::new("lookup", &cloud)
        .with_policy(ResourcePolicy::new().always_fresh())
        .arc();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let registry = registry(&[lookup.clone(), bucket.clone()]);
    let store = store();

    let decls = || {
        vec![
            Declaration::new("zone", lookup.clone(), json!({})),
            Declaration::new("assets", bucket.clone(), json!({})).force(true),
        ]
    };
    pass(Phase::Up, &store, &registry, decls()).await.unwrap();
    let report = pass(Phase::Up, &store, &registry, decls()).await.unwrap();

    assert_eq!(report.count(ActionType::Update), 2);
    assert_eq!(cloud.count(LifecycleEvent::Update), 2);
}

#[tokio::test]
async fn test_removed_resource_is_deleted_exactly_once() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    pass(
        Phase::Up,
        &store,
        &registry,
        vec![
            Declaration::new("a", bucket.clone(), json!({})),
            Declaration::new("keep", bucket.clone(), json!({})),
        ],
    )
    .await
    .unwrap();

    let report = pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("keep", bucket.clone(), json!({}))],
    )
    .await
    .unwrap();
    assert_eq!(report.fqns(ActionType::Delete), ["shop/dev/a".to_string()]);
    assert!(store.get(&root_path(), "a").await.unwrap().is_none());

    // A third pass has nothing left to delete
    pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("keep", bucket.clone(), json!({}))],
    )
    .await
    .unwrap();
    assert_eq!(cloud.calls_for("shop/dev/a"), vec![
        LifecycleEvent::Create,
        LifecycleEvent::Delete
    ]);
    assert_eq!(cloud.object_names(), vec!["shop-keep-dev".to_string()]);
}

#[tokio::test]
async fn test_destroy_deletes_dependents_first() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    // Ids sort the other way round, so only the dependency decides the order
    let decls = || {
        vec![
            Declaration::new("b", bucket.clone(), json!({})),
            Declaration::new("a", bucket.clone(), json!({})).depends_on("b"),
        ]
    };
    pass(Phase::Up, &store, &registry, decls()).await.unwrap();
    let report = pass(Phase::Destroy, &store, &registry, decls()).await.unwrap();

    assert_eq!(
        report.fqns(ActionType::Delete),
        ["shop/dev/a".to_string(), "shop/dev/b".to_string()]
    );
    let deletes: Vec<String> = cloud
        .calls()
        .into_iter()
        .filter(|(e, _)| *e == LifecycleEvent::Delete)
        .map(|(_, fqn)| fqn)
        .collect();
    assert_eq!(deletes, vec!["shop/dev/a", "shop/dev/b"]);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_destroy_removes_dotted_ids_from_filesystem_state() {
    let temp_dir = tempfile::tempdir().unwrap();
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let registry = registry(&[bucket.clone()]);
    let store: Arc<dyn StateStore> = Arc::new(FileSystemStateStore::new(temp_dir.path()));

    for phase in [Phase::Up, Phase::Destroy] {
        let bucket = bucket.clone();
        run(options(phase), store.clone(), registry.clone(), move |scope| async move {
            scope
                .apply(Declaration::new(".env", bucket, json!({})))
                .await?;
            Ok(())
        })
        .await
        .unwrap();
    }

    assert!(store.get(&root_path(), ".env").await.unwrap().is_none());
    assert!(cloud.object_names().is_empty());
}

#[tokio::test]
async fn test_destroy_removes_whole_subtree() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    let program = |bucket: Arc<dyn ResourceHandler>| {
        move |scope: Scope| async move {
            scope
                .apply(Declaration::new("site", bucket.clone(), json!({})))
                .await?;
            let api = scope.child("api")?;
            api.apply(Declaration::new("db", bucket.clone(), json!({"name": "db"})))
                .await?;
            api.child("cache")?
                .apply(Declaration::new("redis", bucket.clone(), json!({"name": "redis"})))
                .await?;
            Ok(())
        }
    };

    run(options(Phase::Up), store.clone(), registry.clone(), program(bucket.clone()))
        .await
        .unwrap();
    assert_eq!(store.len().await, 3);

    let report = run(
        options(Phase::Destroy),
        store.clone(),
        registry.clone(),
        program(bucket.clone()),
    )
    .await
    .unwrap();

    // Deeper scopes go first when nothing else decides
    assert_eq!(
        report.fqns(ActionType::Delete),
        [
            "shop/dev/api/cache/redis".to_string(),
            "shop/dev/api/db".to_string(),
            "shop/dev/site".to_string(),
        ]
    );
    assert!(store.list_scopes(&root_path()).await.unwrap().is_empty());
    assert!(cloud.object_names().is_empty());
}

#[tokio::test]
async fn test_scope_no_longer_created_is_torn_down() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    let with_api = bucket.clone();
    run(options(Phase::Up), store.clone(), registry.clone(), move |scope| async move {
        scope
            .child("api")?
            .apply(Declaration::new("db", with_api, json!({})))
            .await?;
        Ok(())
    })
    .await
    .unwrap();

    let report = run(options(Phase::Up), store.clone(), registry.clone(), |_scope| async {
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(report.fqns(ActionType::Delete), ["shop/dev/api/db".to_string()]);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_read_phase_is_pure() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    pass(
        Phase::Up,
        &store,
        &registry,
        vec![
            Declaration::new("a", bucket.clone(), json!({"size": 1})),
            Declaration::new("orphan", bucket.clone(), json!({})),
        ],
    )
    .await
    .unwrap();
    let writes = store.write_count();
    let calls = cloud.calls().len();

    let report = pass(
        Phase::Read,
        &store,
        &registry,
        vec![
            Declaration::new("a", bucket.clone(), json!({"size": 2})),
            Declaration::new("planned", bucket.clone(), json!({})),
        ],
    )
    .await
    .unwrap();

    assert_eq!(report.fqns(ActionType::Read), ["shop/dev/a".to_string()]);
    assert_eq!(report.fqns(ActionType::Create), ["shop/dev/planned".to_string()]);
    assert_eq!(report.count(ActionType::Delete), 0);
    assert_eq!(store.write_count(), writes);
    assert_eq!(cloud.calls().len(), calls);
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn test_read_returns_recorded_output() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("a", bucket.clone(), json!({}))],
    )
    .await
    .unwrap();

    let scope = Scope::root(
        options(Phase::Read).with_registry(registry.clone()),
        store.clone(),
    )
    .unwrap();
    let applied = scope
        .apply(Declaration::new("a", bucket.clone(), json!({})))
        .await
        .unwrap();
    assert_eq!(applied.action, ActionType::Read);
    assert_eq!(applied.get::<String>("name").as_deref(), Some("shop-a-dev"));

    let planned = scope
        .apply(Declaration::new("b", bucket.clone(), json!({})))
        .await
        .unwrap();
    assert_eq!(planned.action, ActionType::Create);
    assert!(planned.output.is_null());
}

#[tokio::test]
async fn test_failed_create_is_resumed() {
    let cloud = FakeCloud::new();
    let handler = FakeHandler::new("bucket", &cloud);
    handler.fault(LifecycleEvent::Create, Fault::Fail);
    let bucket = handler.arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    let decl = || vec![Declaration::new("a", bucket.clone(), json!({}))];
    let err = pass(Phase::Up, &store, &registry, decl()).await.unwrap_err();
    assert!(matches!(err, EngineError::Handler { ref fqn, .. } if fqn == "shop/dev/a"));

    let record = store.get(&root_path(), "a").await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Creating);
    assert!(record.error.as_deref().unwrap().contains("injected create failure"));

    let report = pass(Phase::Up, &store, &registry, decl()).await.unwrap();
    assert_eq!(report.count(ActionType::Create), 1);
    let record = store.get(&root_path(), "a").await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Created);
    assert!(record.error.is_none());
    assert_eq!(cloud.object_names(), vec!["shop-a-dev".to_string()]);
}

#[tokio::test]
async fn test_lost_create_response_does_not_duplicate() {
    let cloud = FakeCloud::new();
    let handler = FakeHandler::new("bucket", &cloud);
    handler.fault(LifecycleEvent::Create, Fault::FailAfterCreate);
    let bucket = handler.arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    let decl = || vec![Declaration::new("a", bucket.clone(), json!({}))];
    assert!(pass(Phase::Up, &store, &registry, decl()).await.is_err());
    assert_eq!(cloud.object_names().len(), 1);

    // The retry finds its own object and takes it over
    pass(Phase::Up, &store, &registry, decl()).await.unwrap();
    assert_eq!(cloud.object_names(), vec!["shop-a-dev".to_string()]);
    assert_eq!(
        cloud.calls_for("shop/dev/a"),
        vec![
            LifecycleEvent::Create,
            LifecycleEvent::Create,
            LifecycleEvent::Update
        ]
    );
    let record = store.get(&root_path(), "a").await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Created);
}

#[tokio::test]
async fn test_conflict_requires_adopt() {
    let cloud = FakeCloud::new();
    cloud.insert("legacy", json!({"name": "legacy", "props": {}}));
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    let err = pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("a", bucket.clone(), json!({"name": "legacy"}))],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { ref name, .. } if name == "legacy"));
    assert!(err.to_string().contains("--adopt"));
    assert!(store.is_empty().await);

    let report = pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("a", bucket.clone(), json!({"name": "legacy", "size": 3})).adopt(true)],
    )
    .await
    .unwrap();
    assert_eq!(report.count(ActionType::Create), 1);
    let record = store.get(&root_path(), "a").await.unwrap().unwrap();
    assert_eq!(record.output["props"]["size"], 3);
    assert_eq!(cloud.object_names(), vec!["legacy".to_string()]);
}

#[tokio::test]
async fn test_run_wide_adopt_flag() {
    let cloud = FakeCloud::new();
    cloud.insert("shop-a-dev", json!({"name": "shop-a-dev"}));
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let store = store();

    run(
        options(Phase::Up).with_adopt(true),
        store.clone(),
        registry(&[bucket.clone()]),
        move |scope| async move {
            scope
                .apply(Declaration::new("a", bucket, json!({})))
                .await?;
            Ok(())
        },
    )
    .await
    .unwrap();
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_replace_creates_before_deleting() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud)
        .replacing(&["name"], ReplaceStrategy::CreateBeforeDelete)
        .arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("a", bucket.clone(), json!({"name": "old"}))],
    )
    .await
    .unwrap();
    let report = pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("a", bucket.clone(), json!({"name": "new"}))],
    )
    .await
    .unwrap();

    assert_eq!(report.count(ActionType::Replace), 1);
    assert_eq!(
        cloud.calls_for("shop/dev/a"),
        vec![
            LifecycleEvent::Create,
            LifecycleEvent::Create,
            LifecycleEvent::Delete
        ]
    );
    assert_eq!(cloud.object_names(), vec!["new".to_string()]);
    let record = store.get(&root_path(), "a").await.unwrap().unwrap();
    assert!(record.pending_replacements.is_empty());
    assert_eq!(record.output["name"], "new");
}

#[tokio::test]
async fn test_replace_deletes_before_creating() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud)
        .replacing(&["region"], ReplaceStrategy::DeleteBeforeCreate)
        .arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("a", bucket.clone(), json!({"region": "eu"}))],
    )
    .await
    .unwrap();
    pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("a", bucket.clone(), json!({"region": "us"}))],
    )
    .await
    .unwrap();

    // Same physical name, so the old object has to go first
    assert_eq!(
        cloud.calls_for("shop/dev/a"),
        vec![
            LifecycleEvent::Create,
            LifecycleEvent::Delete,
            LifecycleEvent::Create
        ]
    );
    let record = store.get(&root_path(), "a").await.unwrap().unwrap();
    assert_eq!(record.output["props"]["region"], "us");
}

#[tokio::test]
async fn test_interrupted_delete_before_create_is_resumed() {
    let cloud = FakeCloud::new();
    let handler = FakeHandler::new("bucket", &cloud)
        .replacing(&["name"], ReplaceStrategy::DeleteBeforeCreate);
    handler.fault(LifecycleEvent::Delete, Fault::Fail);
    let bucket = handler.arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    let decls = |name: &str| vec![Declaration::new("a", bucket.clone(), json!({ "name": name }))];
    pass(Phase::Up, &store, &registry, decls("old")).await.unwrap();
    assert!(pass(Phase::Up, &store, &registry, decls("new")).await.is_err());

    let record = store.get(&root_path(), "a").await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Deleting);
    assert_eq!(record.props["name"], "old");

    // The old object is deleted before the new one is created
    let report = pass(Phase::Up, &store, &registry, decls("new")).await.unwrap();
    assert_eq!(report.count(ActionType::Replace), 1);
    assert_eq!(cloud.object_names(), vec!["new".to_string()]);
    assert_eq!(
        cloud.calls_for("shop/dev/a"),
        vec![
            LifecycleEvent::Create,
            LifecycleEvent::Delete,
            LifecycleEvent::Delete,
            LifecycleEvent::Create
        ]
    );
    let record = store.get(&root_path(), "a").await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Created);
    assert_eq!(record.output["name"], "new");
}

#[tokio::test]
async fn test_handler_can_ask_for_replacement() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud)
        .replace_on_update()
        .with_policy(ResourcePolicy::new().replace_strategy(ReplaceStrategy::DeleteBeforeCreate))
        .arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("a", bucket.clone(), json!({"v": 1}))],
    )
    .await
    .unwrap();
    let report = pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("a", bucket.clone(), json!({"v": 2}))],
    )
    .await
    .unwrap();

    assert_eq!(report.count(ActionType::Replace), 1);
    assert_eq!(
        cloud.calls_for("shop/dev/a"),
        vec![
            LifecycleEvent::Create,
            LifecycleEvent::Update,
            LifecycleEvent::Delete,
            LifecycleEvent::Create
        ]
    );
}

#[tokio::test]
async fn test_pending_replacement_is_cleaned_up_next_pass() {
    let cloud = FakeCloud::new();
    let handler = FakeHandler::new("bucket", &cloud)
        .replacing(&["name"], ReplaceStrategy::CreateBeforeDelete);
    handler.fault(LifecycleEvent::Delete, Fault::Fail);
    let bucket = handler.arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("a", bucket.clone(), json!({"name": "old"}))],
    )
    .await
    .unwrap();
    let decl = || vec![Declaration::new("a", bucket.clone(), json!({"name": "new"}))];
    assert!(pass(Phase::Up, &store, &registry, decl()).await.is_err());

    let record = store.get(&root_path(), "a").await.unwrap().unwrap();
    assert_eq!(record.pending_replacements.len(), 1);
    assert_eq!(cloud.object_names(), vec!["new".to_string(), "old".to_string()]);

    pass(Phase::Up, &store, &registry, decl()).await.unwrap();
    let record = store.get(&root_path(), "a").await.unwrap().unwrap();
    assert!(record.pending_replacements.is_empty());
    assert_eq!(cloud.object_names(), vec!["new".to_string()]);
}

#[tokio::test]
async fn test_changed_kind_replaces_object() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let queue = FakeHandler::new("queue", &cloud).arc();
    let registry = registry(&[bucket.clone(), queue.clone()]);
    let store = store();

    pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("a", bucket.clone(), json!({"name": "b1"}))],
    )
    .await
    .unwrap();
    let report = pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("a", queue.clone(), json!({"name": "q1"}))],
    )
    .await
    .unwrap();

    assert_eq!(report.count(ActionType::Replace), 1);
    let record = store.get(&root_path(), "a").await.unwrap().unwrap();
    assert_eq!(record.kind, "queue");
    assert_eq!(cloud.object_names(), vec!["q1".to_string()]);
}

#[tokio::test]
async fn test_failed_destroy_can_be_repeated() {
    let cloud = FakeCloud::new();
    let handler = FakeHandler::new("bucket", &cloud);
    handler.fault(LifecycleEvent::Delete, Fault::Fail);
    let bucket = handler.arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    let decls = || {
        vec![
            Declaration::new("a", bucket.clone(), json!({})),
            Declaration::new("b", bucket.clone(), json!({})),
        ]
    };
    pass(Phase::Up, &store, &registry, decls()).await.unwrap();

    assert!(pass(Phase::Destroy, &store, &registry, decls()).await.is_err());
    let record = store.get(&root_path(), "a").await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Deleting);
    assert!(store.get(&root_path(), "b").await.unwrap().is_some());

    pass(Phase::Destroy, &store, &registry, decls()).await.unwrap();
    assert!(store.is_empty().await);
    assert!(cloud.object_names().is_empty());
}

#[tokio::test]
async fn test_re_declared_deleting_record_is_recreated() {
    let cloud = FakeCloud::new();
    let handler = FakeHandler::new("bucket", &cloud);
    handler.fault(LifecycleEvent::Delete, Fault::Fail);
    let bucket = handler.arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    let decls = || vec![Declaration::new("a", bucket.clone(), json!({}))];
    pass(Phase::Up, &store, &registry, decls()).await.unwrap();
    assert!(pass(Phase::Destroy, &store, &registry, decls()).await.is_err());

    // The object still exists; coming back to `up` takes it over again
    let report = pass(Phase::Up, &store, &registry, decls()).await.unwrap();
    assert_eq!(report.count(ActionType::Create), 1);
    let record = store.get(&root_path(), "a").await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Created);
    assert_eq!(cloud.object_names(), vec!["shop-a-dev".to_string()]);
}

#[tokio::test]
async fn test_cancelled_pass_touches_nothing() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let store = store();
    let token = Cancellation::new();
    token.cancel();

    let err = run(
        options(Phase::Up).with_cancellation(token),
        store.clone(),
        registry(&[bucket.clone()]),
        move |scope| async move {
            scope
                .apply(Declaration::new("a", bucket, json!({})))
                .await?;
            Ok(())
        },
    )
    .await
    .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(store.write_count(), 0);
    assert!(cloud.calls().is_empty());
}

#[tokio::test]
async fn test_failed_program_skips_orphan_pass() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let registry = registry(&[bucket.clone()]);
    let store = store();

    pass(
        Phase::Up,
        &store,
        &registry,
        vec![Declaration::new("a", bucket.clone(), json!({}))],
    )
    .await
    .unwrap();

    let err = run(options(Phase::Up), store.clone(), registry.clone(), |_scope| async {
        Err(EngineError::Dependency("program gave up".into()))
    })
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::Dependency(_)));
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_duplicate_id_is_rejected() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let store = store();

    let err = pass(
        Phase::Up,
        &store,
        &registry(&[bucket.clone()]),
        vec![
            Declaration::new("a", bucket.clone(), json!({})),
            Declaration::new("a", bucket.clone(), json!({"other": true})),
        ],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateId { ref id, .. } if id == "a"));
    assert_eq!(cloud.calls().len(), 1);
}

#[tokio::test]
async fn test_concurrent_declarations_in_one_scope() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let store = store();

    let report = run(
        options(Phase::Up),
        store.clone(),
        registry(&[bucket.clone()]),
        move |scope| async move {
            let (a, b) = tokio::join!(
                scope.apply(Declaration::new("a", bucket.clone(), json!({}))),
                scope.apply(Declaration::new("b", bucket.clone(), json!({}))),
            );
            a?;
            b?;
            Ok(())
        },
    )
    .await
    .unwrap();

    assert_eq!(report.count(ActionType::Create), 2);
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn test_secrets_are_sealed_at_rest() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let store = store();
    let cipher = SecretCipher::from_passphrase("correct horse").unwrap();

    let scope = Scope::root(
        options(Phase::Up)
            .with_cipher(cipher.clone())
            .with_registry(registry(&[bucket.clone()])),
        store.clone(),
    )
    .unwrap();
    let applied = scope
        .apply(Declaration::new(
            "db",
            bucket.clone(),
            json!({"password": {"@secret": "hunter2"}}),
        ))
        .await
        .unwrap();
    assert_eq!(applied.output["props"]["password"]["@secret"], "hunter2");

    let raw = store.get(&root_path(), "db").await.unwrap().unwrap();
    let raw_json = serde_json::to_string(&raw).unwrap();
    assert!(!raw_json.contains("hunter2"));
    assert!(raw_json.contains("@secret-sealed"));

    // Without the passphrase the record cannot be used
    let blind = Scope::root(
        options(Phase::Read).with_registry(registry(&[bucket.clone()])),
        store.clone(),
    )
    .unwrap();
    let err = blind
        .apply(Declaration::new("db", bucket.clone(), json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::State(_)));
}

#[tokio::test]
async fn test_dependencies_are_recorded_as_fqns() {
    let cloud = FakeCloud::new();
    let bucket = FakeHandler::new("bucket", &cloud).arc();
    let store = store();

    let scope = Scope::root(
        options(Phase::Up).with_registry(registry(&[bucket.clone()])),
        store.clone(),
    )
    .unwrap();
    scope
        .apply(Declaration::new("net", bucket.clone(), json!({})))
        .await
        .unwrap();
    let api = scope.child("api").unwrap();
    api.apply(
        Declaration::new("db", bucket.clone(), json!({"name": "db"}))
            .depends_on("shop/dev/net")
            .depends_on("cache"),
    )
    .await
    .unwrap();

    let record = store.get(api.path(), "db").await.unwrap().unwrap();
    assert_eq!(
        record.dependencies,
        vec!["shop/dev/net".to_string(), "shop/dev/api/cache".to_string()]
    );
    assert_eq!(scope.seen_ids().into_iter().collect::<Vec<_>>(), vec!["net"]);
}
