//! Stories about one proxy converging against the in-memory cluster

use memcached_operator::builder::{
    child_name, Child, ChildId, ChildKind, PoolConfig, Route, RouteChildren,
};
use memcached_operator::controller::{
    reconcile, ObjectKey, ProxyKubeClient, ReconcileOutcome, SyncSummary,
};
use memcached_operator::crd::{RuleSpec, RuleType, ServiceSpec, MAX_PROXY_NAME_LEN};
use memcached_operator::events::reasons;
use memcached_operator::DEFAULT_MCROUTER_IMAGE;

use super::fake::{context, leaf, proxy, FakeCluster, Write};

// =============================================================================
// Test Fixtures
// =============================================================================

fn id(kind: ChildKind) -> String {
    ChildId {
        kind,
        name: child_name("hoge"),
    }
    .to_string()
}

fn key() -> ObjectKey {
    ObjectKey::new("default", "hoge")
}

fn observed_hash(cluster: &FakeCluster) -> Option<String> {
    cluster
        .proxy("default", "hoge")
        .and_then(|p| p.status)
        .and_then(|s| s.observed_spec_hash)
}

fn child_hash(cluster: &FakeCluster, kind: ChildKind) -> Option<String> {
    cluster
        .children_of("default", "hoge")
        .into_iter()
        .find(|c| c.kind() == kind)
        .and_then(|c| c.spec_hash().map(str::to_string))
}

fn image_of(cluster: &FakeCluster) -> Option<String> {
    cluster
        .children_of("default", "hoge")
        .into_iter()
        .find_map(|c| match c {
            Child::Deployment(d) => d.spec?.template.spec?.containers[0].image.clone(),
            _ => None,
        })
}

fn synced(outcome: ReconcileOutcome) -> SyncSummary {
    match outcome {
        ReconcileOutcome::Synced(summary) => summary,
        ReconcileOutcome::Deleted => panic!("expected a synced proxy"),
    }
}

// =============================================================================
// Stories
// =============================================================================

/// Story: a new proxy with one backend gets a ConfigMap, a Deployment and a
/// Service, its spec is written back with defaults, and it is marked
/// initialized
#[tokio::test]
async fn story_new_proxy_is_created_end_to_end() {
    let cluster = FakeCluster::new();
    cluster.put_proxy(proxy("default", "hoge", leaf("fuga")));
    cluster.put_endpoints("default", "fuga", &["10.0.0.2", "10.0.0.1"]);
    let (ctx, events) = context(&cluster);

    let summary = synced(reconcile(&key(), &ctx).await.unwrap());

    assert_eq!(summary.created, 3);
    assert!(summary.spec_written);
    assert!(summary.status_written);
    assert_eq!(
        cluster.writes(),
        vec![
            Write::Create(id(ChildKind::ConfigMap)),
            Write::Create(id(ChildKind::Deployment)),
            Write::Create(id(ChildKind::Service)),
            Write::Spec("hoge".to_string()),
            Write::Status("hoge".to_string()),
        ]
    );

    let stored = cluster.proxy("default", "hoge").unwrap();
    assert_eq!(stored.spec.rules.type_, Some(RuleType::Sharded));
    let service = stored.spec.rules.service.as_ref().unwrap();
    assert_eq!(service.namespace.as_deref(), Some("default"));
    let status = stored.status.as_ref().unwrap();
    assert!(status.initialized);
    assert_eq!(
        status.observed_spec_hash.as_deref(),
        Some(stored.spec.fingerprint().unwrap().as_str())
    );

    let routing = cluster.routing("default", "hoge").unwrap();
    assert_eq!(
        routing.pools.get("default.fuga.11211"),
        Some(&PoolConfig {
            servers: vec!["10.0.0.1:11211".to_string(), "10.0.0.2:11211".to_string()],
        })
    );
    assert_eq!(
        routing.route,
        Route::HashRoute {
            children: RouteChildren::Pool("Pool|default.fuga.11211".to_string()),
        }
    );

    let deployment = cluster
        .children_of("default", "hoge")
        .into_iter()
        .find_map(|c| match c {
            Child::Deployment(d) => Some(d),
            _ => None,
        })
        .unwrap();
    let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
    assert_eq!(container.image.as_deref(), Some(DEFAULT_MCROUTER_IMAGE));

    let synced_events = events.with_reason(reasons::SYNCED);
    assert_eq!(synced_events.len(), 1);
    assert_eq!(synced_events[0].object, "default/hoge");
}

/// Story: a proxy whose backend has no Endpoints object still syncs, and
/// its leaf answers every request with a miss
#[tokio::test]
async fn story_missing_backend_routes_to_null() {
    let cluster = FakeCluster::new();
    cluster.put_proxy(proxy("default", "hoge", leaf("fuga")));
    let (ctx, _events) = context(&cluster);

    let summary = synced(reconcile(&key(), &ctx).await.unwrap());

    assert_eq!(summary.created, 3);
    let routing = cluster.routing("default", "hoge").unwrap();
    assert!(routing.pools.is_empty());
    assert_eq!(routing.route, Route::NullRoute);
    assert!(cluster.proxy("default", "hoge").unwrap().status.unwrap().initialized);
}

/// Story: once a proxy has converged, reconciling it again writes nothing
#[tokio::test]
async fn story_converged_proxy_is_left_alone() {
    let cluster = FakeCluster::new();
    cluster.put_proxy(proxy("default", "hoge", leaf("fuga")));
    cluster.put_endpoints("default", "fuga", &["10.0.0.1"]);
    let (ctx, events) = context(&cluster);

    reconcile(&key(), &ctx).await.unwrap();
    cluster.clear_writes();

    let summary = synced(reconcile(&key(), &ctx).await.unwrap());

    assert!(summary.is_noop());
    assert!(cluster.writes().is_empty());
    assert_eq!(events.with_reason(reasons::SYNCED).len(), 1);
}

/// Story: when a backend gains a pod only the routing config changes, the
/// mcrouter pods and the Service are untouched
#[tokio::test]
async fn story_endpoint_change_touches_only_config_map() {
    let cluster = FakeCluster::new();
    cluster.put_proxy(proxy(
        "default",
        "hoge",
        RuleSpec::pool(
            Some(RuleType::Replicated),
            vec![
                leaf("fuga"),
                RuleSpec::pool(None, vec![leaf("piyo"), leaf("foo")]),
            ],
        ),
    ));
    cluster.put_endpoints("default", "fuga", &["10.0.0.1"]);
    cluster.put_endpoints("default", "piyo", &["10.0.1.1"]);
    let (ctx, _events) = context(&cluster);

    reconcile(&key(), &ctx).await.unwrap();
    let hash_before = cluster
        .proxy("default", "hoge")
        .unwrap()
        .status
        .unwrap()
        .observed_spec_hash;
    cluster.clear_writes();

    cluster.put_endpoints("default", "piyo", &["10.0.1.1", "10.0.1.2"]);
    let summary = synced(reconcile(&key(), &ctx).await.unwrap());

    assert_eq!(summary.updated, 1);
    assert!(!summary.spec_written);
    assert_eq!(
        cluster.writes(),
        vec![
            Write::Update(id(ChildKind::ConfigMap)),
            Write::Status("hoge".to_string()),
        ]
    );

    let stored = cluster.proxy("default", "hoge").unwrap();
    assert_eq!(stored.status.unwrap().observed_spec_hash, hash_before);

    let routing = cluster.routing("default", "hoge").unwrap();
    assert_eq!(routing.pools["default.piyo.11211"].servers.len(), 2);
    assert!(!routing.pools.contains_key("default.foo.11211"));
    let Route::AllSyncRoute {
        children: RouteChildren::Routes(routes),
    } = routing.route
    else {
        panic!("expected a replicated root");
    };
    assert_eq!(routes.len(), 2);
    assert_eq!(
        routes[1],
        Route::HashRoute {
            children: RouteChildren::Routes(vec![
                Route::HashRoute {
                    children: RouteChildren::Pool("Pool|default.piyo.11211".to_string()),
                },
                Route::NullRoute,
            ]),
        }
    );
}

/// Story: changing the mcrouter port rolls the Deployment and the Service
/// but keeps the routing config
#[tokio::test]
async fn story_port_change_updates_pods_and_service() {
    let cluster = FakeCluster::new();
    cluster.put_proxy(proxy("default", "hoge", leaf("fuga")));
    cluster.put_endpoints("default", "fuga", &["10.0.0.1"]);
    let (ctx, _events) = context(&cluster);

    reconcile(&key(), &ctx).await.unwrap();
    cluster.clear_writes();

    let mut changed = cluster.proxy("default", "hoge").unwrap();
    changed.spec.mcrouter.port = Some(5000);
    cluster.put_proxy(changed);

    let summary = synced(reconcile(&key(), &ctx).await.unwrap());

    assert_eq!(summary.updated, 2);
    assert_eq!(
        cluster.writes(),
        vec![
            Write::Update(id(ChildKind::Deployment)),
            Write::Update(id(ChildKind::Service)),
            Write::Status("hoge".to_string()),
        ]
    );
}

/// Story: a child deleted by hand is recreated and a stale child labelled
/// for the proxy is removed
#[tokio::test]
async fn story_drift_is_repaired() {
    let cluster = FakeCluster::new();
    cluster.put_proxy(proxy("default", "hoge", leaf("fuga")));
    let (ctx, _events) = context(&cluster);

    reconcile(&key(), &ctx).await.unwrap();

    let service = cluster
        .children_of("default", "hoge")
        .into_iter()
        .find(|c| c.kind() == ChildKind::Service)
        .unwrap();
    let Child::Service(mut legacy) = service else {
        unreachable!()
    };
    legacy.metadata.name = Some("hoge-legacy".to_string());
    let legacy = Child::Service(legacy);
    cluster.remove_child(
        "default",
        &ChildId {
            kind: ChildKind::Deployment,
            name: child_name("hoge"),
        },
    );
    cluster.create_child(&legacy).await.unwrap();
    cluster.clear_writes();

    let summary = synced(reconcile(&key(), &ctx).await.unwrap());

    assert_eq!(summary.created, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(
        cluster.writes(),
        vec![
            Write::Create(id(ChildKind::Deployment)),
            Write::Delete(legacy.id().to_string()),
            Write::Status("hoge".to_string()),
        ]
    );
    assert_eq!(cluster.children_of("default", "hoge").len(), 3);
}

/// Story: a hand edit to the Deployment image is reverted even though the
/// hash annotation was left as it was
#[tokio::test]
async fn story_hand_edited_image_is_restored() {
    let cluster = FakeCluster::new();
    cluster.put_proxy(proxy("default", "hoge", leaf("fuga")));
    let (ctx, _events) = context(&cluster);

    reconcile(&key(), &ctx).await.unwrap();
    let deployment_id = ChildId {
        kind: ChildKind::Deployment,
        name: child_name("hoge"),
    };
    cluster.edit_child("default", &deployment_id, |child| {
        if let Child::Deployment(d) = child {
            d.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].image =
                Some("evil:latest".to_string());
        }
    });
    cluster.clear_writes();

    let summary = synced(reconcile(&key(), &ctx).await.unwrap());

    assert_eq!(summary.updated, 1);
    assert_eq!(
        cluster.writes(),
        vec![
            Write::Update(id(ChildKind::Deployment)),
            Write::Status("hoge".to_string()),
        ]
    );
    assert_eq!(image_of(&cluster).as_deref(), Some(DEFAULT_MCROUTER_IMAGE));

    cluster.clear_writes();
    reconcile(&key(), &ctx).await.unwrap();
    assert!(cluster.writes().is_empty());
}

/// Story: editing or removing a backend deep in the rule tree changes the
/// spec hash and rewrites the routing config, while the mcrouter pods and
/// the Service stay as they are
#[tokio::test]
async fn story_nested_backend_change_rewrites_only_config_map() {
    let cluster = FakeCluster::new();
    cluster.put_proxy(proxy(
        "default",
        "hoge",
        RuleSpec::pool(
            Some(RuleType::Replicated),
            vec![
                leaf("fuga"),
                RuleSpec::pool(None, vec![leaf("piyo"), leaf("foo")]),
            ],
        ),
    ));
    cluster.put_endpoints("default", "fuga", &["10.0.0.1"]);
    cluster.put_endpoints("default", "piyo", &["10.0.1.1"]);
    cluster.put_endpoints("default", "bar", &["10.0.2.1"]);
    let (ctx, _events) = context(&cluster);

    reconcile(&key(), &ctx).await.unwrap();
    let first_hash = observed_hash(&cluster);
    let deployment_hash = child_hash(&cluster, ChildKind::Deployment);
    let service_hash = child_hash(&cluster, ChildKind::Service);
    cluster.clear_writes();

    let mut renamed = cluster.proxy("default", "hoge").unwrap();
    renamed.spec.rules.children[1].children[0]
        .service
        .as_mut()
        .unwrap()
        .name = "bar".to_string();
    cluster.put_proxy(renamed);

    reconcile(&key(), &ctx).await.unwrap();

    let second_hash = observed_hash(&cluster);
    assert_ne!(second_hash, first_hash);
    assert_eq!(
        cluster.writes(),
        vec![
            Write::Update(id(ChildKind::ConfigMap)),
            Write::Status("hoge".to_string()),
        ]
    );
    let routing = cluster.routing("default", "hoge").unwrap();
    assert!(routing.pools.contains_key("default.bar.11211"));
    assert!(!routing.pools.contains_key("default.piyo.11211"));
    assert_eq!(child_hash(&cluster, ChildKind::Deployment), deployment_hash);
    assert_eq!(child_hash(&cluster, ChildKind::Service), service_hash);
    cluster.clear_writes();

    let mut pruned = cluster.proxy("default", "hoge").unwrap();
    pruned.spec.rules.children[1].children.remove(1);
    cluster.put_proxy(pruned);

    reconcile(&key(), &ctx).await.unwrap();

    assert_ne!(observed_hash(&cluster), second_hash);
    assert_eq!(
        cluster.writes(),
        vec![
            Write::Update(id(ChildKind::ConfigMap)),
            Write::Status("hoge".to_string()),
        ]
    );
    let Route::AllSyncRoute {
        children: RouteChildren::Routes(routes),
    } = cluster.routing("default", "hoge").unwrap().route
    else {
        panic!("expected a replicated root");
    };
    assert_eq!(
        routes[1],
        Route::HashRoute {
            children: RouteChildren::Routes(vec![Route::HashRoute {
                children: RouteChildren::Pool("Pool|default.bar.11211".to_string()),
            }]),
        }
    );
    assert_eq!(child_hash(&cluster, ChildKind::Deployment), deployment_hash);
    assert_eq!(child_hash(&cluster, ChildKind::Service), service_hash);
}

/// Story: a proxy whose name would make its children invalid objects is
/// reported and left without children
#[tokio::test]
async fn story_overlong_proxy_name_is_rejected() {
    let name = format!("h{}", "o".repeat(MAX_PROXY_NAME_LEN));
    let cluster = FakeCluster::new();
    cluster.put_proxy(proxy("default", &name, leaf("fuga")));
    let (ctx, events) = context(&cluster);

    let err = reconcile(&ObjectKey::new("default", &name), &ctx)
        .await
        .unwrap_err();

    assert_eq!(err.field(), Some("metadata.name"));
    assert!(!err.is_retryable());
    assert!(cluster.writes().is_empty());
    assert_eq!(events.with_reason(reasons::VALIDATION_FAILED).len(), 1);

    let longest = "h".repeat(MAX_PROXY_NAME_LEN);
    cluster.put_proxy(proxy("default", &longest, leaf("fuga")));
    reconcile(&ObjectKey::new("default", &longest), &ctx)
        .await
        .unwrap();
    assert!(cluster
        .children_of("default", &longest)
        .iter()
        .all(|c| c.name().len() == 63));
}

/// Story: an explicit backend namespace and named port are honored
#[tokio::test]
async fn story_cross_namespace_backend() {
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    let cluster = FakeCluster::new();
    cluster.put_proxy(proxy(
        "default",
        "hoge",
        RuleSpec::leaf(
            ServiceSpec::named("fuga")
                .namespace("cache")
                .port(IntOrString::String("memcache".to_string())),
        ),
    ));
    let (ctx, _events) = context(&cluster);

    cluster.put_endpoints_object(
        "cache",
        "fuga",
        Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.1.0.1".to_string(),
                    ..Default::default()
                }]),
                ports: Some(vec![
                    EndpointPort {
                        name: Some("metrics".to_string()),
                        port: 9150,
                        ..Default::default()
                    },
                    EndpointPort {
                        name: Some("memcache".to_string()),
                        port: 11211,
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }]),
            ..Default::default()
        },
    );

    reconcile(&key(), &ctx).await.unwrap();

    let routing = cluster.routing("default", "hoge").unwrap();
    assert_eq!(
        routing.pools["cache.fuga.memcache"].servers,
        vec!["10.1.0.1:11211".to_string()]
    );
}

/// Story: a proxy that was deleted before its key was processed is a no-op
#[tokio::test]
async fn story_deleted_proxy_is_ignored() {
    let cluster = FakeCluster::new();
    let (ctx, _events) = context(&cluster);

    let outcome = reconcile(&key(), &ctx).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::Deleted);
    assert!(cluster.writes().is_empty());
}
