//! Central config reconciliation: initial merge, watch updates, watch
//! replacement and teardown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use vigil_agent::{
    AddServiceRequest, Agent, AgentError, ConfigEntryStore, ResolvedConfigCache,
};
use vigil_core::{
    AgentConfig, ConfigEntry, ExposeConfig, HealthStatus, MeshGatewayConfig, ServiceDefinition,
};

#[tokio::test]
async fn initial_defaults_are_merged() {
    let cache = MockCache::new();
    cache.set_defaults("web", protocol_defaults("http", 1));
    let agent = dev_agent(cache.clone());

    agent.add_service(AddServiceRequest::new(web_sidecar())).await.unwrap();

    assert_eq!(proxy_protocol(&agent, "web-sidecar-proxy").as_deref(), Some("http"));
    assert!(agent.service_manager().has_watch("web-sidecar-proxy"));
    assert_eq!(cache.live_watches(), 1);
    agent.shutdown().await;
}

#[tokio::test]
async fn watch_update_reregisters_service() {
    let cache = MockCache::new();
    cache.set_defaults("web", protocol_defaults("http", 1));
    let agent = dev_agent(cache.clone());
    agent.add_service(AddServiceRequest::new(web_sidecar())).await.unwrap();

    cache.push("web", protocol_defaults("grpc", 2)).await;
    eventually(|| proxy_protocol(&agent, "web-sidecar-proxy").as_deref() == Some("grpc")).await;
    agent.shutdown().await;
}

#[tokio::test]
async fn locally_set_values_survive_updates() {
    let cache = MockCache::new();
    let agent = dev_agent(cache.clone());
    let mut sidecar = web_sidecar();
    if let Some(proxy) = sidecar.proxy.as_mut() {
        proxy
            .config
            .insert("protocol".to_string(), serde_json::Value::String("tcp".to_string()));
    }
    agent.add_service(AddServiceRequest::new(sidecar)).await.unwrap();

    let mut update = protocol_defaults("grpc", 2);
    update
        .proxy_config
        .insert("connect_timeout_ms".to_string(), serde_json::Value::from(500));
    cache.push("web", update).await;

    eventually(|| {
        agent
            .state()
            .service("web-sidecar-proxy")
            .and_then(|s| s.proxy)
            .is_some_and(|p| p.config.contains_key("connect_timeout_ms"))
    })
    .await;
    assert_eq!(proxy_protocol(&agent, "web-sidecar-proxy").as_deref(), Some("tcp"));
    agent.shutdown().await;
}

#[tokio::test]
async fn watch_update_keeps_ttl_status() {
    let cache = MockCache::new();
    cache.set_defaults("web", protocol_defaults("http", 1));
    let agent = dev_agent(cache.clone());
    agent
        .add_service(
            AddServiceRequest::new(web_sidecar())
                .with_checks(vec![ttl_check("sidecar-ttl", Duration::from_secs(60))]),
        )
        .await
        .unwrap();
    agent
        .update_ttl_check("sidecar-ttl", HealthStatus::Passing, "proxy up")
        .await
        .unwrap();

    cache.push("web", protocol_defaults("grpc", 2)).await;
    eventually(|| proxy_protocol(&agent, "web-sidecar-proxy").as_deref() == Some("grpc")).await;

    let check = agent.state().check("sidecar-ttl").unwrap();
    assert_eq!(check.status, HealthStatus::Passing);
    assert_eq!(check.output, "proxy up");
    agent
        .update_ttl_check("sidecar-ttl", HealthStatus::Warning, "slow")
        .await
        .unwrap();
    assert_eq!(agent.state().check("sidecar-ttl").unwrap().status, HealthStatus::Warning);
    agent.shutdown().await;
}

#[tokio::test]
async fn reregistration_replaces_watch() {
    let cache = MockCache::new();
    let agent = dev_agent(cache.clone());

    agent.add_service(AddServiceRequest::new(web_sidecar())).await.unwrap();
    let first_key = agent.service_manager().watch_key("web-sidecar-proxy").unwrap();

    let mut changed = web_sidecar();
    changed.tags = vec!["v2".to_string()];
    agent.add_service(AddServiceRequest::new(changed)).await.unwrap();

    assert_eq!(agent.service_manager().watch_count(), 1);
    assert_eq!(cache.notify_calls(), 2);
    assert_eq!(cache.live_watches(), 1);
    // Same request, same key.
    assert_eq!(
        agent.service_manager().watch_key("web-sidecar-proxy").unwrap(),
        first_key
    );
    agent.shutdown().await;
}

#[tokio::test]
async fn stale_correlation_ids_are_discarded() {
    let cache = MockCache::new();
    let agent = dev_agent(cache.clone());
    agent.add_service(AddServiceRequest::new(web_sidecar())).await.unwrap();
    agent.state().mark_service_synced("web-sidecar-proxy");

    // The channel holds one event, so once the third send lands the first
    // two have been handled.
    for _ in 0..3 {
        cache
            .push_tagged("web", "stale-key", protocol_defaults("stale", 9))
            .await;
    }
    assert!(agent.state().dirty_services().is_empty());
    assert_eq!(proxy_protocol(&agent, "web-sidecar-proxy"), None);

    cache.push("web", protocol_defaults("http", 10)).await;
    eventually(|| proxy_protocol(&agent, "web-sidecar-proxy").as_deref() == Some("http")).await;
    agent.shutdown().await;
}

#[tokio::test]
async fn failed_initial_fetch_registers_nothing() {
    let cache = MockCache::new();
    cache.fail_gets(true);
    let agent = dev_agent(cache.clone());

    let err = agent
        .add_service(AddServiceRequest::new(ServiceDefinition::new("web")))
        .await
        .unwrap_err();
    assert!(
        err.to_string()
            .contains("could not retrieve initial service_defaults config for service \"web\""),
        "unexpected error: {err}"
    );
    assert!(!agent.state().service_exists("web"));
    assert!(!agent.service_manager().has_watch("web"));
    assert_eq!(cache.notify_calls(), 0);
}

#[tokio::test]
async fn skipping_the_wait_uses_previous_defaults() {
    let cache = MockCache::new();
    cache.fail_gets(true);
    let agent = dev_agent(cache.clone());

    let mut req = AddServiceRequest::new(web_sidecar());
    req.wait_for_central_config = false;
    req.previous_defaults = Some(protocol_defaults("http2", 4));
    agent.add_service(req).await.unwrap();

    assert_eq!(proxy_protocol(&agent, "web-sidecar-proxy").as_deref(), Some("http2"));
    assert!(agent.service_manager().has_watch("web-sidecar-proxy"));
    agent.shutdown().await;
}

#[tokio::test]
async fn removing_service_stops_watch() {
    let cache = MockCache::new();
    let agent = dev_agent(cache.clone());
    agent
        .add_service(AddServiceRequest::new(ServiceDefinition::new("web")))
        .await
        .unwrap();

    agent.remove_service("web", true).await.unwrap();
    assert!(!agent.service_manager().has_watch("web"));
    assert_eq!(cache.live_watches(), 0);

    // Updates for the removed service go nowhere.
    cache.push("web", protocol_defaults("http", 3)).await;
    assert!(!agent.state().service_exists("web"));
}

#[tokio::test]
async fn registration_after_shutdown_fails() {
    let cache = MockCache::new();
    let agent = dev_agent(cache.clone());
    agent
        .add_service(AddServiceRequest::new(ServiceDefinition::new("web")))
        .await
        .unwrap();

    agent.shutdown().await;
    assert_eq!(cache.live_watches(), 0);
    assert_eq!(agent.service_manager().watch_count(), 0);

    let err = agent
        .add_service(AddServiceRequest::new(ServiceDefinition::new("api")))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ShuttingDown));
}

#[tokio::test]
async fn config_entry_changes_reach_registered_proxy() {
    let store = Arc::new(
        ConfigEntryStore::new(&[ConfigEntry::ServiceDefaults {
            name: "web".to_string(),
            protocol: "http".to_string(),
            mesh_gateway: MeshGatewayConfig::default(),
            expose: ExposeConfig::default(),
        }])
        .with_max_query_time(Duration::from_secs(2)),
    );
    let cache = Arc::new(ResolvedConfigCache::new(Arc::clone(&store)));
    let agent = Agent::new(AgentConfig::dev(), cache, None);

    agent.add_service(AddServiceRequest::new(web_sidecar())).await.unwrap();
    assert_eq!(proxy_protocol(&agent, "web-sidecar-proxy").as_deref(), Some("http"));

    store.set(ConfigEntry::ServiceDefaults {
        name: "web".to_string(),
        protocol: "grpc".to_string(),
        mesh_gateway: MeshGatewayConfig::default(),
        expose: ExposeConfig::default(),
    });
    eventually(|| proxy_protocol(&agent, "web-sidecar-proxy").as_deref() == Some("grpc")).await;
    agent.shutdown().await;
}
