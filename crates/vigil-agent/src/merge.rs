//! Central defaults merged into a service registration.
//!
//! Locally registered values always win; defaults only fill what the
//! registration left unset.

use serde_json::{Map, Value};

use vigil_core::{
    MeshGatewayMode, ProxyConfig, ServiceConfigRequest, ServiceConfigResponse, ServiceDefinition,
    ServiceKind,
};

/// Apply `defaults` to a copy of `service`. The input is the original
/// registration and is never modified.
pub fn merge_service_config(
    defaults: Option<&ServiceConfigResponse>,
    service: &ServiceDefinition,
) -> ServiceDefinition {
    let mut merged = service.clone();
    let Some(defaults) = defaults else {
        return merged;
    };
    if merged.proxy.is_none() && merged.kind == ServiceKind::Typical {
        return merged;
    }

    let proxy = merged.proxy.get_or_insert_with(ProxyConfig::default);
    fill_missing(&mut proxy.config, &defaults.proxy_config);

    if !proxy.expose.checks {
        proxy.expose.checks = defaults.expose.checks;
    }
    if proxy.expose.paths.is_empty() {
        proxy.expose.paths = defaults.expose.paths.clone();
    }

    if proxy.mesh_gateway.mode == MeshGatewayMode::Default {
        proxy.mesh_gateway.mode = defaults.mesh_gateway.mode;
    }

    let proxy_mode = proxy.mesh_gateway.mode;
    for upstream in proxy.upstreams.iter_mut().filter(|u| u.is_service()) {
        if upstream.mesh_gateway.mode == MeshGatewayMode::Default {
            upstream.mesh_gateway.mode = proxy_mode;
        }
        if let Some(cfg) = defaults.upstream_configs.get(&upstream.destination_name) {
            fill_missing(&mut upstream.config, cfg);
        }
    }
    merged
}

/// Copy every key of `src` that `dst` does not have.
fn fill_missing(dst: &mut Map<String, Value>, src: &Map<String, Value>) {
    for (k, v) in src {
        dst.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

/// Build the central config request for a registration.
///
/// Sidecar proxies ask for their destination service's config and list
/// their service-type upstreams. An empty token falls back to `agent_token`.
pub fn make_config_request(
    service: &ServiceDefinition,
    datacenter: &str,
    token: &str,
    agent_token: &str,
) -> ServiceConfigRequest {
    let mut name = service.service.clone();
    let mut upstream_ids = Vec::new();

    if service.is_sidecar_proxy() {
        if let Some(proxy) = &service.proxy {
            name = proxy.destination_service_name.clone();
            upstream_ids = proxy
                .upstreams
                .iter()
                .filter(|u| u.is_service())
                .map(|u| u.destination_name.clone())
                .collect();
        }
    }

    ServiceConfigRequest {
        name,
        datacenter: datacenter.to_string(),
        token: if token.is_empty() {
            agent_token.to_string()
        } else {
            token.to_string()
        },
        upstream_ids,
    }
}
