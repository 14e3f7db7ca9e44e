// API server configuration sourced from environment variables, with
// optional YAML overrides for ops-friendly config files.
use ambit_api::GroupResource;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_SCOPE_NAME: &str = "internal.apiserver.k8s.io";
const DEFAULT_MINIMUM_RV_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    // HTTP bind address for the resource API.
    pub bind_addr: SocketAddr,
    // Identifier for this server in persisted scope progress records.
    pub server_id: String,
    // Feature flag gating the entire request-scoping subsystem.
    pub request_scoping: bool,
    // Default store identifier; required when request scoping is enabled.
    pub resource_store_id: Option<String>,
    // Per-resource store overrides: `<group>/<resource>=<storeID>`.
    pub override_resource_store_ids: HashMap<GroupResource, String>,
    // Remote scope definition registry; absent means loopback.
    pub scope_registry_url: Option<String>,
    // Scope name assumed by the bare `?scope=<value>` query form.
    pub default_scope_name: String,
    // Watch gate re-check interval for fleet minimums.
    pub minimum_rv_check_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct ApiServerConfigOverride {
    bind_addr: Option<String>,
    server_id: Option<String>,
    request_scoping: Option<bool>,
    resource_store_id: Option<String>,
    override_resource_store_ids: Option<String>,
    scope_registry_url: Option<String>,
    default_scope_name: Option<String>,
    minimum_rv_check_interval_ms: Option<u64>,
}

impl ApiServerConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("AMBIT_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8443".to_string())
            .parse()
            .with_context(|| "parse AMBIT_BIND")?;
        let server_id = std::env::var("AMBIT_SERVER_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        let request_scoping = std::env::var("AMBIT_REQUEST_SCOPING")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let resource_store_id = std::env::var("AMBIT_RESOURCE_STORE_ID")
            .ok()
            .filter(|value| !value.is_empty());
        let override_resource_store_ids = match std::env::var("AMBIT_OVERRIDE_RESOURCE_STORE_ID") {
            Ok(raw) => parse_store_overrides(&raw)?,
            Err(_) => HashMap::new(),
        };
        let scope_registry_url = std::env::var("AMBIT_SCOPE_REGISTRY_URL")
            .ok()
            .filter(|value| !value.is_empty());
        let default_scope_name = std::env::var("AMBIT_DEFAULT_SCOPE_NAME")
            .unwrap_or_else(|_| DEFAULT_SCOPE_NAME.to_string());
        let minimum_rv_check_interval = match std::env::var("AMBIT_MINIMUM_RV_CHECK_INTERVAL_MS") {
            Ok(raw) => Duration::from_millis(
                raw.parse()
                    .with_context(|| "parse AMBIT_MINIMUM_RV_CHECK_INTERVAL_MS")?,
            ),
            Err(_) => DEFAULT_MINIMUM_RV_CHECK_INTERVAL,
        };
        Ok(Self {
            bind_addr,
            server_id,
            request_scoping,
            resource_store_id,
            override_resource_store_ids,
            scope_registry_url,
            default_scope_name,
            minimum_rv_check_interval,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("AMBIT_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read AMBIT_CONFIG: {path}"))?;
            let override_cfg: ApiServerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse api server config yaml")?;
            if let Some(value) = override_cfg.bind_addr {
                config.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
            }
            if let Some(value) = override_cfg.server_id {
                config.server_id = value;
            }
            if let Some(value) = override_cfg.request_scoping {
                config.request_scoping = value;
            }
            if let Some(value) = override_cfg.resource_store_id {
                config.resource_store_id = Some(value).filter(|v| !v.is_empty());
            }
            if let Some(value) = override_cfg.override_resource_store_ids {
                config.override_resource_store_ids = parse_store_overrides(&value)?;
            }
            if let Some(value) = override_cfg.scope_registry_url {
                config.scope_registry_url = Some(value).filter(|v| !v.is_empty());
            }
            if let Some(value) = override_cfg.default_scope_name {
                config.default_scope_name = value;
            }
            if let Some(value) = override_cfg.minimum_rv_check_interval_ms {
                config.minimum_rv_check_interval = Duration::from_millis(value);
            }
        }
        Ok(config)
    }

    /// Start-up validation; failures terminate the process with a non-zero
    /// exit before anything is served.
    pub fn validate(&self) -> Result<()> {
        if !self.request_scoping {
            // The scope options only make sense behind the feature flag.
            if self.resource_store_id.is_some() {
                bail!("AMBIT_RESOURCE_STORE_ID requires the request-scoping feature flag");
            }
            if !self.override_resource_store_ids.is_empty() {
                bail!("AMBIT_OVERRIDE_RESOURCE_STORE_ID requires the request-scoping feature flag");
            }
            if self.scope_registry_url.is_some() {
                bail!("AMBIT_SCOPE_REGISTRY_URL requires the request-scoping feature flag");
            }
            return Ok(());
        }
        let Some(store_id) = &self.resource_store_id else {
            bail!("AMBIT_RESOURCE_STORE_ID must be specified when request scoping is enabled");
        };
        for (resource, override_id) in &self.override_resource_store_ids {
            if override_id == store_id {
                bail!("store override for {resource} shadows the default store {store_id:?}");
            }
        }
        Ok(())
    }
}

/// Parses a comma-separated list of `<group>/<resource>=<storeID>` pairs.
pub fn parse_store_overrides(raw: &str) -> Result<HashMap<GroupResource, String>> {
    let mut overrides = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (resource, store_id) = entry
            .split_once('=')
            .with_context(|| format!("store override {entry:?} is not of the form <group>/<resource>=<storeID>"))?;
        if store_id.is_empty() {
            bail!("store override {entry:?} has an empty store id");
        }
        let resource: GroupResource = resource
            .parse()
            .with_context(|| format!("store override {entry:?} has an invalid resource"))?;
        overrides.insert(resource, store_id.to_string());
    }
    Ok(overrides)
}
