//! Shared test infrastructure
//!
//! In-memory stand-ins for Docker and the secret store. [`FakeEngine`] plays
//! the part of the Swarm secrets driver too: reading a mounted secret file
//! resolves the secret's labels against [`FakeStore`] using the settings the
//! plugin was configured with, so a run only passes when the harness wires
//! the driver the way a real one needs.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use swarm_secrets_smoke::backend::{SecretStore, StoreConnector, StoreError, StoreResult};
use swarm_secrets_smoke::config::SecretLocation;
use swarm_secrets_smoke::deploy::{LABEL_FIELD, LABEL_PATH};
use swarm_secrets_smoke::engine::{
    ContainerLaunch, Engine, EngineError, EngineResult, PluginBuild, PluginState, Removal,
    SecretDecl, ServiceDecl, TaskInfo,
};
use swarm_secrets_smoke::types::SecretString;
use swarm_secrets_smoke::Session;

// =============================================================================
// Secret store
// =============================================================================

type Key = (String, String, String);

#[derive(Default)]
struct StoreState {
    health_calls: u32,
    /// Health probes answered "unreachable" before the store reports ready
    unready_probes: u32,
    never_ready: bool,
    /// Every write, oldest first
    history: Vec<(Instant, Key, String)>,
    policies: BTreeMap<String, String>,
    tokens: Vec<String>,
    failures: BTreeSet<&'static str>,
    /// Writes accepted before further writes fail
    write_budget: Option<u32>,
    writes: u32,
    connected: Vec<String>,
}

/// KV v2 store kept in memory
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

fn key(location: &SecretLocation) -> Key {
    (location.mount.clone(), location.path.clone(), location.field.clone())
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `operation` (`health`, `write_kv`, `read_kv`, `write_policy`, `create_token`) fail
    pub fn fail(&self, operation: &'static str) {
        self.state.lock().unwrap().failures.insert(operation);
    }

    pub fn ready_after(&self, probes: u32) {
        self.state.lock().unwrap().unready_probes = probes;
    }

    pub fn never_ready(&self) {
        self.state.lock().unwrap().never_ready = true;
    }

    /// Accept `count` writes, fail every later one
    pub fn allow_writes(&self, count: u32) {
        self.state.lock().unwrap().write_budget = Some(count);
    }

    pub fn health_calls(&self) -> u32 {
        self.state.lock().unwrap().health_calls
    }

    pub fn connected(&self) -> Vec<String> {
        self.state.lock().unwrap().connected.clone()
    }

    pub fn policy(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().policies.get(name).cloned()
    }

    pub fn issued_tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().tokens.clone()
    }

    /// Current value of a field
    pub fn value(&self, mount: &str, path: &str, field: &str) -> Option<String> {
        self.value_at(mount, path, field, Instant::now())
    }

    /// Value as of `at`; before the first write, the first value written
    pub fn value_at(&self, mount: &str, path: &str, field: &str, at: Instant) -> Option<String> {
        let state = self.state.lock().unwrap();
        let wanted = (mount.to_string(), path.to_string(), field.to_string());
        let mut versions = state.history.iter().filter(|(_, k, _)| *k == wanted).peekable();
        let first = versions.peek().map(|(_, _, v)| v.clone());
        versions.filter(|(written, _, _)| *written <= at).last().map(|(_, _, v)| v.clone()).or(first)
    }

    fn check(&self, operation: &'static str) -> StoreResult<()> {
        if self.state.lock().unwrap().failures.contains(operation) {
            return Err(StoreError::api(format!("injected {operation} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl SecretStore for FakeStore {
    async fn health(&self) -> StoreResult<()> {
        self.check("health")?;
        let mut state = self.state.lock().unwrap();
        state.health_calls += 1;
        if state.never_ready || state.health_calls <= state.unready_probes {
            return Err(StoreError::unreachable("connection refused"));
        }
        Ok(())
    }

    async fn write_kv(&self, location: &SecretLocation, value: &SecretString) -> StoreResult<()> {
        self.check("write_kv")?;
        let mut state = self.state.lock().unwrap();
        if state.write_budget.is_some_and(|budget| state.writes >= budget) {
            return Err(StoreError::Denied { message: "write budget exhausted".to_string() });
        }
        state.writes += 1;
        state.history.push((Instant::now(), key(location), value.expose_secret().to_string()));
        Ok(())
    }

    async fn read_kv(&self, location: &SecretLocation) -> StoreResult<Option<SecretString>> {
        self.check("read_kv")?;
        let state = self.state.lock().unwrap();
        let wanted = key(location);
        Ok(state
            .history
            .iter()
            .rev()
            .find(|(_, k, _)| *k == wanted)
            .map(|(_, _, v)| SecretString::new(v.clone())))
    }

    async fn write_policy(&self, name: &str, document: &str) -> StoreResult<()> {
        self.check("write_policy")?;
        self.state.lock().unwrap().policies.insert(name.to_string(), document.to_string());
        Ok(())
    }

    async fn create_token(&self, policy: &str) -> StoreResult<SecretString> {
        self.check("create_token")?;
        let mut state = self.state.lock().unwrap();
        if !state.policies.contains_key(policy) {
            return Err(StoreError::api(format!("policy '{policy}' does not exist")));
        }
        let token = format!("s.scoped-{}-{}", policy, state.tokens.len() + 1);
        state.tokens.push(token.clone());
        Ok(SecretString::new(token))
    }
}

/// Hands out the shared [`FakeStore`] for every address
pub struct FakeConnector {
    store: Arc<FakeStore>,
}

impl FakeConnector {
    pub fn new(store: Arc<FakeStore>) -> Self {
        Self { store }
    }
}

impl StoreConnector for FakeConnector {
    fn connect(&self, address: &str, _token: &SecretString) -> StoreResult<Arc<dyn SecretStore>> {
        self.store.state.lock().unwrap().connected.push(address.to_string());
        Ok(self.store.clone())
    }
}

// =============================================================================
// Docker engine
// =============================================================================

/// How the simulated driver turns the store's value into file content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Current value
    Live,
    /// Value seen on the first read, forever
    Frozen,
    /// Current value followed by extra bytes
    Suffixed(Vec<u8>),
    /// Value the store held `lag` ago
    Lagging(Duration),
}

#[derive(Debug, Clone)]
pub struct FakePlugin {
    pub enabled: bool,
    pub settings: Vec<String>,
}

#[derive(Debug, Clone)]
struct FakeService {
    secret: String,
    generation: u32,
}

#[derive(Debug, Clone)]
struct FakeStack {
    services: Vec<String>,
    secrets: Vec<String>,
}

struct EngineState {
    calls: Vec<String>,
    containers: BTreeMap<String, ContainerLaunch>,
    plugins: BTreeMap<String, FakePlugin>,
    /// Every settings list passed to `set_plugin`
    applied_settings: Vec<Vec<String>>,
    secrets: BTreeMap<String, SecretDecl>,
    services: BTreeMap<String, FakeService>,
    stacks: BTreeMap<String, FakeStack>,
    manifests: Vec<String>,
    failures: BTreeSet<&'static str>,
    /// Task listings reporting `pending` before tasks run
    pending_polls: u32,
    replace_task_every_poll: bool,
    build_installs: bool,
    delivery: Delivery,
    frozen: Option<Vec<u8>>,
    next_id: u32,
}

/// Docker, Swarm and the secrets driver, in memory
pub struct FakeEngine {
    state: Mutex<EngineState>,
    store: Arc<FakeStore>,
}

impl FakeEngine {
    pub fn new(store: Arc<FakeStore>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EngineState {
                calls: Vec::new(),
                containers: BTreeMap::new(),
                plugins: BTreeMap::new(),
                applied_settings: Vec::new(),
                secrets: BTreeMap::new(),
                services: BTreeMap::new(),
                stacks: BTreeMap::new(),
                manifests: Vec::new(),
                failures: BTreeSet::new(),
                pending_polls: 0,
                replace_task_every_poll: false,
                build_installs: true,
                delivery: Delivery::Live,
                frozen: None,
                next_id: 0,
            }),
            store,
        })
    }

    /// Make the engine operation of that name fail
    pub fn fail(&self, operation: &'static str) {
        self.state.lock().unwrap().failures.insert(operation);
    }

    pub fn set_delivery(&self, delivery: Delivery) {
        self.state.lock().unwrap().delivery = delivery;
    }

    pub fn pending_for(&self, polls: u32) {
        self.state.lock().unwrap().pending_polls = polls;
    }

    /// Swarm reschedules the task between any two listings
    pub fn replace_task_every_poll(&self) {
        self.state.lock().unwrap().replace_task_every_poll = true;
    }

    /// The build command exits 0 without installing anything
    pub fn build_installs_nothing(&self) {
        self.state.lock().unwrap().build_installs = false;
    }

    pub fn install_plugin(&self, name: &str, enabled: bool) {
        self.state
            .lock()
            .unwrap()
            .plugins
            .insert(name.to_string(), FakePlugin { enabled, settings: Vec::new() });
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls whose operation is `operation`
    pub fn calls_to(&self, operation: &str) -> Vec<String> {
        let prefix = format!("{operation} ");
        self.calls().into_iter().filter(|c| c.starts_with(&prefix)).collect()
    }

    /// Index of the first call equal to `call`
    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn container(&self, name: &str) -> Option<ContainerLaunch> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn plugin(&self, name: &str) -> Option<FakePlugin> {
        self.state.lock().unwrap().plugins.get(name).cloned()
    }

    pub fn applied_settings(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().applied_settings.clone()
    }

    pub fn secret(&self, name: &str) -> Option<SecretDecl> {
        self.state.lock().unwrap().secrets.get(name).cloned()
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.state.lock().unwrap().services.contains_key(name)
    }

    pub fn manifests(&self) -> Vec<String> {
        self.state.lock().unwrap().manifests.clone()
    }

    /// Nothing the harness could have created is left
    pub fn is_clean(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.containers.is_empty()
            && state.plugins.is_empty()
            && state.secrets.is_empty()
            && state.services.is_empty()
            && state.stacks.is_empty()
    }

    fn enter(&self, operation: &'static str, target: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{operation} {target}"));
        if state.failures.contains(operation) {
            return Err(EngineError::api(operation, "injected failure"));
        }
        Ok(())
    }

    fn task_container(service: &str, generation: u32) -> String {
        format!("{service}.{generation}")
    }

    /// What the driver hands the task for `secret`
    fn deliver(&self, secret: &SecretDecl) -> Result<Vec<u8>, String> {
        let mut state = self.state.lock().unwrap();
        let plugin = state
            .plugins
            .get(&secret.driver)
            .filter(|p| p.enabled)
            .ok_or_else(|| format!("secret driver '{}' is not enabled", secret.driver))?;

        let setting = |suffix: &str| {
            plugin.settings.iter().find_map(|s| {
                let (name, value) = s.split_once('=')?;
                name.ends_with(suffix).then(|| value.to_string())
            })
        };
        let token = setting("_TOKEN").ok_or("driver has no token configured")?;
        if !self.store.issued_tokens().contains(&token) {
            return Err("permission denied".to_string());
        }
        let mount = setting("_MOUNT_PATH").ok_or("driver has no mount path configured")?;
        let path = secret.labels.get(LABEL_PATH).ok_or("secret has no path label")?;
        let field = secret.labels.get(LABEL_FIELD).ok_or("secret has no field label")?;

        let value = match &state.delivery {
            Delivery::Lagging(lag) => {
                let at = Instant::now().checked_sub(*lag).unwrap_or_else(Instant::now);
                self.store.value_at(&mount, path, field, at)
            }
            _ => self.store.value(&mount, path, field),
        }
        .ok_or_else(|| format!("no value at {mount}/{path}#{field}"))?
        .into_bytes();

        Ok(match state.delivery.clone() {
            Delivery::Live | Delivery::Lagging(_) => value,
            Delivery::Frozen => state.frozen.get_or_insert(value).clone(),
            Delivery::Suffixed(suffix) => [value, suffix].concat(),
        })
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn run_container(&self, launch: &ContainerLaunch) -> EngineResult<String> {
        self.enter("run_container", &launch.name)?;
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(&launch.name) {
            return Err(EngineError::api("create container", "name already in use"));
        }
        state.next_id += 1;
        state.containers.insert(launch.name.clone(), launch.clone());
        Ok(format!("container-{}", state.next_id))
    }

    async fn remove_container(&self, name: &str) -> EngineResult<Removal> {
        self.enter("remove_container", name)?;
        Ok(match self.state.lock().unwrap().containers.remove(name) {
            Some(_) => Removal::Removed,
            None => Removal::Absent,
        })
    }

    async fn read_file(&self, container: &str, path: &str) -> EngineResult<Vec<u8>> {
        self.enter("read_file", container)?;
        let secret = {
            let state = self.state.lock().unwrap();
            let (_, service) = state
                .services
                .iter()
                .find(|(name, s)| Self::task_container(name, s.generation) == container)
                .ok_or_else(|| EngineError::not_found("container", container))?;
            if path != format!("/run/secrets/{}", service.secret) {
                return Err(EngineError::Exec {
                    container: container.to_string(),
                    exit_code: 1,
                    stderr: format!("cat: can't open '{path}': No such file or directory"),
                });
            }
            state.secrets.get(&service.secret).cloned()
        }
        .ok_or_else(|| EngineError::not_found("secret", path))?;

        self.deliver(&secret).map_err(|stderr| EngineError::Exec {
            container: container.to_string(),
            exit_code: 1,
            stderr,
        })
    }

    async fn container_logs(&self, container: &str, tail: usize) -> EngineResult<String> {
        self.enter("container_logs", container)?;
        Ok(format!("last {tail} lines of {container}"))
    }

    async fn build_plugin(&self, build: &PluginBuild) -> EngineResult<()> {
        self.enter("build_plugin", &build.plugin_name)?;
        let mut state = self.state.lock().unwrap();
        if state.build_installs {
            state
                .plugins
                .insert(build.plugin_name.clone(), FakePlugin { enabled: false, settings: Vec::new() });
        }
        Ok(())
    }

    async fn inspect_plugin(&self, name: &str) -> EngineResult<Option<PluginState>> {
        self.enter("inspect_plugin", name)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .plugins
            .get(name)
            .map(|p| PluginState { name: name.to_string(), enabled: p.enabled }))
    }

    async fn set_plugin(&self, name: &str, settings: &[String]) -> EngineResult<()> {
        self.enter("set_plugin", name)?;
        let mut state = self.state.lock().unwrap();
        state.applied_settings.push(settings.to_vec());
        let plugin =
            state.plugins.get_mut(name).ok_or_else(|| EngineError::not_found("plugin", name))?;
        if plugin.enabled {
            return Err(EngineError::Command {
                command: format!("docker plugin set {name}"),
                status: "exit status: 1".to_string(),
                stderr: "cannot set on an active plugin, disable plugin before setting".to_string(),
            });
        }
        plugin.settings = settings.to_vec();
        Ok(())
    }

    async fn enable_plugin(&self, name: &str, _timeout: Duration) -> EngineResult<()> {
        self.enter("enable_plugin", name)?;
        let mut state = self.state.lock().unwrap();
        let plugin =
            state.plugins.get_mut(name).ok_or_else(|| EngineError::not_found("plugin", name))?;
        plugin.enabled = true;
        Ok(())
    }

    async fn disable_plugin(&self, name: &str) -> EngineResult<()> {
        self.enter("disable_plugin", name)?;
        let mut state = self.state.lock().unwrap();
        let plugin =
            state.plugins.get_mut(name).ok_or_else(|| EngineError::not_found("plugin", name))?;
        plugin.enabled = false;
        Ok(())
    }

    async fn remove_plugin(&self, name: &str) -> EngineResult<Removal> {
        self.enter("remove_plugin", name)?;
        Ok(match self.state.lock().unwrap().plugins.remove(name) {
            Some(_) => Removal::Removed,
            None => Removal::Absent,
        })
    }

    async fn create_secret(&self, secret: &SecretDecl) -> EngineResult<String> {
        self.enter("create_secret", &secret.name)?;
        let mut state = self.state.lock().unwrap();
        if !state.plugins.get(&secret.driver).is_some_and(|p| p.enabled) {
            return Err(EngineError::api("create secret", "secret driver is not enabled"));
        }
        state.secrets.insert(secret.name.clone(), secret.clone());
        Ok(format!("secret-id-{}", secret.name))
    }

    async fn remove_secret(&self, name: &str) -> EngineResult<Removal> {
        self.enter("remove_secret", name)?;
        let mut state = self.state.lock().unwrap();
        if state.services.values().any(|s| s.secret == name) {
            return Err(EngineError::api("remove secret", "secret is in use by a service"));
        }
        Ok(match state.secrets.remove(name) {
            Some(_) => Removal::Removed,
            None => Removal::Absent,
        })
    }

    async fn create_service(&self, service: &ServiceDecl) -> EngineResult<String> {
        self.enter("create_service", &service.name)?;
        let mut state = self.state.lock().unwrap();
        if !state.secrets.contains_key(&service.secret_name) {
            return Err(EngineError::not_found("secret", service.secret_name.clone()));
        }
        state.services.insert(
            service.name.clone(),
            FakeService { secret: service.secret_target.clone(), generation: 1 },
        );
        Ok(format!("service-id-{}", service.name))
    }

    async fn remove_service(&self, name: &str) -> EngineResult<Removal> {
        self.enter("remove_service", name)?;
        Ok(match self.state.lock().unwrap().services.remove(name) {
            Some(_) => Removal::Removed,
            None => Removal::Absent,
        })
    }

    async fn deploy_stack(&self, name: &str, manifest: &str) -> EngineResult<()> {
        self.enter("deploy_stack", name)?;
        let doc: serde_yaml::Value = serde_yaml::from_str(manifest)
            .map_err(|e| EngineError::api("stack deploy", e.to_string()))?;

        let mut state = self.state.lock().unwrap();
        state.manifests.push(manifest.to_string());
        let mut stack = FakeStack { services: Vec::new(), secrets: Vec::new() };

        for (_, secret) in doc["secrets"].as_mapping().into_iter().flatten() {
            let decl = SecretDecl {
                name: secret["name"].as_str().unwrap_or_default().to_string(),
                driver: secret["driver"].as_str().unwrap_or_default().to_string(),
                labels: secret["labels"]
                    .as_mapping()
                    .into_iter()
                    .flatten()
                    .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
                    .collect(),
            };
            if !state.plugins.get(&decl.driver).is_some_and(|p| p.enabled) {
                return Err(EngineError::api("stack deploy", "secret driver is not enabled"));
            }
            stack.secrets.push(decl.name.clone());
            state.secrets.insert(decl.name.clone(), decl);
        }

        for (service_name, service) in doc["services"].as_mapping().into_iter().flatten() {
            let full_name = format!("{name}_{}", service_name.as_str().unwrap_or_default());
            let target = service["secrets"][0]["target"].as_str().unwrap_or_default().to_string();
            stack.services.push(full_name.clone());
            state.services.insert(full_name, FakeService { secret: target, generation: 1 });
        }

        state.stacks.insert(name.to_string(), stack);
        Ok(())
    }

    async fn remove_stack(&self, name: &str) -> EngineResult<Removal> {
        self.enter("remove_stack", name)?;
        let mut state = self.state.lock().unwrap();
        let Some(stack) = state.stacks.remove(name) else {
            return Ok(Removal::Absent);
        };
        for service in &stack.services {
            state.services.remove(service);
        }
        for secret in &stack.secrets {
            state.secrets.remove(secret);
        }
        Ok(Removal::Removed)
    }

    async fn list_tasks(&self, service: &str) -> EngineResult<Vec<TaskInfo>> {
        self.enter("list_tasks", service)?;
        let mut state = self.state.lock().unwrap();
        if !state.services.contains_key(service) {
            return Ok(Vec::new());
        }
        if state.pending_polls > 0 {
            state.pending_polls -= 1;
            return Ok(vec![TaskInfo {
                id: format!("task-{service}-pending"),
                state: "pending".to_string(),
                container_id: None,
            }]);
        }

        let replace = state.replace_task_every_poll;
        let Some(entry) = state.services.get_mut(service) else {
            return Ok(Vec::new());
        };
        if replace {
            entry.generation += 1;
        }
        Ok(vec![TaskInfo {
            id: format!("task-{service}-{}", entry.generation),
            state: "running".to_string(),
            container_id: Some(Self::task_container(service, entry.generation)),
        }])
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A session wired to fresh fakes
pub struct TestHarness {
    pub engine: Arc<FakeEngine>,
    pub store: Arc<FakeStore>,
    pub session: Session,
}

impl TestHarness {
    pub fn new() -> Self {
        let store = FakeStore::new();
        let engine = FakeEngine::new(store.clone());
        let session = Session::new(engine.clone(), Arc::new(FakeConnector::new(store.clone())));
        Self { engine, store, session }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
