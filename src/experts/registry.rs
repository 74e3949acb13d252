//! Worker registry: canonical names, aliases, capabilities and health checks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::error::RegistryError;
use crate::experts::entrypoints::{EntrypointTable, ExpertContext};
use crate::experts::{Expert, ExpertEntry};

static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\-]+").expect("separator pattern is valid"));

const AUTO_ALIAS_SUFFIX: &str = "_expert";

/// Canonical form of a name, alias or capability token.
pub fn normalize_name(raw: &str) -> String {
    SEPARATORS
        .replace_all(raw.trim(), "_")
        .to_lowercase()
}

/// Builds a fresh worker instance.
pub type ExpertFactory = Arc<dyn Fn() -> Arc<dyn Expert> + Send + Sync>;

/// Health check callback. `Err` carries the failure message.
pub type HealthCheckFn = Arc<dyn Fn() -> Result<HealthProbe, String> + Send + Sync>;

/// Raw health check result before normalisation.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthProbe {
    Flag(bool),
    Nothing,
    Details(serde_json::Map<String, serde_json::Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
    Error,
}

/// Normalised health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub name: String,
    pub state: HealthState,
    pub details: serde_json::Map<String, serde_json::Value>,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    fn new(name: &str, state: HealthState) -> Self {
        Self {
            name: name.to_string(),
            state,
            details: serde_json::Map::new(),
            checked_at: Utc::now(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    fn from_probe(name: &str, probe: HealthProbe) -> Self {
        match probe {
            HealthProbe::Flag(true) => Self::new(name, HealthState::Healthy),
            HealthProbe::Flag(false) => Self::new(name, HealthState::Unhealthy),
            HealthProbe::Nothing => Self::new(name, HealthState::Unknown),
            HealthProbe::Details(details) => {
                let state = match details.get("healthy").and_then(|v| v.as_bool()) {
                    Some(true) => HealthState::Healthy,
                    Some(false) => HealthState::Unhealthy,
                    None => match details.get("status").and_then(|v| v.as_str()) {
                        Some("healthy") | Some("ok") => HealthState::Healthy,
                        Some("unhealthy") | Some("down") => HealthState::Unhealthy,
                        Some("error") => HealthState::Error,
                        _ => HealthState::Healthy,
                    },
                };
                Self {
                    name: name.to_string(),
                    state,
                    details,
                    checked_at: Utc::now(),
                }
            }
        }
    }
}

/// Immutable registry entry. Changes produce a new descriptor.
#[derive(Clone)]
pub struct ExpertDescriptor {
    pub name: String,
    pub aliases: BTreeSet<String>,
    pub capabilities: BTreeSet<String>,
    pub layer: Option<String>,
    pub kind: Option<String>,
    pub enabled: bool,
    pub description: Option<String>,
    pub entrypoint: Option<String>,
    pub healthcheck: Option<HealthCheckFn>,
    pub factory: Option<ExpertFactory>,
}

impl ExpertDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: BTreeSet::new(),
            capabilities: BTreeSet::new(),
            layer: None,
            kind: None,
            enabled: true,
            description: None,
            entrypoint: None,
            healthcheck: None,
            factory: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.insert(alias.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    pub fn with_healthcheck(
        mut self,
        check: impl Fn() -> Result<HealthProbe, String> + Send + Sync + 'static,
    ) -> Self {
        self.healthcheck = Some(Arc::new(check));
        self
    }

    pub fn with_factory(
        mut self,
        factory: impl Fn() -> Arc<dyn Expert> + Send + Sync + 'static,
    ) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Share one worker instance across every dispatch.
    pub fn with_instance(self, expert: Arc<dyn Expert>) -> Self {
        self.with_factory(move || expert.clone())
    }

    /// Descriptor skeleton from a roster entry (no factory yet).
    pub fn from_entry(entry: &ExpertEntry) -> Self {
        let mut descriptor = Self::new(&entry.name)
            .with_capabilities(entry.capabilities.iter().cloned())
            .with_enabled(entry.enabled);
        descriptor.aliases.extend(entry.aliases.iter().cloned());
        descriptor.layer = entry.layer.clone();
        descriptor.kind = entry.kind.clone();
        descriptor.description = entry.description.clone();
        descriptor.entrypoint = entry.entrypoint.clone();
        descriptor
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(&normalize_name(capability))
    }

    /// Build a worker, if this descriptor knows how.
    pub fn instantiate(&self) -> Option<Arc<dyn Expert>> {
        self.factory.as_ref().map(|factory| factory())
    }

    /// Normalise names and derive capability tokens from layer and kind.
    fn normalized(mut self) -> Self {
        self.name = normalize_name(&self.name);
        self.aliases = self
            .aliases
            .iter()
            .map(|a| normalize_name(a))
            .filter(|a| !a.is_empty() && *a != self.name)
            .collect();

        let mut capabilities: BTreeSet<String> = self
            .capabilities
            .iter()
            .map(|c| normalize_name(c))
            .filter(|c| !c.is_empty())
            .collect();
        for tag in [&self.layer, &self.kind].into_iter().flatten() {
            let tag = normalize_name(tag);
            if !tag.is_empty() {
                capabilities.insert(tag);
            }
        }
        self.capabilities = capabilities;
        self
    }
}

impl std::fmt::Debug for ExpertDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpertDescriptor")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("capabilities", &self.capabilities)
            .field("layer", &self.layer)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("entrypoint", &self.entrypoint)
            .field("has_healthcheck", &self.healthcheck.is_some())
            .field("has_factory", &self.factory.is_some())
            .finish()
    }
}

/// Filter for `WorkerRegistry::list`. Every set field must match.
#[derive(Debug, Clone, Default)]
pub struct ExpertFilter {
    pub layer: Option<String>,
    pub kind: Option<String>,
    /// Descriptors must carry all of these.
    pub capabilities: Vec<String>,
    pub include_disabled: bool,
}

impl ExpertFilter {
    fn matches(&self, descriptor: &ExpertDescriptor) -> bool {
        if !self.include_disabled && !descriptor.enabled {
            return false;
        }
        let tag_matches = |wanted: &Option<String>, actual: &Option<String>| match wanted {
            Some(wanted) => actual
                .as_deref()
                .is_some_and(|a| normalize_name(a) == normalize_name(wanted)),
            None => true,
        };
        tag_matches(&self.layer, &descriptor.layer)
            && tag_matches(&self.kind, &descriptor.kind)
            && self.capabilities.iter().all(|c| descriptor.has_capability(c))
    }
}

#[derive(Default)]
struct Indexes {
    experts: HashMap<String, Arc<ExpertDescriptor>>,
    /// alias → canonical name
    aliases: HashMap<String, String>,
}

impl Indexes {
    fn resolve(&self, key: &str) -> Option<&Arc<ExpertDescriptor>> {
        self.experts.get(key).or_else(|| {
            self.aliases
                .get(key)
                .and_then(|canonical| self.experts.get(canonical))
        })
    }

    /// Drop every alias pointing at `name`.
    fn release_aliases(&mut self, name: &str) {
        self.aliases.retain(|_, owner| owner != name);
    }

    /// Take `alias` away from its current owner, rewriting that owner's descriptor.
    fn steal_alias(&mut self, alias: &str, new_owner: &str) {
        let Some(previous) = self.aliases.insert(alias.to_string(), new_owner.to_string()) else {
            return;
        };
        if previous == new_owner {
            return;
        }
        tracing::warn!(
            alias,
            previous = %previous,
            new_owner,
            "Alias collision, latest registration wins"
        );
        if let Some(old) = self.experts.get(&previous) {
            let mut updated = (**old).clone();
            updated.aliases.remove(alias);
            self.experts.insert(previous, Arc::new(updated));
        }
    }
}

/// Thread-safe registry of experts.
///
/// One mutex guards both indexes; every read takes a snapshot (`Arc` clones)
/// and releases the lock before returning.
#[derive(Default)]
pub struct WorkerRegistry {
    inner: Mutex<Indexes>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Indexes> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or atomically replace) an expert.
    ///
    /// Explicit aliases always win over earlier claims. The automatic alias
    /// (name without a trailing `_expert`) is only added when unclaimed.
    pub fn register(
        &self,
        descriptor: ExpertDescriptor,
    ) -> Result<Arc<ExpertDescriptor>, RegistryError> {
        let mut descriptor = descriptor.normalized();
        if descriptor.name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let name = descriptor.name.clone();

        let mut indexes = self.lock();
        indexes.release_aliases(&name);

        if let Some(auto) = name.strip_suffix(AUTO_ALIAS_SUFFIX)
            && !auto.is_empty()
            && !descriptor.aliases.contains(auto)
        {
            let claimed_by_other = indexes.experts.contains_key(auto)
                || indexes.aliases.get(auto).is_some_and(|owner| *owner != name);
            if claimed_by_other {
                tracing::warn!(
                    expert = %name,
                    alias = auto,
                    "Automatic alias already claimed, not overriding"
                );
            } else {
                descriptor.aliases.insert(auto.to_string());
            }
        }

        for alias in &descriptor.aliases {
            indexes.steal_alias(alias, &name);
        }

        let descriptor = Arc::new(descriptor);
        if indexes
            .experts
            .insert(name.clone(), descriptor.clone())
            .is_some()
        {
            tracing::info!(expert = %name, "Replaced expert registration");
        } else {
            tracing::debug!(expert = %name, "Registered expert");
        }
        Ok(descriptor)
    }

    /// Remove an expert and all of its aliases.
    pub fn deregister(&self, name: &str) -> Option<Arc<ExpertDescriptor>> {
        let key = normalize_name(name);
        let mut indexes = self.lock();
        let canonical = indexes.resolve(&key)?.name.clone();
        indexes.release_aliases(&canonical);
        let removed = indexes.experts.remove(&canonical);
        tracing::debug!(expert = %canonical, "Deregistered expert");
        removed
    }

    pub fn enable(&self, name: &str) -> Result<Arc<ExpertDescriptor>, RegistryError> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<Arc<ExpertDescriptor>, RegistryError> {
        self.set_enabled(name, false)
    }

    fn set_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<Arc<ExpertDescriptor>, RegistryError> {
        let key = normalize_name(name);
        let mut indexes = self.lock();
        let current = indexes
            .resolve(&key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })?;
        if current.enabled == enabled {
            return Ok(current);
        }
        let updated = Arc::new((*current).clone().with_enabled(enabled));
        indexes
            .experts
            .insert(updated.name.clone(), updated.clone());
        tracing::info!(expert = %updated.name, enabled, "Expert toggled");
        Ok(updated)
    }

    /// Resolve a name or alias. Disabled experts only when `include_disabled`.
    pub fn get(&self, name: &str, include_disabled: bool) -> Option<Arc<ExpertDescriptor>> {
        let key = normalize_name(name);
        let indexes = self.lock();
        indexes
            .resolve(&key)
            .filter(|d| include_disabled || d.enabled)
            .cloned()
    }

    /// Canonical name an alias points to.
    pub fn resolve_alias(&self, alias: &str) -> Option<String> {
        self.lock().aliases.get(&normalize_name(alias)).cloned()
    }

    /// Matching descriptors sorted by name.
    pub fn list(&self, filter: &ExpertFilter) -> Vec<Arc<ExpertDescriptor>> {
        let mut matches: Vec<Arc<ExpertDescriptor>> = self
            .lock()
            .experts
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        matches
    }

    /// Enabled experts carrying `capability`, sorted by name.
    pub fn select_by_capability(
        &self,
        capability: &str,
        limit: Option<usize>,
    ) -> Vec<Arc<ExpertDescriptor>> {
        let filter = ExpertFilter {
            capabilities: vec![capability.to_string()],
            ..Default::default()
        };
        let mut selected = self.list(&filter);
        if let Some(limit) = limit {
            selected.truncate(limit);
        }
        selected
    }

    /// Run one expert's health check. Failures are reported, never propagated.
    pub fn run_healthcheck(&self, name: &str) -> Result<HealthStatus, RegistryError> {
        let descriptor = self
            .get(name, true)
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })?;
        Ok(check_descriptor(&descriptor))
    }

    /// Health of every registered expert, sorted by name.
    pub fn run_all_healthchecks(&self) -> Vec<HealthStatus> {
        let filter = ExpertFilter {
            include_disabled: true,
            ..Default::default()
        };
        self.list(&filter)
            .iter()
            .map(|d| check_descriptor(d))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register every roster entry, resolving entrypoints through `table`.
    ///
    /// Entries that fail to resolve are skipped with a warning. Returns the
    /// number registered.
    pub fn bootstrap(
        &self,
        entries: &[ExpertEntry],
        table: &EntrypointTable,
        ctx: &ExpertContext,
    ) -> usize {
        let mut registered = 0;
        for entry in entries {
            let mut descriptor = ExpertDescriptor::from_entry(entry);
            if let Some(key) = &entry.entrypoint {
                match table.build(key, &descriptor, ctx) {
                    Ok(factory) => descriptor.factory = Some(factory),
                    Err(e) => {
                        tracing::warn!(
                            expert = %entry.name,
                            entrypoint = %key,
                            error = %e,
                            "Skipping expert registration"
                        );
                        continue;
                    }
                }
            }
            match self.register(descriptor) {
                Ok(_) => registered += 1,
                Err(e) => {
                    tracing::warn!(expert = %entry.name, error = %e, "Skipping expert registration")
                }
            }
        }
        tracing::info!(registered, total = entries.len(), "Expert roster loaded");
        registered
    }
}

fn check_descriptor(descriptor: &ExpertDescriptor) -> HealthStatus {
    let name = descriptor.name.as_str();
    let Some(check) = &descriptor.healthcheck else {
        return HealthStatus::new(name, HealthState::Unknown)
            .with_detail("reason", "no healthcheck registered");
    };

    match std::panic::catch_unwind(AssertUnwindSafe(|| check())) {
        Ok(Ok(probe)) => HealthStatus::from_probe(name, probe),
        Ok(Err(message)) => {
            tracing::warn!(expert = name, error = %message, "Health check failed");
            HealthStatus::new(name, HealthState::Error).with_detail("error", message)
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::warn!(expert = name, error = %message, "Health check panicked");
            HealthStatus::new(name, HealthState::Error).with_detail("error", message)
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Snapshot of capability → canonical names, for diagnostics.
pub fn capability_index(registry: &WorkerRegistry) -> BTreeMap<String, Vec<String>> {
    let mut index: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for descriptor in registry.list(&ExpertFilter::default()) {
        for capability in &descriptor.capabilities {
            index
                .entry(capability.clone())
                .or_default()
                .push(descriptor.name.clone());
        }
    }
    index
}
