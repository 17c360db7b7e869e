//! plugin::host
//!
//! Plugin lifecycle and concurrent hook dispatch.
//!
//! # Architecture
//!
//! Plugins are registered at startup but not spawned. The first hook
//! dispatch that needs a plugin loads it exactly once (admission,
//! sandboxed spawn, handshake, config validation); later dispatches
//! reuse the running child. A plugin whose configuration declares its
//! hooks is never spawned for unrelated hooks; one that declares none is
//! loaded on first dispatch to discover them.
//!
//! # Dispatch guarantees
//!
//! - Fan-out is bounded by a semaphore (default 10 slots)
//! - A global deadline (default 2 minutes) covers the whole dispatch;
//!   per-plugin timeouts (default 30 s) are capped by what remains of it
//! - Responses come back in registration order regardless of completion
//!   order; slots cancelled before their plugin started are dropped
//! - Every execution, rejection, timeout, and load/unload writes an
//!   audit entry; a failing plugin never aborts its peers

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use super::admission;
use super::audit::{AuditEntry, AuditEventType, AuditLog};
use super::proto::{HookResponse, PluginError, PluginHandle, ReleaseContext};
use crate::core::config::{PluginConfig, PluginHostConfig, RepoConfig};

/// Default per-plugin execution timeout.
pub const DEFAULT_PLUGIN_TIMEOUT: Duration = Duration::from_secs(30);

struct RegisteredPlugin {
    config: PluginConfig,
    cell: tokio::sync::OnceCell<Arc<PluginHandle>>,
}

/// The plugin host: discovery, admission, sandbox, dispatch, teardown.
pub struct PluginHost {
    repo_root: PathBuf,
    audit: Arc<AuditLog>,
    semaphore: Arc<Semaphore>,
    global_timeout: Duration,
    plugins: RwLock<Vec<Arc<RegisteredPlugin>>>,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("repo_root", &self.repo_root)
            .field("global_timeout", &self.global_timeout)
            .finish()
    }
}

impl PluginHost {
    /// Create a host with explicit tuning.
    pub fn new(
        repo_root: impl Into<PathBuf>,
        host_config: &PluginHostConfig,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            audit,
            semaphore: Arc::new(Semaphore::new(host_config.max_concurrency.max(1))),
            global_timeout: Duration::from_secs(host_config.global_timeout_secs.max(1)),
            plugins: RwLock::new(Vec::new()),
        }
    }

    /// Create a host from the repository configuration, registering its
    /// plugins in order.
    pub fn from_config(
        repo_root: impl Into<PathBuf>,
        config: &RepoConfig,
        audit: Arc<AuditLog>,
    ) -> Self {
        let host_config = config.plugin_host.clone().unwrap_or_default();
        let host = Self::new(repo_root, &host_config, audit);
        for plugin in &config.plugins {
            host.register(plugin.clone());
        }
        host
    }

    /// Register a plugin without spawning it.
    pub fn register(&self, config: PluginConfig) {
        let mut plugins = self.plugins.write().expect("plugin registry poisoned");
        plugins.push(Arc::new(RegisteredPlugin {
            config,
            cell: tokio::sync::OnceCell::new(),
        }));
    }

    /// Names of registered plugins, in registration order.
    pub fn registered(&self) -> Vec<String> {
        self.plugins
            .read()
            .expect("plugin registry poisoned")
            .iter()
            .map(|p| p.config.name.clone())
            .collect()
    }

    /// Load a plugin if it is not already running.
    pub async fn ensure_loaded(&self, name: &str) -> Result<Arc<PluginHandle>, PluginError> {
        let reg = self
            .find(name)
            .ok_or_else(|| PluginError::NotRegistered(name.to_string()))?;
        ensure_loaded(&reg, &self.repo_root, &self.audit).await
    }

    fn find(&self, name: &str) -> Option<Arc<RegisteredPlugin>> {
        self.plugins
            .read()
            .expect("plugin registry poisoned")
            .iter()
            .find(|p| p.config.name == name)
            .cloned()
    }

    /// Dispatch one hook to every plugin that handles it.
    ///
    /// Returns responses in registration order. Plugin failures are
    /// responses, not errors; only slots cancelled before their plugin
    /// started are absent from the result.
    pub async fn execute_hook(
        &self,
        hook: &str,
        context: &ReleaseContext,
        dry_run: bool,
    ) -> Vec<HookResponse> {
        let candidates: Vec<Arc<RegisteredPlugin>> = {
            let plugins = self.plugins.read().expect("plugin registry poisoned");
            plugins
                .iter()
                .filter(|reg| match reg.cell.get() {
                    Some(handle) => handle.supports_hook(hook),
                    None => {
                        reg.config.hooks.is_empty()
                            || reg.config.hooks.iter().any(|h| h == hook)
                    }
                })
                .cloned()
                .collect()
        };

        let deadline = Instant::now() + self.global_timeout;
        let mut tasks = Vec::with_capacity(candidates.len());
        for reg in candidates {
            let semaphore = self.semaphore.clone();
            let audit = self.audit.clone();
            let repo_root = self.repo_root.clone();
            let hook = hook.to_string();
            let context = context.clone();
            tasks.push(tokio::spawn(async move {
                dispatch_one(reg, repo_root, audit, semaphore, deadline, hook, context, dry_run)
                    .await
            }));
        }

        // Await in spawn order; completion order is irrelevant to the
        // caller-visible ordering.
        let mut responses = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(Some(response)) => responses.push(response),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "plugin dispatch task panicked"),
            }
        }
        responses
    }

    /// Execute one hook on one named plugin (used for `plugin` publishing
    /// steps).
    pub async fn execute_plugin(
        &self,
        name: &str,
        hook: &str,
        context: &ReleaseContext,
        dry_run: bool,
    ) -> Result<HookResponse, PluginError> {
        let reg = self
            .find(name)
            .ok_or_else(|| PluginError::NotRegistered(name.to_string()))?;
        let handle = ensure_loaded(&reg, &self.repo_root, &self.audit).await?;

        let timeout = reg
            .config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PLUGIN_TIMEOUT);
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            timeout,
            handle.execute(hook, &reg.config.settings, context, dry_run),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(response)) => {
                self.audit.record(audit_execute(name, hook, &response, duration_ms));
                Ok(response)
            }
            Ok(Err(e)) => {
                self.audit.record(
                    AuditEntry::now(name, AuditEventType::Error)
                        .hook(hook)
                        .duration_ms(duration_ms)
                        .error(e.to_string()),
                );
                Err(e)
            }
            Err(_) => {
                self.audit.record(
                    AuditEntry::now(name, AuditEventType::Timeout)
                        .hook(hook)
                        .duration_ms(duration_ms)
                        .error(format!("timed out after {:.1}s", timeout.as_secs_f64())),
                );
                Err(PluginError::Timeout {
                    name: name.to_string(),
                    seconds: timeout.as_secs_f64(),
                })
            }
        }
    }

    /// Kill every running child and write an unload audit entry per
    /// plugin.
    pub async fn close(&self) {
        let plugins: Vec<Arc<RegisteredPlugin>> = {
            let plugins = self.plugins.read().expect("plugin registry poisoned");
            plugins.clone()
        };
        for reg in plugins {
            if let Some(handle) = reg.cell.get() {
                handle.shutdown().await;
                self.audit
                    .record(AuditEntry::now(&reg.config.name, AuditEventType::Unload));
            }
        }
    }
}

/// Load-once guard around admission + spawn + handshake + validate.
async fn ensure_loaded(
    reg: &Arc<RegisteredPlugin>,
    repo_root: &Path,
    audit: &Arc<AuditLog>,
) -> Result<Arc<PluginHandle>, PluginError> {
    reg.cell
        .get_or_try_init(|| load_plugin(&reg.config, repo_root, audit))
        .await
        .cloned()
}

async fn load_plugin(
    config: &PluginConfig,
    repo_root: &Path,
    audit: &Arc<AuditLog>,
) -> Result<Arc<PluginHandle>, PluginError> {
    let name = &config.name;

    let candidate = match &config.path {
        Some(path) => PathBuf::from(path),
        None => admission::discover_binary(name, repo_root).ok_or_else(|| {
            let err = admission::AdmissionError::NotFound(name.clone());
            audit.record(
                AuditEntry::now(name, AuditEventType::Rejected).error(err.to_string()),
            );
            PluginError::Admission(err)
        })?,
    };

    let resolved = match admission::admit_binary(name, &candidate, repo_root) {
        Ok(resolved) => resolved,
        Err(err) => {
            audit.record(
                AuditEntry::now(name, AuditEventType::Rejected).error(err.to_string()),
            );
            return Err(PluginError::Admission(err));
        }
    };

    let started = std::time::Instant::now();
    let handle = match PluginHandle::launch(config, &resolved).await {
        Ok(handle) => handle,
        Err(e) => {
            audit.record(AuditEntry::now(name, AuditEventType::Error).error(e.to_string()));
            return Err(e);
        }
    };

    if let Err(e) = handle.validate(&config.settings).await {
        // A plugin that fails validation is killed, not kept half-loaded.
        handle.shutdown().await;
        audit.record(AuditEntry::now(name, AuditEventType::Error).error(e.to_string()));
        return Err(e);
    }

    audit.record(
        AuditEntry::now(name, AuditEventType::Load)
            .duration_ms(started.elapsed().as_millis() as u64),
    );
    tracing::debug!(plugin = %name, hooks = ?handle.info().hooks, "plugin loaded");
    Ok(Arc::new(handle))
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_one(
    reg: Arc<RegisteredPlugin>,
    repo_root: PathBuf,
    audit: Arc<AuditLog>,
    semaphore: Arc<Semaphore>,
    deadline: Instant,
    hook: String,
    context: ReleaseContext,
    dry_run: bool,
) -> Option<HookResponse> {
    let name = reg.config.name.clone();

    // Cancelled before a slot opened: drop the record entirely.
    let permit = match tokio::time::timeout_at(deadline, semaphore.acquire_owned()).await {
        Ok(Ok(permit)) => permit,
        _ => return None,
    };

    let handle = match tokio::time::timeout_at(
        deadline,
        ensure_loaded(&reg, &repo_root, &audit),
    )
    .await
    {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            // Load failures were audited inside load_plugin.
            return Some(HookResponse::host_failure(&name, &hook, e.to_string()));
        }
        Err(_) => return None,
    };

    // Loaded-to-discover plugins may turn out not to handle this hook.
    if !handle.supports_hook(&hook) {
        return None;
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return None;
    }
    let per_call = reg
        .config
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_PLUGIN_TIMEOUT)
        .min(remaining);

    let started = std::time::Instant::now();
    let result = tokio::time::timeout(
        per_call,
        handle.execute(&hook, &reg.config.settings, &context, dry_run),
    )
    .await;
    let duration_ms = started.elapsed().as_millis() as u64;
    drop(permit);

    match result {
        Ok(Ok(response)) => {
            audit.record(audit_execute(&name, &hook, &response, duration_ms));
            Some(response)
        }
        Ok(Err(e)) => {
            audit.record(
                AuditEntry::now(&name, AuditEventType::Error)
                    .hook(&hook)
                    .duration_ms(duration_ms)
                    .error(e.to_string()),
            );
            Some(HookResponse::host_failure(&name, &hook, e.to_string()))
        }
        Err(_) => {
            let message = format!("timed out after {:.1}s", per_call.as_secs_f64());
            audit.record(
                AuditEntry::now(&name, AuditEventType::Timeout)
                    .hook(&hook)
                    .duration_ms(duration_ms)
                    .error(message.clone()),
            );
            Some(HookResponse::host_failure(&name, &hook, message))
        }
    }
}

fn audit_execute(name: &str, hook: &str, response: &HookResponse, duration_ms: u64) -> AuditEntry {
    let mut entry = AuditEntry::now(name, AuditEventType::Execute)
        .hook(hook)
        .duration_ms(duration_ms)
        .success(response.success);
    entry.error = response.error.clone();
    entry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> PluginHost {
        PluginHost::new(
            "/tmp/repo",
            &PluginHostConfig::default(),
            Arc::new(AuditLog::disabled()),
        )
    }

    fn plugin(name: &str, hooks: &[&str]) -> PluginConfig {
        PluginConfig {
            name: name.to_string(),
            hooks: hooks.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn registration_preserves_order() {
        let host = host();
        host.register(plugin("one", &["pre_plan"]));
        host.register(plugin("two", &["post_publish"]));
        host.register(plugin("three", &[]));
        assert_eq!(host.registered(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn unregistered_plugin_is_an_error() {
        let host = host();
        let err = host.ensure_loaded("ghost").await.unwrap_err();
        assert!(matches!(err, PluginError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn dispatch_skips_unrelated_hooks_entirely() {
        // "one" declares hooks not containing the dispatched hook, so the
        // host must not even attempt to spawn its (nonexistent) binary.
        let host = host();
        host.register(plugin("one", &["pre_plan"]));
        let responses = host
            .execute_hook("post_publish", &ReleaseContext::default(), false)
            .await;
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn dispatch_reports_load_failure_for_declared_hook() {
        let host = host();
        host.register(plugin("one", &["post_publish"]));
        let responses = host
            .execute_hook("post_publish", &ReleaseContext::default(), false)
            .await;
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].success);
        assert!(responses[0].error.as_deref().unwrap().contains("not found"));
    }
}
