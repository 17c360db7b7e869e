//! plugin::proto
//!
//! The host <-> plugin wire contract.
//!
//! # Protocol
//!
//! A plugin is an external executable. On start it prints one handshake
//! banner line on stdout:
//!
//! ```text
//! {"capstan_plugin": 1, "name": "announce", "version": "0.3.0", "hooks": ["post_publish"]}
//! ```
//!
//! after which the host drives it with newline-delimited JSON requests
//! on stdin, one response line per request:
//!
//! ```text
//! -> {"id": 1, "method": "validate", "params": {"config": {...}}}
//! <- {"id": 1, "result": null}
//! -> {"id": 2, "method": "execute", "params": {"hook": "...", "config": {...}, "context": {...}, "dry_run": false}}
//! <- {"id": 2, "result": {"success": true, "message": "posted", "outputs": {}, "artifacts": []}}
//! ```
//!
//! The launcher rejects children whose banner names an unsupported
//! protocol version. Request ids are monotone per child; responses are
//! matched by id. Timeouts are the caller's concern; every RPC here
//! blocks until the child answers or dies.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};

use super::admission::AdmissionError;
use super::sandbox;
use crate::core::config::PluginConfig;
use crate::core::run::ReleaseRun;

/// The protocol version this host speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// How long a child may take to print its handshake banner.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Errors from plugin transport and lifecycle.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Admission rejected the binary.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// No plugin with this name is registered.
    #[error("plugin not registered: {0}")]
    NotRegistered(String),

    /// The child process could not be spawned.
    #[error("failed to spawn plugin '{name}': {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    /// The child did not complete the handshake.
    #[error("plugin '{name}' handshake failed: {message}")]
    Handshake { name: String, message: String },

    /// The child speaks a protocol this host does not.
    #[error("plugin '{name}' speaks protocol {version}, host supports {PROTOCOL_VERSION}")]
    UnsupportedProtocol { name: String, version: u32 },

    /// Transport-level RPC failure (child died, wrote garbage).
    #[error("plugin '{name}' rpc failed: {message}")]
    Rpc { name: String, message: String },

    /// The plugin answered an RPC with an error.
    #[error("plugin '{name}' returned error: {message}")]
    Remote { name: String, message: String },

    /// A per-call timeout fired.
    #[error("plugin '{name}' timed out after {seconds:.1}s")]
    Timeout { name: String, seconds: f64 },

    /// Work was cancelled before or during execution.
    #[error("plugin '{name}' cancelled: {cause}")]
    Cancelled { name: String, cause: String },
}

/// Identity and capabilities a plugin reports in its handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin-reported name.
    pub name: String,
    /// Plugin-reported version.
    pub version: String,
    /// Hooks the plugin handles.
    pub hooks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HandshakeBanner {
    capstan_plugin: u32,
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    hooks: Vec<String>,
}

/// The release context shipped to plugins on every hook execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseContext {
    /// The run id.
    pub run_id: String,
    /// Logical repository identity.
    pub repo_id: String,
    /// Repository root path.
    pub repo_root: String,
    /// Current workflow state.
    pub state: String,
    /// The head being released.
    pub head_sha: String,
    /// Base of the commit window.
    pub base_ref: String,
    /// Current released version, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_current: Option<String>,
    /// Next version, if decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_next: Option<String>,
    /// Tag to be created, if decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
    /// Release notes text, once generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Assessed risk score.
    pub risk_score: f64,
}

impl ReleaseContext {
    /// Build the context from a run.
    pub fn from_run(run: &ReleaseRun) -> Self {
        Self {
            run_id: run.id.to_string(),
            repo_id: run.repo_id.clone(),
            repo_root: run.repo_root.display().to_string(),
            state: run.state.to_string(),
            head_sha: run.head_sha.to_string(),
            base_ref: run.base_ref.clone(),
            version_current: run.version_current.as_ref().map(|v| v.to_string()),
            version_next: run.version_next.as_ref().map(|v| v.to_string()),
            tag_name: run.tag_name.clone(),
            notes: run.notes.as_ref().map(|n| n.text.clone()),
            risk_score: run.risk_score,
        }
    }
}

/// One plugin's answer to a hook execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookResponse {
    /// The responding plugin.
    pub plugin: String,
    /// The hook that was dispatched.
    pub hook: String,
    /// Whether the plugin reported success.
    pub success: bool,
    /// Human-readable result message.
    pub message: String,
    /// Failure message, when unsuccessful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured outputs for downstream steps.
    #[serde(default)]
    pub outputs: serde_json::Map<String, serde_json::Value>,
    /// Paths or URLs of artifacts the plugin produced.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Wall-clock execution time in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

impl HookResponse {
    /// A failure response fabricated by the host (timeout, cancellation,
    /// transport error).
    pub fn host_failure(plugin: &str, hook: &str, error: impl Into<String>) -> Self {
        Self {
            plugin: plugin.to_string(),
            hook: hook.to_string(),
            success: false,
            message: String::new(),
            error: Some(error.into()),
            outputs: serde_json::Map::new(),
            artifacts: Vec::new(),
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireExecuteResult {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    outputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    artifacts: Vec<String>,
}

struct HandleIo {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

/// A running plugin child with its negotiated identity.
///
/// RPC I/O is serialized behind an async mutex so concurrent hook
/// dispatches against the same plugin cannot interleave request lines.
pub struct PluginHandle {
    name: String,
    info: PluginInfo,
    io: tokio::sync::Mutex<HandleIo>,
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name)
            .field("info", &self.info)
            .finish()
    }
}

impl PluginHandle {
    /// Spawn a plugin child, apply the sandbox, and complete the
    /// handshake.
    ///
    /// `resolved_path` must already have passed admission.
    pub async fn launch(
        config: &PluginConfig,
        resolved_path: &std::path::Path,
    ) -> Result<Self, PluginError> {
        let name = config.name.clone();

        let mut command = tokio::process::Command::new(resolved_path);
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        sandbox::apply(
            &mut command,
            &config.capabilities,
            &config.env_allowlist,
            &config.limits,
        );

        let mut child = command.spawn().map_err(|source| PluginError::Spawn {
            name: name.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| PluginError::Handshake {
            name: name.clone(),
            message: "no stdin pipe".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PluginError::Handshake {
            name: name.clone(),
            message: "no stdout pipe".into(),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let banner_line = tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next_line())
            .await
            .map_err(|_| PluginError::Handshake {
                name: name.clone(),
                message: format!("no banner within {}s", HANDSHAKE_TIMEOUT.as_secs()),
            })?
            .map_err(|e| PluginError::Handshake {
                name: name.clone(),
                message: e.to_string(),
            })?
            .ok_or_else(|| PluginError::Handshake {
                name: name.clone(),
                message: "child closed stdout before handshake".into(),
            })?;

        let banner: HandshakeBanner =
            serde_json::from_str(&banner_line).map_err(|e| PluginError::Handshake {
                name: name.clone(),
                message: format!("unparseable banner: {e}"),
            })?;
        if banner.capstan_plugin != PROTOCOL_VERSION {
            // The child is useless to us; reap it before erroring.
            let _ = child.start_kill();
            return Err(PluginError::UnsupportedProtocol {
                name,
                version: banner.capstan_plugin,
            });
        }

        Ok(Self {
            name,
            info: PluginInfo {
                name: banner.name,
                version: banner.version,
                hooks: banner.hooks,
            },
            io: tokio::sync::Mutex::new(HandleIo {
                child,
                stdin,
                stdout: lines,
                next_id: 1,
            }),
        })
    }

    /// The identity the plugin reported at handshake.
    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    /// Whether the plugin advertises a hook.
    pub fn supports_hook(&self, hook: &str) -> bool {
        self.info.hooks.iter().any(|h| h == hook)
    }

    /// Perform one RPC round-trip. No timeout of its own.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError> {
        let mut io = self.io.lock().await;
        let id = io.next_id;
        io.next_id += 1;

        let request = RpcRequest { id, method, params };
        let mut line = serde_json::to_string(&request).map_err(|e| PluginError::Rpc {
            name: self.name.clone(),
            message: e.to_string(),
        })?;
        line.push('\n');
        io.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.rpc_err(e.to_string()))?;
        io.stdin
            .flush()
            .await
            .map_err(|e| self.rpc_err(e.to_string()))?;

        loop {
            let response_line = io
                .stdout
                .next_line()
                .await
                .map_err(|e| self.rpc_err(e.to_string()))?
                .ok_or_else(|| self.rpc_err("child closed stdout".into()))?;
            let response: RpcResponse = match serde_json::from_str(&response_line) {
                Ok(response) => response,
                Err(e) => return Err(self.rpc_err(format!("unparseable response: {e}"))),
            };
            if response.id != id {
                // A response to a request the host gave up on; drop it.
                continue;
            }
            if let Some(error) = response.error {
                return Err(PluginError::Remote {
                    name: self.name.clone(),
                    message: error,
                });
            }
            return Ok(response.result.unwrap_or(serde_json::Value::Null));
        }
    }

    fn rpc_err(&self, message: String) -> PluginError {
        PluginError::Rpc {
            name: self.name.clone(),
            message,
        }
    }

    /// Ask the plugin to validate its configuration.
    pub async fn validate(&self, settings: &toml::Table) -> Result<(), PluginError> {
        let params = serde_json::json!({
            "config": settings_to_json(settings),
        });
        self.call("validate", params).await.map(|_| ())
    }

    /// Execute one hook.
    pub async fn execute(
        &self,
        hook: &str,
        settings: &toml::Table,
        context: &ReleaseContext,
        dry_run: bool,
    ) -> Result<HookResponse, PluginError> {
        let params = serde_json::json!({
            "hook": hook,
            "config": settings_to_json(settings),
            "context": context,
            "dry_run": dry_run,
        });
        let started = std::time::Instant::now();
        let result = self.call("execute", params).await?;
        let wire: WireExecuteResult =
            serde_json::from_value(result).map_err(|e| self.rpc_err(format!(
                "malformed execute result: {e}"
            )))?;
        Ok(HookResponse {
            plugin: self.name.clone(),
            hook: hook.to_string(),
            success: wire.success,
            message: wire.message,
            error: wire.error,
            outputs: wire.outputs,
            artifacts: wire.artifacts,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Stop the child: polite shutdown request, then kill.
    pub async fn shutdown(&self) {
        let mut io = self.io.lock().await;
        let id = io.next_id;
        io.next_id += 1;
        let request = serde_json::json!({"id": id, "method": "shutdown", "params": null});
        let _ = io
            .stdin
            .write_all(format!("{request}\n").as_bytes())
            .await;
        let _ = io.stdin.flush().await;
        let _ = io.child.start_kill();
        let _ = io.child.wait().await;
    }
}

fn settings_to_json(settings: &toml::Table) -> serde_json::Value {
    serde_json::to_value(settings).unwrap_or(serde_json::Value::Null)
}
