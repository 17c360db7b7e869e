//! collab::publisher
//!
//! Default step publisher.
//!
//! # Step types
//!
//! - `tag` - create an annotated release tag at the run's head
//! - `plugin` - dispatch the step's hook to its named plugin
//!
//! Idempotency: a `tag` step is already done when the tag (or a forge
//! release with the same name) exists; `plugin` steps delegate
//! idempotency to the plugin and always report not-done here.

use std::sync::Arc;

use async_trait::async_trait;

use super::git_inspector;
use super::traits::{Publisher, PublisherError, RepoInspector, StepOutcome};
use crate::core::run::{ReleaseRun, StepPlan};
use crate::plugin::{PluginHost, ReleaseContext};

/// Publisher handling `tag` and `plugin` steps.
pub struct HookPublisher {
    inspector: Arc<dyn RepoInspector>,
    plugins: Arc<PluginHost>,
}

impl HookPublisher {
    /// Create a publisher.
    pub fn new(inspector: Arc<dyn RepoInspector>, plugins: Arc<PluginHost>) -> Self {
        Self { inspector, plugins }
    }

    fn tag_name(run: &ReleaseRun) -> Result<String, PublisherError> {
        run.tag_name
            .clone()
            .ok_or_else(|| PublisherError::Git("run has no tag name".into()))
    }
}

#[async_trait]
impl Publisher for HookPublisher {
    async fn execute_step(
        &self,
        run: &ReleaseRun,
        step: &StepPlan,
    ) -> Result<StepOutcome, PublisherError> {
        match step.step_type.as_str() {
            "tag" => {
                let tag = Self::tag_name(run)?;
                let message = format!(
                    "Release {}",
                    run.version_next
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| tag.clone())
                );
                let created =
                    git_inspector::create_tag(&run.repo_root, &tag, &run.head_sha, &message)
                        .map_err(|e| PublisherError::Git(e.to_string()))?;
                if created {
                    Ok(StepOutcome::ok(format!("created tag {tag}")))
                } else {
                    Ok(StepOutcome::already_done(format!("tag {tag} already exists")))
                }
            }
            "plugin" => {
                let plugin = step
                    .plugin_name
                    .as_deref()
                    .ok_or_else(|| PublisherError::MissingPluginCoordinates(step.name.clone()))?;
                let hook = step
                    .hook
                    .as_deref()
                    .ok_or_else(|| PublisherError::MissingPluginCoordinates(step.name.clone()))?;

                let context = ReleaseContext::from_run(run);
                match self
                    .plugins
                    .execute_plugin(plugin, hook, &context, false)
                    .await
                {
                    Ok(response) if response.success => Ok(StepOutcome::ok(response.message)),
                    Ok(response) => Ok(StepOutcome::failed(
                        response
                            .error
                            .unwrap_or_else(|| format!("plugin {plugin} reported failure")),
                    )),
                    Err(e) => Ok(StepOutcome::failed(e.to_string())),
                }
            }
            other => Err(PublisherError::UnknownStepType(other.to_string())),
        }
    }

    async fn check_idempotency(
        &self,
        run: &ReleaseRun,
        step: &StepPlan,
    ) -> Result<bool, PublisherError> {
        match step.step_type.as_str() {
            "tag" => {
                let tag = Self::tag_name(run)?;
                let tagged = self
                    .inspector
                    .tag_exists(&tag)
                    .await
                    .map_err(|e| PublisherError::Git(e.to_string()))?;
                if tagged {
                    return Ok(true);
                }
                self.inspector
                    .release_exists(&tag)
                    .await
                    .map_err(|e| PublisherError::Git(e.to_string()))
            }
            _ => Ok(false),
        }
    }
}
