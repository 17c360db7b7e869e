//! cli::commands
//!
//! Command handlers: translate parsed arguments into engine inputs and
//! render outputs.
//!
//! Handlers never touch run state directly; everything flows through
//! the engine's orchestrators.

use anyhow::{Context as _, Result};

use super::args::Command;
use crate::core::machine;
use crate::core::types::{Actor, RunId};
use crate::core::version::Version;
use crate::engine::{self, Deps};
use crate::ui::output::{self, Verbosity};

/// Everything a handler needs beyond its own arguments.
pub struct Context {
    /// Engine dependencies for the target repository.
    pub deps: Deps,
    /// The acting identity.
    pub actor: Actor,
    /// JSON output requested.
    pub json: bool,
    /// Output verbosity.
    pub verbosity: Verbosity,
}

fn parse_run_id(run: Option<String>) -> Result<Option<RunId>> {
    run.map(|r| RunId::new(r).context("invalid --run value"))
        .transpose()
}

fn parse_version(version: Option<String>) -> Result<Option<Version>> {
    version
        .map(|v| Version::parse(&v).context("invalid --version value"))
        .transpose()
}

fn render<T: serde::Serialize>(ctx: &Context, value: &T, human: String) -> Result<()> {
    if ctx.json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        output::print(human, ctx.verbosity);
    }
    Ok(())
}

/// Dispatch a parsed command.
pub async fn dispatch(command: Command, ctx: &Context) -> Result<()> {
    match command {
        Command::Plan {
            base,
            tag,
            set_version,
            force,
        } => {
            let mut input = engine::plan::PlanInput::for_actor(ctx.actor.clone());
            input.base_ref = base;
            input.tag_name = tag;
            input.version = parse_version(set_version)?;
            input.force = force;

            let out = engine::plan::plan(&ctx.deps, input).await?;
            render(
                ctx,
                &out,
                format!(
                    "planned run {} ({} commit{}, risk {:.2}) -> {}",
                    out.run_id,
                    out.commit_count,
                    if out.commit_count == 1 { "" } else { "s" },
                    out.risk_score,
                    out.state
                ),
            )
        }

        Command::Bump {
            run,
            set_version,
            tag,
            force,
        } => {
            let mut input = engine::bump::BumpInput::for_actor(ctx.actor.clone());
            input.run_id = parse_run_id(run)?;
            input.version_override = parse_version(set_version)?;
            input.tag_name = tag;
            input.force = force;

            let out = engine::bump::bump(&ctx.deps, input).await?;
            render(
                ctx,
                &out,
                format!("version {} (tag {}) -> {}", out.version_next, out.tag_name, out.state),
            )
        }

        Command::Notes {
            run,
            audience,
            tone,
            force,
        } => {
            let mut input = engine::notes::NotesInput::for_actor(ctx.actor.clone());
            input.run_id = parse_run_id(run)?;
            input.audience = audience;
            input.tone = tone;
            input.force = force;

            let out = engine::notes::generate_notes(&ctx.deps, input).await?;
            let human = if out.cached {
                format!("notes unchanged (cached) -> {}", out.state)
            } else {
                format!("notes generated -> {}\n\n{}", out.state, out.text)
            };
            render(ctx, &out, human)
        }

        Command::Approve {
            run,
            auto,
            level,
            justification,
            force,
        } => {
            let mut input = engine::approve::ApproveInput::for_actor(ctx.actor.clone());
            input.run_id = parse_run_id(run)?;
            input.auto = auto;
            input.level = level;
            input.justification = justification;
            input.force = force;

            let out = engine::approve::approve(&ctx.deps, input).await?;
            let human = if out.pending_levels.is_empty() {
                format!("approved -> {}", out.state)
            } else {
                format!(
                    "grant recorded; awaiting level{} {}",
                    if out.pending_levels.len() == 1 { "" } else { "s" },
                    out.pending_levels
                        .iter()
                        .map(u32::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            render(ctx, &out, human)
        }

        Command::Publish { run, dry_run, force } => {
            let mut input = engine::publish::PublishInput::for_actor(ctx.actor.clone());
            input.run_id = parse_run_id(run)?;
            input.dry_run = dry_run;
            input.force = force;

            let out = engine::publish::publish(&ctx.deps, input).await?;
            let human = if out.already_published {
                format!("run {} is already published", out.run_id)
            } else {
                let steps = out
                    .steps
                    .iter()
                    .map(|s| format!("  {} {} ({} attempt{})", s.name, s.state, s.attempts,
                        if s.attempts == 1 { "" } else { "s" }))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("published run {}\n{steps}", out.run_id)
            };
            render(ctx, &out, human)
        }

        Command::Retry { run, dry_run } => {
            let mut input = engine::retry::RetryInput::for_actor(ctx.actor.clone());
            input.run_id = parse_run_id(run)?;
            input.dry_run = dry_run;

            let out = engine::retry::retry(&ctx.deps, input).await?;
            render(ctx, &out, format!("retry complete -> {}", out.state))
        }

        Command::Status { run } => {
            let input = engine::status::StatusInput {
                run_id: parse_run_id(run)?,
            };
            let out = engine::status::status(&ctx.deps, input).await?;

            let mut human = format!(
                "run {}\n  state: {}\n  risk: {:.2}\n  plan hash: {}",
                out.run_id,
                out.state,
                out.risk_score,
                &out.plan_hash[..out.plan_hash.len().min(12)],
            );
            if let Some(version) = &out.version_next {
                human.push_str(&format!("\n  next version: {version}"));
            }
            if let Some(drift) = &out.head_drift {
                human.push_str(&format!(
                    "\n  warning: HEAD drifted ({} -> {})",
                    &drift.expected[..12],
                    &drift.actual[..12]
                ));
            }
            if out.stale {
                human.push_str("\n  warning: run has been idle for over an hour");
            }
            if let Some(action) = &out.next_action {
                human.push_str(&format!("\n  next: {action}"));
            }
            render(ctx, &out, human)
        }

        Command::Cancel { run, reason } => {
            let input = engine::cancel::CancelInput {
                actor: ctx.actor.clone(),
                run_id: parse_run_id(run)?,
                reason,
            };
            let out = engine::cancel::cancel(&ctx.deps, input).await?;
            render(ctx, &out, format!("cancelled run {}", out.run_id))
        }

        Command::Machine => {
            let export = machine::export();
            println!("{}", serde_json::to_string_pretty(&export)?);
            Ok(())
        }
    }
}
