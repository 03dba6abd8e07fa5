//! # Simulate Subcommand
//!
//! Evaluates an event against a bundle and prints the matched policies and
//! the execution records that would be scheduled. Nothing is dispatched.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;

use vigil_policy::{Preview, SecurityEvent};

use crate::bundle::{load_engine, runtime};

/// Arguments for the simulate subcommand.
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Bundle file (YAML or JSON).
    pub bundle: PathBuf,

    /// Event file (YAML or JSON).
    #[arg(long)]
    pub event: PathBuf,

    /// Evaluation instant (RFC 3339); defaults to now.
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,

    /// Print the plan as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Execute the simulate subcommand.
pub fn run_simulate(args: &SimulateArgs) -> Result<u8> {
    let event = load_event(&args.event)?;
    let preview = simulate(&args.bundle, &event, args.at.unwrap_or_else(Utc::now))?;

    if args.json {
        let body = serde_json::json!({
            "event_id": event.event_id,
            "subject_id": event.subject_id,
            "resolution_source": preview.resolution.source.as_str(),
            "matched_policy_ids": preview.matched_policy_ids,
            "planned": preview.planned,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(0);
    }

    println!("event {} for {}", event.event_id, event.subject_id);
    println!(
        "  {} applicable, {} matched ({})",
        preview.resolution.policies.len(),
        preview.matched_policy_ids.len(),
        preview.resolution.source
    );
    println!();
    if preview.planned.is_empty() {
        println!("  no actions would be scheduled");
    }
    for record in &preview.planned {
        let policy = preview
            .resolution
            .policies
            .iter()
            .find(|p| p.id == record.policy_id)
            .map(|p| p.name.as_str())
            .unwrap_or("?");
        println!(
            "  {}  {:<20} order {:<3} from {policy}",
            record.scheduled_at.to_rfc3339(),
            record.action_type,
            record.execution_order
        );
    }
    Ok(0)
}

/// Read an event file.
pub fn load_event(path: &Path) -> Result<SecurityEvent> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read event: {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("failed to parse event: {}", path.display()))
}

/// Preview an event against a bundle at `now`.
pub fn simulate(bundle: &Path, event: &SecurityEvent, now: DateTime<Utc>) -> Result<Preview> {
    let engine = load_engine(bundle)?;
    Ok(runtime()?.block_on(engine.preview(&event.subject_id, event, now)))
}
