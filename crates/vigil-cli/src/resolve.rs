//! # Resolve Subcommand
//!
//! Prints the ordered effective policies for one subject of a bundle.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use vigil_core::SubjectId;
use vigil_policy::{PolicyEngine, Resolution};

use crate::bundle::{load_engine, runtime};

/// Arguments for the resolve subcommand.
#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Bundle file (YAML or JSON).
    pub bundle: PathBuf,

    /// Subject to resolve.
    #[arg(long)]
    pub subject: String,

    /// Print the resolution as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Execute the resolve subcommand.
pub fn run_resolve(args: &ResolveArgs) -> Result<u8> {
    let engine = load_engine(&args.bundle)?;
    let subject = SubjectId::new(args.subject.clone()).context("invalid subject")?;
    let resolution = resolve_subject(&engine, &subject)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&resolution_json(&resolution))?);
        return Ok(0);
    }

    println!("subject: {}", resolution.subject_id);
    match &resolution.attributes {
        Some(attrs) => println!(
            "  department: {}  role: {}",
            attrs.department.as_deref().unwrap_or("-"),
            attrs.role.as_deref().unwrap_or("-")
        ),
        None => println!("  not in directory; global policies only"),
    }
    println!();
    if resolution.policies.is_empty() {
        println!("  no applicable policies");
    }
    for (rank, policy) in resolution.policies.iter().enumerate() {
        println!(
            "  {:>2}. {:<32} {:<28} priority {}",
            rank + 1,
            policy.name,
            policy.scope.to_string(),
            policy.priority
        );
    }
    Ok(0)
}

/// Resolve a subject against an engine.
pub fn resolve_subject(engine: &PolicyEngine, subject: &SubjectId) -> Result<Resolution> {
    Ok(runtime()?.block_on(engine.resolve(subject)))
}

fn resolution_json(resolution: &Resolution) -> serde_json::Value {
    let policies: Vec<serde_json::Value> = resolution
        .policies
        .iter()
        .map(|p| {
            serde_json::json!({
                "id": p.id,
                "name": p.name,
                "scope": p.scope.to_string(),
                "priority": p.priority,
            })
        })
        .collect();
    serde_json::json!({
        "subject_id": resolution.subject_id,
        "attributes": resolution.attributes,
        "source": resolution.source.as_str(),
        "policies": policies,
    })
}
