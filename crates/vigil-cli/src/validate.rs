//! # Validate Subcommand
//!
//! Loads every policy of a bundle and reports each rejection. Exits 0 when
//! the whole bundle is valid, 1 otherwise.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;

use crate::bundle::{Bundle, LoadedPolicy};

/// Arguments for the validate subcommand.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Bundle file (YAML or JSON).
    pub bundle: PathBuf,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Execute the validate subcommand.
pub fn run_validate(args: &ValidateArgs) -> Result<u8> {
    let report = validate_bundle(&args.bundle)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
    } else {
        for policy in &report {
            let name = policy.name.as_deref().unwrap_or("unnamed");
            match &policy.result {
                Ok(p) => println!("  OK    #{} {name} ({}, priority {})", policy.index + 1, p.scope, p.priority),
                Err(e) => println!("  FAIL  #{} {name}: {e}", policy.index + 1),
            }
        }
        let failed = report.iter().filter(|p| p.result.is_err()).count();
        println!();
        println!("{} policies, {failed} invalid", report.len());
    }
    Ok(if report.iter().all(|p| p.result.is_ok()) { 0 } else { 1 })
}

/// Validate a bundle file, one result per policy.
pub fn validate_bundle(path: &Path) -> Result<Vec<LoadedPolicy>> {
    let bundle = Bundle::load(path)?;
    let (_, loaded) = bundle.into_engine()?;
    Ok(loaded)
}

fn report_json(report: &[LoadedPolicy]) -> serde_json::Value {
    let policies: Vec<serde_json::Value> = report
        .iter()
        .map(|p| {
            serde_json::json!({
                "index": p.index,
                "name": p.name,
                "valid": p.result.is_ok(),
                "error": p.result.as_ref().err(),
            })
        })
        .collect();
    serde_json::json!({
        "valid": report.iter().all(|p| p.result.is_ok()),
        "policies": policies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_bundle(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn valid_bundle_exits_zero() {
        let file = write_bundle(
            r#"
policies:
  - name: Exfil
    scope: { type: global }
    conditions:
      - { type: category, operator: in, value: [exfiltration, usb] }
    actions:
      - action: { type: escalate, config: { to: insider-risk } }
"#,
        );
        let args = ValidateArgs {
            bundle: file.path().to_path_buf(),
            json: false,
        };
        assert_eq!(run_validate(&args).unwrap(), 0);
    }

    #[test]
    fn each_invalid_policy_reported() {
        let file = write_bundle(
            r#"
policies:
  - name: ""
    scope: { type: global }
  - name: Bad operand
    scope: { type: global }
    conditions:
      - { type: risk_score, operator: greater_than, value: high }
  - name: Fine
    scope: { type: user, target: emp-1 }
"#,
        );
        let report = validate_bundle(file.path()).unwrap();
        assert_eq!(report.len(), 3);
        assert!(report[0].result.is_err());
        assert!(report[1].result.is_err());
        assert!(report[2].result.is_ok());

        let args = ValidateArgs {
            bundle: file.path().to_path_buf(),
            json: true,
        };
        assert_eq!(run_validate(&args).unwrap(), 1);
    }

    #[test]
    fn missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_bundle(&dir.path().join("absent.yaml")).is_err());
    }
}
