#![forbid(unsafe_code)]

use std::path::PathBuf;

use serde_json::json;
use tc_device::{Arch, Target};
use tc_optest::{HarnessConfig, Verdict, load_matmul_suite, write_jsonl};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: run_matmul_parity [--target x86|nvgpu] [--seed N] [--output path] [--print-full-report]";

fn main() -> Result<(), String> {
    init_tracing();

    let mut target: Option<Arch> = None;
    let mut seed: Option<u64> = None;
    let mut output: Option<PathBuf> = None;
    let mut print_full_report = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--target" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--target requires one of: x86|nvgpu".to_string())?;
                target = Some(value.parse::<Arch>().map_err(|error| error.to_string())?);
            }
            "--seed" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--seed requires an unsigned integer".to_string())?;
                seed = Some(
                    value
                        .parse::<u64>()
                        .map_err(|error| format!("invalid --seed '{value}': {error}"))?,
                );
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--print-full-report" => {
                print_full_report = true;
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            other => {
                return Err(format!("unknown arg '{other}'. {USAGE}"));
            }
        }
    }

    let mut config = HarnessConfig::from_env().map_err(|error| error.to_string())?;
    if seed.is_some() {
        config.seed = seed;
    }
    let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
    let output_path =
        output.unwrap_or_else(|| repo_root.join("artifacts/optest/matmul_case_log_v1.jsonl"));

    let mut suite = load_matmul_suite(&config).map_err(|error| error.to_string())?;
    if let Some(arch) = target {
        suite = suite.with_target(Target { arch });
    }
    let report = suite.run();
    write_jsonl(&output_path, &report.forensic_logs()).map_err(|error| error.to_string())?;

    if print_full_report {
        println!(
            "{}",
            serde_json::to_string_pretty(&report)
                .map_err(|error| format!("failed to serialize suite report: {error}"))?
        );
    } else {
        let failures: Vec<_> = report
            .cases
            .iter()
            .filter(|case| case.verdict == Verdict::Fail)
            .map(|case| json!({ "case": case.case, "diagnostic": case.diagnostic }))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": if report.is_green() { "ok" } else { "needs_attention" },
                "suite": report.suite,
                "target": report.target.arch.name(),
                "gate": report.gate,
                "seed": config.seed,
                "output_path": output_path.display().to_string(),
                "total": report.total,
                "passed": report.passed,
                "failed": report.failed,
                "skipped": report.skipped,
                "failures": failures,
            }))
            .map_err(|error| format!("failed to serialize summary: {error}"))?
        );
    }

    if report.is_green() {
        Ok(())
    } else {
        Err(format!(
            "{} of {} matmul case(s) failed",
            report.failed, report.total
        ))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
