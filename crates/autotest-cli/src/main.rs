use anyhow::{anyhow, Result};
use autotest_core::{ExecutionResult, FinalReport};
use autotest_runner::{
    load_submission, AutotestConfig, CollaboratorSet, Controller, Executor, SandboxRunner,
    DEFAULT_CONFIG_FILE,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "autotest",
    version,
    about = "Generate tests until a coverage target is met"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the generate/execute/review loop over Python sources.
    Run {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        max_iterations: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Run an existing test directory once in the sandbox.
    Execute {
        #[arg(long)]
        code_dir: PathBuf,
        #[arg(long)]
        tests_dir: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    ParseCoverage {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    ParseResults {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved configuration.
    Describe {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write a default configuration file.
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            files,
            config,
            threshold,
            max_iterations,
            json,
        } => {
            let mut cfg = AutotestConfig::load(&config)?;
            apply_loop_overrides(&mut cfg, threshold, max_iterations)?;
            let submission = load_submission(&files)?;
            let collaborators = CollaboratorSet::from_config(&cfg.collaborators)?;
            let executor = SandboxRunner::from_config(&cfg.sandbox);
            let controller = Controller {
                loop_config: cfg.iteration.clone(),
                reports_dir: cfg.reports_dir.clone(),
                analyzer: collaborators.analyzer.as_ref(),
                generator: collaborators.generator.as_ref(),
                reviewer: collaborators.reviewer.as_ref(),
                executor: &executor,
            };
            let outcome = controller.run(submission)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run_dir": outcome.run_dir.display().to_string(),
                    "report_path": outcome.report_path.display().to_string(),
                    "report": outcome.report,
                })));
            }
            print_report(&outcome.report);
            println!("run_dir: {}", outcome.run_dir.display());
            println!("report: {}", outcome.report_path.display());
        }
        Commands::Execute {
            code_dir,
            tests_dir,
            config,
            json,
        } => {
            let cfg = AutotestConfig::load(&config)?;
            let runner = SandboxRunner::from_config(&cfg.sandbox);
            let result = runner.execute(&code_dir, &tests_dir);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "execute",
                    "result": result,
                })));
            }
            print_execution(&result);
        }
        Commands::ParseCoverage { path, json } => {
            let result = autotest_artifacts::parse_coverage(&path);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "parse-coverage",
                    "result": result,
                })));
            }
            print_execution(&result);
        }
        Commands::ParseResults { path, json } => {
            let counts = autotest_artifacts::parse_results(&path);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "parse-results",
                    "passed": counts.passed,
                    "failed": counts.failed,
                    "failed_tests": counts.failed_tests,
                })));
            }
            println!("passed: {}", counts.passed);
            println!("failed: {}", counts.failed);
            for name in &counts.failed_tests {
                println!("  - {}", name);
            }
        }
        Commands::Describe { config, json } => {
            let cfg = AutotestConfig::load(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "config": config_to_json(&cfg),
                })));
            }
            print!("{}", cfg.to_yaml()?);
        }
        Commands::Init { path, force } => {
            write_default_config(&path, force)?;
            println!("wrote: {}", path.display());
            println!("next: set collaborators.generator to the command that writes tests");
            println!("next: autotest describe --config {}", path.display());
        }
    }
    Ok(None)
}

fn apply_loop_overrides(
    cfg: &mut AutotestConfig,
    threshold: Option<f64>,
    max_iterations: Option<u32>,
) -> Result<()> {
    if let Some(t) = threshold {
        cfg.iteration.threshold = t;
    }
    if let Some(m) = max_iterations {
        cfg.iteration.max_iterations = m;
    }
    cfg.validate()
}

fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Err(anyhow!(
            "config file already exists (use --force): {}",
            path.display()
        ));
    }
    let yaml = AutotestConfig::default().to_yaml()?;
    autotest_core::atomic_write_bytes(path, yaml.as_bytes())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Execute { json, .. }
        | Commands::ParseCoverage { json, .. }
        | Commands::ParseResults { json, .. }
        | Commands::Describe { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn config_to_json(cfg: &AutotestConfig) -> Value {
    json!({
        "reports_dir": cfg.reports_dir.display().to_string(),
        "threshold": cfg.iteration.threshold,
        "max_iterations": cfg.iteration.max_iterations,
        "hard_iteration_cap": cfg.iteration.hard_iteration_cap,
        "sandbox_mode": cfg.sandbox.mode.as_str(),
        "engine": cfg.sandbox.engine,
        "image": cfg.sandbox.image,
        "memory_mb": cfg.sandbox.memory_mb,
        "cpu_count": cfg.sandbox.cpu_count,
        "timeout_seconds": cfg.sandbox.timeout_seconds,
        "analyzer": cfg.collaborators.analyzer,
        "generator": cfg.collaborators.generator,
        "reviewer": cfg.collaborators.reviewer,
        "collaborator_timeout_seconds": cfg.collaborators.timeout_seconds,
    })
}

fn print_execution(result: &ExecutionResult) {
    println!("success: {}", result.success);
    println!("coverage: {:.2}%", result.coverage_pct);
    println!("passed: {}", result.tests_passed);
    println!("failed: {}", result.tests_failed);
    for (file, lines) in &result.uncovered_lines {
        let lines = lines
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        println!("uncovered: {}: {}", file, lines);
    }
    for name in &result.failed_tests {
        println!("failed_test: {}", name);
    }
    if let Some(err) = &result.error_output {
        println!("error: {}", err.trim());
    }
}

fn print_report(report: &FinalReport) {
    println!("run_id: {}", report.run_id);
    println!("iteration: {}", report.iteration);
    println!("success: {}", report.success);
    println!("coverage: {:.2}%", report.coverage_pct);
    println!("passed: {}", report.tests_passed);
    println!("failed: {}", report.tests_failed);
    println!("reason: {}", report.review_reason);
    if let Some(err) = &report.error {
        println!("error: {}", err.trim());
    }
    println!("report_url: {}", report.report_url);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_parses_files_and_overrides() {
        let cli = Cli::try_parse_from([
            "autotest",
            "run",
            "calc.py",
            "util.py",
            "--threshold",
            "90",
            "--max-iterations",
            "3",
            "--json",
        ])
        .expect("parse");
        assert!(command_json_mode(&cli.command));
        match cli.command {
            Commands::Run {
                files,
                config,
                threshold,
                max_iterations,
                ..
            } => {
                assert_eq!(files, vec![PathBuf::from("calc.py"), PathBuf::from("util.py")]);
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG_FILE));
                assert_eq!(threshold, Some(90.0));
                assert_eq!(max_iterations, Some(3));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_files() {
        assert!(Cli::try_parse_from(["autotest", "run"]).is_err());
    }

    #[test]
    fn overrides_are_validated() {
        let mut cfg = AutotestConfig::default();
        apply_loop_overrides(&mut cfg, Some(95.0), Some(2)).expect("valid");
        assert_eq!(cfg.iteration.threshold, 95.0);
        assert_eq!(cfg.iteration.max_iterations, 2);
        assert!(apply_loop_overrides(&mut cfg, Some(150.0), None).is_err());
    }

    #[test]
    fn json_error_shape() {
        let value = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "command_failed");
        assert_eq!(value["error"]["message"], "boom");
    }

    #[test]
    fn init_writes_a_loadable_config_and_refuses_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("autotest.yaml");
        write_default_config(&path, false).expect("init");
        let cfg = AutotestConfig::load(&path).expect("load");
        assert_eq!(cfg.iteration.max_iterations, 5);
        assert!(write_default_config(&path, false).is_err());
        write_default_config(&path, true).expect("forced");
    }
}
