use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use runbook_engine::{
    Dispatcher, EngineConfig, RunContext, RunOptions, UndefinedVariablePolicy, load_config, load_config_from_path, parse_script_file,
    validate_script,
};
use runbook_util::expand_tilde;
use serde_json::{Map, Value};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let matches = build_cli().get_matches();
    let config = resolve_config(&matches)?;

    match matches.subcommand() {
        Some(("run", sub)) => run_script(config, sub).await,
        Some(("check", sub)) => check_script(config, sub),
        Some(("actions", sub)) => list_actions(config, sub),
        _ => {
            build_cli().print_help()?;
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_cli() -> Command {
    let file_arg = || {
        Arg::new("file")
            .required(true)
            .value_parser(value_parser!(PathBuf))
            .help("Script file: JSON, YAML or a legacy snippet")
    };

    Command::new("runbook")
        .about("Run, inspect and validate automation scripts")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .env("RUNBOOK_CONFIG_PATH")
                .action(ArgAction::Set)
                .help("Engine configuration file"),
        )
        .arg(
            Arg::new("max-loop-iterations")
                .long("max-loop-iterations")
                .global(true)
                .value_parser(value_parser!(usize))
                .help("Default iteration limit for loop steps"),
        )
        .arg(
            Arg::new("command-timeout")
                .long("command-timeout")
                .global(true)
                .value_parser(value_parser!(f64))
                .help("Default execute_command timeout in seconds"),
        )
        .arg(
            Arg::new("strict-variables")
                .long("strict-variables")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Fail steps that reference undefined variables"),
        )
        .subcommand(
            Command::new("run")
                .about("Execute a script, streaming its output")
                .arg(file_arg())
                .arg(
                    Arg::new("var")
                        .long("var")
                        .short('v')
                        .action(ArgAction::Append)
                        .help("Initial variable as NAME=VALUE; VALUE is parsed as JSON when possible"),
                )
                .arg(
                    Arg::new("log-history")
                        .long("log-history")
                        .action(ArgAction::SetTrue)
                        .help("Record and print the execution history"),
                )
                .arg(
                    Arg::new("show-variables")
                        .long("show-variables")
                        .action(ArgAction::SetTrue)
                        .help("Print the final variables as JSON"),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Validate a script without running it")
                .arg(file_arg()),
        )
        .subcommand(
            Command::new("actions").about("List the available actions").arg(
                Arg::new("json")
                    .long("json")
                    .action(ArgAction::SetTrue)
                    .help("Print full metadata, including field schemas"),
            ),
        )
}

fn resolve_config(matches: &ArgMatches) -> Result<EngineConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => load_config_from_path(&expand_tilde(path))?,
        None => load_config()?,
    };
    if let Some(limit) = matches.get_one::<usize>("max-loop-iterations") {
        config.max_loop_iterations = *limit;
    }
    if let Some(timeout) = matches.get_one::<f64>("command-timeout") {
        config.command_timeout_secs = *timeout;
    }
    if matches.get_flag("strict-variables") {
        config.undefined_variables = UndefinedVariablePolicy::Error;
    }
    config.validate().context("invalid engine configuration")?;
    Ok(config)
}

/// Parses `NAME=VALUE`. The value is JSON when it parses as JSON, otherwise plain text.
fn parse_var_assignment(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    let name = name.trim();
    if !runbook_engine::variables::is_identifier(name) {
        anyhow::bail!("'{name}' is not a valid variable name");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

async fn run_script(config: EngineConfig, matches: &ArgMatches) -> Result<()> {
    let file = matches.get_one::<PathBuf>("file").context("missing script file")?;
    let script = parse_script_file(file)?;
    let log_history = matches.get_flag("log-history");

    let mut initial = Map::new();
    for raw in matches.get_many::<String>("var").into_iter().flatten() {
        let (name, value) = parse_var_assignment(raw)?;
        initial.insert(name, value);
    }

    let dispatcher = Dispatcher::with_builtins(config)?;
    let issues = validate_script(dispatcher.registry(), &script);
    if !issues.is_empty() {
        for issue in &issues {
            eprintln!("{}: {}", issue.path, issue.message);
        }
        anyhow::bail!("{} problem(s) found in {}", issues.len(), file.display());
    }

    let run = RunContext::new(file.display().to_string(), RunOptions { log_history }, dispatcher.config());
    run.seed_variables(initial);

    // The consumer subscribes before the run prints its first line.
    let (_, result) = tokio::join!(run.flush_output(|line| println!("{line}"), Duration::MAX), async {
        let execution = run.execute(&dispatcher, &script);
        tokio::pin!(execution);
        tokio::select! {
            result = &mut execution => result,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, cancelling run");
                run.cancel();
                execution.await
            }
        }
    });

    if log_history {
        eprintln!("{}", serde_json::to_string_pretty(&run.history())?);
    }
    if matches.get_flag("show-variables") {
        println!("{}", serde_json::to_string_pretty(&run.variables())?);
    }

    match result {
        Ok(message) => {
            eprintln!("{message}");
            Ok(())
        }
        Err(outcome) => {
            let action = outcome.action.as_deref().unwrap_or("script");
            anyhow::bail!("{action} failed: {}", outcome.message)
        }
    }
}

fn check_script(config: EngineConfig, matches: &ArgMatches) -> Result<()> {
    let file = matches.get_one::<PathBuf>("file").context("missing script file")?;
    let script = parse_script_file(file)?;
    let dispatcher = Dispatcher::with_builtins(config)?;

    let issues = validate_script(dispatcher.registry(), &script);
    if issues.is_empty() {
        println!("{}: ok", file.display());
        return Ok(());
    }
    for issue in &issues {
        println!("{}: [{}] {}", issue.path, issue.kind, issue.message);
    }
    anyhow::bail!("{} problem(s) found in {}", issues.len(), file.display())
}

fn list_actions(config: EngineConfig, matches: &ArgMatches) -> Result<()> {
    let dispatcher = Dispatcher::with_builtins(config)?;
    let metadata = dispatcher.registry().metadata();
    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }
    for action in metadata {
        let mut line = format!("{:<16} {}", action.name, action.description);
        if !action.required_fields.is_empty() {
            line.push_str(&format!(" (requires: {})", action.required_fields.join(", ")));
        }
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn var_assignments_parse_json_values() {
        assert_eq!(parse_var_assignment("count=3").unwrap(), ("count".to_string(), json!(3)));
        assert_eq!(parse_var_assignment("name=web 1").unwrap(), ("name".to_string(), json!("web 1")));
        assert_eq!(parse_var_assignment("tags=[\"a\"]").unwrap().1, json!(["a"]));
        assert!(parse_var_assignment("no-equals").is_err());
        assert!(parse_var_assignment("bad-name=1").is_err());
    }

    #[test]
    fn flags_override_file_configuration() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("engine.json");
        std::fs::write(&config_path, r#"{"max_loop_iterations": 50, "http_timeout_secs": 3}"#).unwrap();

        let matches = build_cli().get_matches_from([
            "runbook",
            "--config",
            config_path.to_str().unwrap(),
            "--max-loop-iterations",
            "7",
            "--strict-variables",
            "check",
            "script.json",
        ]);
        let config = resolve_config(&matches).unwrap();
        assert_eq!(config.max_loop_iterations, 7);
        assert_eq!(config.http_timeout_secs, 3.0);
        assert_eq!(config.undefined_variables, UndefinedVariablePolicy::Error);
    }

    #[test]
    fn cli_definition_is_consistent() {
        build_cli().debug_assert();
    }
}
