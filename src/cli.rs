use crate::config::policy::Policy;
use crate::config::types::ExecutionRequest;
use crate::core::supervisor::Supervisor;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Internal role selector (hidden; used when the supervisor re-executes this binary)
    #[arg(long, hide = true)]
    internal_role: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script under a policy and print the result as JSON
    Run(RunArgs),
    /// Print the default policy as JSON
    Policy,
}

#[derive(Args)]
struct RunArgs {
    /// Script source as a string
    #[arg(long, conflicts_with = "file")]
    code: Option<String>,
    /// Read the script from a file ("-" for stdin)
    #[arg(long)]
    file: Option<PathBuf>,
    /// Input data as JSON text
    #[arg(long, conflicts_with = "input_file")]
    input: Option<String>,
    /// Read input data from a JSON file
    #[arg(long)]
    input_file: Option<PathBuf>,
    /// Policy file (JSON); flags below override its ceilings
    #[arg(long)]
    policy: Option<PathBuf>,
    /// Wall-clock limit in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Memory limit in MB
    #[arg(long)]
    memory: Option<u64>,
    /// CPU time limit in seconds
    #[arg(long)]
    cpu: Option<u64>,
    /// Output cap per stream in KB
    #[arg(long)]
    max_output: Option<u64>,
    /// Pretty-print the result
    #[arg(long)]
    pretty: bool,
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    if let Some(role) = cli.internal_role.as_deref() {
        if role == "worker" {
            std::process::exit(crate::worker::run_worker_main());
        }
        return Err(anyhow::anyhow!("unsupported internal role: {}", role));
    }

    let command = cli.command.ok_or_else(|| anyhow::anyhow!("missing command"))?;
    match command {
        Commands::Run(args) => {
            let ok = run_script(args)?;
            std::process::exit(if ok { 0 } else { 1 });
        }
        Commands::Policy => {
            println!("{}", serde_json::to_string_pretty(&Policy::default())?);
            Ok(())
        }
    }
}

fn run_script(args: RunArgs) -> Result<bool> {
    let code = read_code(&args)?;
    let input = read_input(&args)?;
    let policy = resolve_policy(&args)?;

    let supervisor = Supervisor::from_env().context("failed to configure supervisor")?;
    let request = ExecutionRequest::new(code).with_input(input).with_policy(policy);
    log::info!("[{}] running script", request.execution_id);
    let result = supervisor.execute(&request);

    let rendered = if args.pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{rendered}");
    Ok(result.ok)
}

fn read_code(args: &RunArgs) -> Result<String> {
    if let Some(code) = &args.code {
        return Ok(code.clone());
    }
    match args.file.as_deref() {
        Some(path) if path.as_os_str() == "-" => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("failed to read script from stdin")?;
            Ok(code)
        }
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display())),
        None => Err(anyhow::anyhow!("one of --code or --file is required")),
    }
}

fn read_input(args: &RunArgs) -> Result<Map<String, Value>> {
    let text = match (&args.input, &args.input_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read input {}", path.display()))?,
        (None, None) => return Ok(Map::new()),
    };
    let value: Value = serde_json::from_str(&text).context("input is not valid JSON")?;
    Ok(normalize_input(value))
}

/// Scripts always receive a mapping: arrays arrive as `rows`, scalars as
/// `value`.
fn normalize_input(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        Value::Array(rows) => {
            let mut map = Map::new();
            map.insert("rows".to_string(), Value::Array(rows));
            map
        }
        scalar => {
            let mut map = Map::new();
            map.insert("value".to_string(), scalar);
            map
        }
    }
}

fn resolve_policy(args: &RunArgs) -> Result<Policy> {
    let mut policy = match &args.policy {
        Some(path) => Policy::from_json_file(path)?,
        None => Policy::default(),
    };
    if let Some(timeout) = args.timeout {
        policy.timeout_seconds = timeout;
    }
    if let Some(memory) = args.memory {
        policy.memory_limit_mb = memory;
    }
    if let Some(cpu) = args.cpu {
        policy.cpu_time_seconds = cpu;
    }
    if let Some(max_output) = args.max_output {
        policy.max_output_kb = max_output;
    }
    policy.validate()?;
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_is_normalized_to_a_mapping() {
        assert_eq!(normalize_input(json!({"a": 1}))["a"], json!(1));
        assert_eq!(normalize_input(json!([1, 2]))["rows"], json!([1, 2]));
        assert_eq!(normalize_input(json!(7))["value"], json!(7));
        assert!(normalize_input(Value::Null).is_empty());
    }

    #[test]
    fn flags_override_policy_ceilings() {
        let args = Cli::parse_from(["scriptbox", "run", "--code", "1", "--timeout", "2", "--max-output", "4"]);
        let Some(Commands::Run(args)) = args.command else {
            panic!("expected run");
        };
        let policy = resolve_policy(&args).unwrap();
        assert_eq!(policy.timeout_seconds, 2);
        assert_eq!(policy.max_output_kb, 4);
        assert_eq!(policy.memory_limit_mb, Policy::default().memory_limit_mb);
    }

    #[test]
    fn zero_ceiling_is_rejected() {
        let args = Cli::parse_from(["scriptbox", "run", "--code", "1", "--cpu", "0"]);
        let Some(Commands::Run(args)) = args.command else {
            panic!("expected run");
        };
        assert!(resolve_policy(&args).is_err());
    }
}
