//! synthgate-cli: 网关配置校验与任务查询的命令行工具
//!
//! Usage:
//!   synthgate-cli validate <config.yaml>            Validate a gateway config
//!   synthgate-cli defaults                          Print the default config as YAML
//!   synthgate-cli status <job_id> [--config <f>]    Show a job's status
//!   synthgate-cli wait <job_id> [--config <f>] [--max-wait <secs>] [--priority <p>]

use anyhow::{anyhow, bail, Context};
use std::time::Duration;
use synthgate::{Gateway, GatewayConfig, JobId, PriorityLevel};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let result = match args[1].as_str() {
        "validate" => cmd_validate(&args[2..]),
        "defaults" => cmd_defaults(),
        "status" => cmd_status(&args[2..]).await,
        "wait" => cmd_wait(&args[2..]).await,
        "version" | "--version" | "-V" => {
            cmd_version();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(2);
    }
}

fn print_usage() {
    println!(
        r#"synthgate-cli: 生成 API 网关命令行工具

USAGE:
    synthgate-cli <COMMAND> [OPTIONS]

COMMANDS:
    validate <file>             Validate a gateway config (after env overrides)
    defaults                    Print the default config as YAML
    status <job_id>             Fetch a job's current status
    wait <job_id>               Poll a job until it finishes
    version                     Show version information
    help                        Show this help message

OPTIONS:
    --config <file>             Gateway config (status, wait)
    --max-wait <secs>           Polling budget for wait (default 300)
    --priority <level>          low | normal | high | critical (default normal)

ENVIRONMENT:
    SYNTHGATE_*                 Config overrides, e.g. SYNTHGATE_BASE_URL
    SYNTHGATE_API_KEY           Upstream bearer token
    RUST_LOG                    Log filter"#
    );
}

fn cmd_version() {
    println!("synthgate-cli {}", env!("CARGO_PKG_VERSION"));
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn positional(args: &[String]) -> Option<&str> {
    let mut skip = false;
    for a in args {
        if skip {
            skip = false;
            continue;
        }
        if a.starts_with("--") {
            skip = true;
            continue;
        }
        return Some(a);
    }
    None
}

fn load_config(path: Option<&str>) -> anyhow::Result<GatewayConfig> {
    let mut config = match path {
        Some(p) => GatewayConfig::from_yaml_file(p).with_context(|| format!("loading {p}"))?,
        None => GatewayConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn cmd_validate(args: &[String]) -> anyhow::Result<()> {
    let path = positional(args).ok_or_else(|| anyhow!("validate needs a config file"))?;
    let config = load_config(Some(path))?;
    config.validate_base_url()?;
    println!(
        "ok: backend={} capacity={} max_retries={} base_url={}",
        config.admission.backend.name(),
        config.admission.capacity,
        config.retry.max_retries,
        config.base_url
    );
    Ok(())
}

fn cmd_defaults() -> anyhow::Result<()> {
    print!("{}", GatewayConfig::default().to_yaml()?);
    Ok(())
}

fn priority_arg(args: &[String]) -> anyhow::Result<PriorityLevel> {
    match flag(args, "--priority") {
        Some(p) => p.parse().map_err(|e: String| anyhow!(e)),
        None => Ok(PriorityLevel::Normal),
    }
}

async fn cmd_status(args: &[String]) -> anyhow::Result<()> {
    let job = positional(args).ok_or_else(|| anyhow!("status needs a job id"))?;
    let gateway = Gateway::new(load_config(flag(args, "--config"))?)?;
    let status = gateway.get_status(&JobId::from(job), priority_arg(args)?).await;
    gateway.close().await;
    let status = status?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_wait(args: &[String]) -> anyhow::Result<()> {
    let job = positional(args).ok_or_else(|| anyhow!("wait needs a job id"))?;
    let max_wait = match flag(args, "--max-wait") {
        Some(s) => s.parse::<u64>().context("--max-wait must be whole seconds")?,
        None => 300,
    };
    if max_wait == 0 {
        bail!("--max-wait must be positive");
    }
    let gateway = Gateway::new(load_config(flag(args, "--config"))?)?;
    let result = gateway
        .wait_until_done(&JobId::from(job), Duration::from_secs(max_wait), priority_arg(args)?)
        .await;
    gateway.close().await;
    let result = result?;
    println!("{}", result.url);
    Ok(())
}
