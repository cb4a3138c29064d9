//! Gateway CLI — 网关配置检查与模型列表的命令行工具
//!
//! Usage:
//!   gateway-cli validate <config>     Check a gateway config file
//!   gateway-cli models <config>       Print the /v1/models body for a config
//!   gateway-cli version               Show version information

use anyhow::{bail, Context};
use llm_chain_gateway::config::GatewayConfig;
use llm_chain_gateway::logging;
use llm_chain_gateway::types::ModelList;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let result = match args[1].as_str() {
        "validate" => cmd_validate(&args[2..]),
        "models" => cmd_models(&args[2..]),
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
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"gateway-cli — llm-chain-gateway 命令行工具

USAGE:
    gateway-cli <COMMAND> [ARGS]

COMMANDS:
    validate <config>     Check a config file and show each model's backend kind
    models <config>       Print configured models as the /v1/models JSON body
    version               Show version information
    help                  Show this help message

ENVIRONMENT:
    GATEWAY_LOG_LEVEL     Overrides log_level from the config file
    RUST_LOG              Overrides both"#
    );
}

fn cmd_version() {
    println!("gateway-cli {}", env!("CARGO_PKG_VERSION"));
}

fn load(args: &[String]) -> anyhow::Result<GatewayConfig> {
    let Some(path) = args.first() else {
        bail!("missing <config> argument");
    };
    let config = GatewayConfig::load(path).with_context(|| format!("loading {path}"))?;
    logging::init(&config.log_level).context("initializing logging")?;
    Ok(config)
}

fn cmd_validate(args: &[String]) -> anyhow::Result<()> {
    let config = load(args)?;
    println!("Config OK: {} model(s), {} chain(s)", config.models.len(), config.chains.len());
    for model in &config.models {
        let kind = model.resolved_kind()?;
        println!("  {:<32} {}", model.name, kind);
    }
    for chain in &config.chains {
        println!("  chain {:<26} template {}", chain.name, chain.template);
    }
    Ok(())
}

fn cmd_models(args: &[String]) -> anyhow::Result<()> {
    let config = load(args)?;
    let names = config.models.iter().map(|m| m.name.clone()).collect();
    let body = serde_json::to_string_pretty(&ModelList::from_names(names))?;
    println!("{body}");
    Ok(())
}
