use anyhow::{Context as _, Result};
use clap::Parser;
use serde_json::{json, Value};
use wapt_core::{dispatch_command, resolve_root, Cli, Context, Host, OutputFormat, WaptConfig};

fn main() {
    let cli = Cli::parse();
    let format = cli.output_format;
    if let Err(err) = run(cli, format) {
        emit_error(format, &err);
        std::process::exit(1);
    }
}

fn run(cli: Cli, output_format: OutputFormat) -> Result<()> {
    let root = resolve_root(cli.root)?;

    let log_cfg = wapt_logging::read_config(&root);
    let _log_guards = wapt_logging::init("wapt", &root, &log_cfg)?;
    if let Err(err) = wapt_logging::run_retention(&root, &log_cfg) {
        tracing::warn!("log retention failed: {err:#}");
    }

    let cfg = WaptConfig::load(&root)
        .with_context(|| format!("loading configuration under {}", root.display()))?;
    let host = Host::real(&cfg);
    let ctx = Context::new(root, cfg, host);

    let (message, data) = dispatch_command(&ctx, cli.command)?;
    emit_success(output_format, message, data)
}

fn emit_success(format: OutputFormat, message: String, data: Value) -> Result<()> {
    emit_payload(format, "ok", message, data)
}

fn emit_error(format: OutputFormat, err: &anyhow::Error) {
    let details: Vec<String> = err.chain().map(|cause| cause.to_string()).collect();
    let operator = err
        .downcast_ref::<wapt_core::WaptError>()
        .is_some_and(|e| e.requires_operator());
    let payload = json!({
        "status": "error",
        "message": err.to_string(),
        "details": details,
        "requires_operator": operator,
        "data": Value::Null,
    });

    match format {
        OutputFormat::Json => println!("{}", payload),
        OutputFormat::Text => {
            eprintln!("Error: {}", err);
            for detail in details.iter().skip(1) {
                eprintln!("  -> {}", detail);
            }
            if operator {
                eprintln!("  !! the interface needs manual attention");
            }
        }
    }
}

fn emit_payload(format: OutputFormat, status: &str, message: String, data: Value) -> Result<()> {
    let payload = json!({
        "status": status,
        "message": message,
        "data": data,
    });

    match format {
        OutputFormat::Json => println!("{}", payload),
        OutputFormat::Text => {
            println!("{}", payload["message"].as_str().unwrap_or_default());
            if !payload["data"].is_null() {
                let pretty = serde_json::to_string_pretty(&payload["data"])?;
                println!("{pretty}");
            }
        }
    }
    Ok(())
}
