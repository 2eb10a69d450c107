mod cli;

use tunerflow::{config, server, tuners::HdHomeRunClient};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};

async fn start_server(host: Option<String>, port: Option<u16>, config_path: Option<&std::path::Path>) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;

    // CLI flags win over the config file
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config::validate_config(&config)?;

    tracing::info!("Starting tunerflow");
    tracing::info!(
        tuners = config.live_tv.tuners.len(),
        temp_dir = %config.live_tv.transcode_temp_dir.display(),
        "Live TV configured"
    );

    server::start_server(config).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "tunerflow=trace,tunerflow_common=debug,tower_http=debug".to_string()
        } else {
            "tunerflow=debug,tunerflow_common=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt().with_env_filter(&env_filter).init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Discover { url, json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(discover(&url, json))
        }
        Commands::Validate { config: config_path } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("tunerflow {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn discover(url: &str, json: bool) -> Result<()> {
    let client = HdHomeRunClient::new(reqwest::Client::new());
    let device = client
        .discover(url)
        .await
        .with_context(|| format!("Failed to query {}", url))?;
    let lineup = client
        .lineup(url, &device)
        .await
        .with_context(|| format!("Failed to fetch lineup from {}", url))?;

    if json {
        let out = serde_json::json!({ "device": device, "lineup": lineup });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Device: {}", device.device_id);
    if let Some(ref model) = device.model_number {
        println!("Model: {}", model);
    }
    if let Some(ref firmware) = device.firmware_version {
        println!("Firmware: {}", firmware);
    }
    println!("Tuners: {}", device.tuner_count);
    println!("\nChannels: {}", lineup.len());
    for entry in &lineup {
        print!("  {:>6}  {}", entry.guide_number, entry.guide_name);
        if entry.hd != 0 {
            print!(" [HD]");
        }
        println!();
    }

    Ok(())
}

fn validate_config(path: Option<&std::path::Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            println!("  Server: {}:{}", config.server.host, config.server.port);
            println!("  Temp dir: {}", config.live_tv.transcode_temp_dir.display());
            println!("  Tuners: {}", config.live_tv.tuners.len());
            for tuner in &config.live_tv.tuners {
                println!(
                    "    {} ({:?}) {} sharing={}",
                    tuner.id, tuner.kind, tuner.url, tuner.enable_stream_sharing
                );
            }
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Server: {}:{}", config.server.host, config.server.port);
            println!("  Temp dir: {}", config.live_tv.transcode_temp_dir.display());
        }
    }

    Ok(())
}
