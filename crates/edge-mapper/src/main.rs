// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Edge Message Mapper CLI
//!
//! # Usage
//!
//! ```bash
//! # Serve routes (default command)
//! edge-mapper --dir routes
//!
//! # Dry run against a remote broker
//! edge-mapper --host 192.168.1.10 --port 1883 --dry
//!
//! # List routes
//! edge-mapper routes list --dir routes
//!
//! # Check a message offline
//! edge-mapper routes check -t 'c8y/s/ds' -m ./operation.json --device-id sim01
//!
//! # Using configuration file
//! edge-mapper --config mapper.toml
//! ```

use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use edge_mapper::check::{render_step, Checker};
use edge_mapper::config::EXAMPLE_CONFIG;
use edge_mapper::{
    build_pipelines, load_routes, meta, service, ApiClient, Broker, BrokerTokenRenewer, Dispatcher,
    EntityStore, MapperConfig, MqttBroker, RouteStatsSnapshot, Service, ServiceSettings,
};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Edge Message Mapper
#[derive(Parser, Debug)]
#[command(name = "edge-mapper")]
#[command(about = "Edge Message Mapper - template-driven MQTT message routing")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Route directory (can repeat)
    #[arg(long = "dir", global = true)]
    dirs: Vec<PathBuf>,

    /// Maximum routing depth
    #[arg(long, global = true)]
    maxdepth: Option<u64>,

    /// Delay after each published message (milliseconds)
    #[arg(long, global = true)]
    delay_ms: Option<u64>,

    /// Dry run: log messages and API requests instead of sending them
    #[arg(long, global = true)]
    dry: bool,

    /// Device id used when thin-edge does not provide one
    #[arg(long, global = true)]
    device_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    silent: bool,

    /// Show timestamps in log entries
    #[arg(long, global = true, default_value_t = true, action = ArgAction::Set)]
    timestamps: bool,

    /// MQTT broker host
    #[arg(long, global = true)]
    host: Option<String>,

    /// MQTT broker port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// MQTT client id
    #[arg(long, global = true)]
    client_id: Option<String>,

    /// Default REST API host
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Entity document loaded at startup
    #[arg(long, global = true)]
    entity_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the mapper service (default)
    Serve,

    /// Inspect and test routes
    Routes {
        #[command(subcommand)]
        command: RoutesCommand,
    },

    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "mapper.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum RoutesCommand {
    /// List the routes found in the route directories
    List,

    /// Run a message through the routes without a broker
    Check {
        /// Input topic
        #[arg(short, long)]
        topic: String,

        /// Input message, or path to a file containing it
        #[arg(short, long, default_value = "")]
        message: String,

        /// Print JSON payloads on one line
        #[arg(long)]
        compact: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => MapperConfig::from_file(path)?,
        None => MapperConfig::default(),
    };
    apply_overrides(&mut config, &args);

    init_logging(&args, &config);

    match args.command {
        Some(Commands::GenConfig { output }) => cmd_gen_config(&output),
        Some(Commands::Validate { file }) => cmd_validate(&file),
        Some(Commands::Routes {
            command: RoutesCommand::List,
        }) => cmd_routes_list(&config),
        Some(Commands::Routes {
            command:
                RoutesCommand::Check {
                    topic,
                    message,
                    compact,
                },
        }) => {
            config.dry_run = true;
            cmd_routes_check(&config, &topic, &message, compact).await
        }
        Some(Commands::Serve) | None => {
            config.validate()?;
            cmd_serve(config).await
        }
    }
}

fn apply_overrides(config: &mut MapperConfig, args: &Args) {
    if !args.dirs.is_empty() {
        config.route_dirs = args.dirs.clone();
    }
    if let Some(max_depth) = args.maxdepth {
        config.max_depth = max_depth;
    }
    if let Some(delay) = args.delay_ms {
        config.post_message_delay_ms = delay;
    }
    if args.dry {
        config.dry_run = true;
    }
    if let Some(ref device_id) = args.device_id {
        config.meta.device_id = device_id.clone();
    }
    if let Some(ref level) = args.log_level {
        config.log_level = level.clone();
    }
    if let Some(ref host) = args.host {
        config.broker.host = host.clone();
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if let Some(ref client_id) = args.client_id {
        config.broker.client_id = client_id.clone();
    }
    if let Some(ref url) = args.api_url {
        config.api.url = url.clone();
    }
    if let Some(ref path) = args.entity_file {
        config.entity_file = Some(path.clone());
    }
}

fn init_logging(args: &Args, config: &MapperConfig) {
    let level = if args.debug {
        "debug"
    } else if args.silent {
        "warn"
    } else {
        config.log_level.as_str()
    };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.timestamps {
        builder.init();
    } else {
        builder.without_time().init();
    }
}

fn load_entities(config: &MapperConfig) -> Arc<EntityStore> {
    let entities = Arc::new(EntityStore::new());
    if let Some(ref path) = config.entity_file {
        match entities.load_file(path, true, true) {
            Ok(()) => tracing::info!("Loaded {} entities from {}", entities.len(), path.display()),
            Err(e) => tracing::warn!("Could not load entities from {}: {}", path.display(), e),
        }
    }
    entities
}

async fn cmd_serve(mut config: MapperConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.resolve_api();
    let meta = meta::collect(&config.meta);
    let pipelines = build_pipelines(load_routes(&config.route_dirs), &meta, config.guard());
    let entities = load_entities(&config);

    let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity);
    let mut mqtt = config.mqtt_settings();
    mqtt.last_will = Some(service::last_will(&mqtt.client_id));
    let (broker, event_loop) = MqttBroker::connect(&mqtt, inbound_tx);
    let broker: Arc<dyn Broker> = Arc::new(broker);

    let mut api = ApiClient::new(config.api.client_config())?;
    if config.api.is_configured() {
        api = api.with_renewer(Arc::new(BrokerTokenRenewer::new(
            broker.clone(),
            config.api.token_request_topic.clone(),
        )));
    }
    let api = Arc::new(api);

    let dispatcher = Dispatcher::new(broker.clone())
        .api_client(Some(api.clone()))
        .dry_run(config.dry_run)
        .post_message_delay(config.post_message_delay());

    let mut service = Service::new(
        ServiceSettings::from_config(&config),
        pipelines,
        broker.clone(),
        dispatcher,
        Some(api),
        entities,
    );

    println!("Edge Message Mapper v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();
    for pipeline in service.pipelines() {
        let route = pipeline.route();
        println!(
            "Route: {} [{}]{}",
            route.name,
            route.topics.join(", "),
            if route.skip { " (skipped)" } else { "" }
        );
    }
    if config.dry_run {
        println!("Dry run: nothing will be published");
    }
    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    let handle = service.run(inbound_rx).await?;

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    handle.shutdown().await;

    println!("\nFinal Statistics:");
    let stats: Vec<_> = service
        .pipelines()
        .iter()
        .map(|p| p.route().stats.snapshot())
        .collect();
    print_stats(&stats);

    if let Err(e) = broker.disconnect().await {
        tracing::warn!("Disconnect failed: {}", e);
    }
    let _ = tokio::time::timeout(Duration::from_secs(2), event_loop).await;
    Ok(())
}

fn cmd_routes_list(config: &MapperConfig) -> Result<(), Box<dyn std::error::Error>> {
    let routes = load_routes(&config.route_dirs);
    println!("{}", "Routes".cyan().bold());
    for route in &routes {
        let source = route
            .source
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let name = if route.skip {
            format!("{} (skip)", route.name).dimmed()
        } else {
            route.name.bold()
        };
        println!("  {}", name);
        println!("    topics: {}", route.topics.join(", "));
        if route.preprocessor.is_some() {
            println!("    preprocessor: csv");
        }
        println!("    file:   {}", source);
    }
    println!();
    println!("{} routes", routes.len());
    Ok(())
}

async fn cmd_routes_check(
    config: &MapperConfig,
    topic: &str,
    message: &str,
    compact: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let message = if !message.is_empty() && Path::new(message).is_file() {
        tracing::info!("Reading input message from file {}", message);
        std::fs::read_to_string(message)?
    } else {
        message.to_string()
    };

    let meta = meta::collect(&config.meta);
    let pipelines = build_pipelines(load_routes(&config.route_dirs), &meta, config.guard());
    tracing::debug!("Total routes: {}", pipelines.len());
    let entities = load_entities(config);

    let checker = Checker::new(pipelines, entities.variables(), config.max_depth);
    let use_color = std::io::stdout().is_terminal();
    let mut stdout = std::io::stdout().lock();

    let result = checker
        .run(topic, &message, |step| {
            if let Err(e) = render_step(&mut stdout, step, compact, use_color) {
                tracing::warn!("Could not print output: {}", e);
            }
        })
        .await;

    match result {
        Ok(iterations) => {
            tracing::info!("No more messages to process ({} iterations)", iterations);
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn cmd_gen_config(output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::write(output, EXAMPLE_CONFIG)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    match MapperConfig::from_file(path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Mapper: {}", config.name);
            println!("Broker: {}:{}", config.broker.host, config.broker.port);
            println!("Max depth: {}", config.max_depth);
            println!("Route directories:");
            for dir in &config.route_dirs {
                let count = load_routes(std::slice::from_ref(dir)).len();
                println!("  {} ({} routes)", dir.display(), count);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_stats(stats: &[RouteStatsSnapshot]) {
    println!("--- Route Statistics ---");
    for stat in stats {
        println!(
            "  {}: {} msgs ({:.1} msg/s), {} dispatched, {} skipped, {} errors",
            stat.name,
            stat.messages_processed,
            stat.messages_per_second(),
            stat.messages_dispatched,
            stat.messages_skipped,
            stat.errors
        );
    }
}
