use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use flowline::compiler::{self, CompileOptions};
use flowline::config::Config;
use flowline::flows::FlowDefinition;
use flowline::flows::file_store::FileStore;
use flowline::flows::store::Store;
use flowline::server;

#[derive(Parser)]
#[command(name = "flowline", about = "Flow graph compiler and execution stream server")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
    /// Validate and compile a flow definition file (JSON or YAML)
    Compile {
        file: PathBuf,
        /// Only validate; do not build the executor
        #[arg(long)]
        validate_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but still allow --help
    // and --version to work.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve
    } else {
        Cli::parse()
    };

    match cli {
        Cli::Serve => run_server().await,
        Cli::Compile {
            file,
            validate_only,
        } => {
            init_tracing(false);
            let success = compile_file(&file, validate_only)?;
            if !success {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn init_tracing(with_sentry: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("flowline=info,tower_http=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_tree::HierarchicalLayer::new(2)
            .with_targets(true)
            .with_bracketed_fields(false)
            .with_writer(std::io::stderr),
    );

    if with_sentry {
        registry
            .with(sentry::integrations::tracing::layer().event_filter(
                |metadata| match *metadata.level() {
                    tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                    tracing::Level::WARN | tracing::Level::INFO => {
                        sentry::integrations::tracing::EventFilter::Breadcrumb
                    }
                    _ => sentry::integrations::tracing::EventFilter::Ignore,
                },
            ))
            .init();
    } else {
        registry.init();
    }
}

fn load_flow(path: &Path) -> Result<FlowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read flow file: {}", path.display()))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    if is_yaml {
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse flow YAML: {}", path.display()))
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse flow JSON: {}", path.display()))
    }
}

/// Print the compilation report to stdout; returns whether it succeeded.
fn compile_file(path: &Path, validate_only: bool) -> Result<bool> {
    let flow = load_flow(path)?;
    let result = compiler::compile(&flow, CompileOptions { validate_only });

    for issue in &result.errors {
        tracing::error!(
            code = %issue.code,
            node = ?issue.node_id,
            edge = ?issue.edge_id,
            "{}",
            issue.message
        );
    }
    for issue in &result.warnings {
        tracing::warn!(
            code = %issue.code,
            node = ?issue.node_id,
            edge = ?issue.edge_id,
            "{}",
            issue.message
        );
    }

    let report = serde_json::to_string_pretty(&result.report())
        .context("failed to serialize compilation result")?;
    println!("{report}");
    Ok(result.success)
}

async fn run_server() -> Result<(), Box<dyn Error>> {
    let config = Config::from_env();
    init_tracing(true);

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    let store: Arc<dyn Store> = Arc::new(FileStore::new(&config.data_dir));
    store.load_all().await.context("failed to load store")?;
    tracing::info!(data_dir = %config.data_dir.display(), "Store ready");

    let app = server::create_app(server::AppState::new(store))
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "Listening");
    axum::serve(listener, app).await?;

    Ok(())
}
