//! Folio
//!
//! Loads a novel-source plugin and runs one of its operations, printing the
//! result as JSON.

mod config;
mod http;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use folio_runtime::{FilterValues, PluginHandle, PluginHost, RuntimeServices, ScriptModule};

use crate::config::FolioConfig;
use crate::http::HttpFetchBridge;

/// Run novel-source plugins from the command line
#[derive(Parser, Debug)]
#[command(name = "folio")]
#[command(about = "Run novel-source plugins from the command line", long_about = None)]
struct Args {
    /// Path to the plugin script
    plugin: PathBuf,

    /// Plugin id used when the script declares none
    #[arg(long)]
    id: Option<String>,

    /// Config file (defaults to ./folio.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra script made available to `require()`, as NAME=PATH
    #[arg(long = "module", value_name = "NAME=PATH")]
    modules: Vec<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show plugin metadata and capabilities
    Info,
    /// Search the source
    Search {
        query: String,
        #[arg(long, default_value = "1")]
        page: u32,
    },
    /// List popular novels
    Popular {
        #[arg(long, default_value = "1")]
        page: u32,
        /// Filter selections as a JSON object
        #[arg(long)]
        filters: Option<String>,
    },
    /// List latest novels
    Latest {
        #[arg(long, default_value = "1")]
        page: u32,
    },
    /// Show novel details
    Details { url: String },
    /// List chapters, optionally a single page of them
    Chapters {
        url: String,
        #[arg(long)]
        page: Option<u32>,
    },
    /// Print chapter content
    Content { url: String },
    /// Print the plugin's filter definitions
    Filters,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?
        .block_on(async_main(args))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("folio=info,folio_runtime=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn async_main(args: Args) -> Result<()> {
    let config = FolioConfig::load(args.config.as_deref())?;

    let source = std::fs::read_to_string(&args.plugin)
        .with_context(|| format!("Failed to read plugin {}", args.plugin.display()))?;
    let plugin_id = match &args.id {
        Some(id) => id.clone(),
        None => args
            .plugin
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plugin".to_string()),
    };

    let mut services = RuntimeServices::default().with_fetch(Arc::new(HttpFetchBridge::new(&config.http)?));
    for module in &args.modules {
        services = services.with_module(read_module(module)?);
    }

    let host = PluginHost::new(services, config.runtime.clone());
    let handle = host
        .load(source, plugin_id)
        .await
        .with_context(|| format!("Failed to load plugin {}", args.plugin.display()))?;
    info!("Loaded {} v{} ({})", handle.name(), handle.version(), handle.site());

    let result = run(&handle, args.command).await;
    host.close().await.context("Failed to close plugin")?;
    result
}

async fn run(handle: &PluginHandle, command: Command) -> Result<()> {
    match command {
        Command::Info => print(&serde_json::json!({
            "metadata": handle.metadata(),
            "capabilities": handle.capabilities(),
        })),
        Command::Search { query, page } => print(&handle.search_novels(&query, page).await?),
        Command::Popular { page, filters } => {
            let filters: Option<FilterValues> = filters
                .map(|text| serde_json::from_str(&text))
                .transpose()
                .context("--filters must be a JSON object of filter values")?;
            print(&handle.popular_novels(page, filters.as_ref()).await?)
        }
        Command::Latest { page } => print(&handle.latest_novels(page).await?),
        Command::Details { url } => print(&handle.get_novel_details(&url).await?),
        Command::Chapters { url, page: Some(page) } => print(&handle.get_chapters_page(&url, page).await?),
        Command::Chapters { url, page: None } => print(&handle.get_chapters(&url).await?),
        Command::Content { url } => {
            println!("{}", handle.get_chapter_content(&url).await?);
            Ok(())
        }
        Command::Filters => print(&handle.filter_definitions().await?),
    }
}

fn read_module(arg: &str) -> Result<ScriptModule> {
    let (name, path) = arg
        .split_once('=')
        .with_context(|| format!("--module expects NAME=PATH, got {}", arg))?;
    let source = std::fs::read_to_string(path).with_context(|| format!("Failed to read module {}", path))?;
    Ok(ScriptModule::new(name, source))
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
