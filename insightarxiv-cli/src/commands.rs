//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use insightarxiv_core::config::{self, FeedConfig};
use insightarxiv_core::loader::LoadPhase;
use insightarxiv_core::offline::server;
use insightarxiv_core::worker::{WorkerEvent, WorkerRequest};
use insightarxiv_core::{
    AppState, CacheStorage, DatabaseBuilder, HttpSource, LoadOptions, MonthKey, MonthLoader,
    OfflineCache, Paper, PaperFilter, ParseWorker, fetch_manifest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            host,
            port,
            upstream,
            persist_dir,
        } => handle_serve(workspace, host, port, upstream, persist_dir).await,
        Commands::Months => handle_months(workspace).await,
        Commands::Load {
            month,
            stream,
            limit,
        } => handle_load(workspace, &month, stream, limit).await,
        Commands::Parse {
            month,
            batch_size,
            full,
        } => handle_parse(workspace, &month, batch_size, full).await,
        Commands::Search {
            query,
            months,
            category,
            limit,
        } => handle_search(workspace, &query, months, category, limit).await,
        Commands::Build {
            input,
            output,
            min_frequency,
        } => handle_build(workspace, &input, output.as_deref(), min_frequency),
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn load_config(workspace: &Path) -> anyhow::Result<FeedConfig> {
    let config = config::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    config.validate()?;
    Ok(config)
}

fn http_source(config: &FeedConfig) -> anyhow::Result<Arc<HttpSource>> {
    Ok(Arc::new(HttpSource::with_timeout(
        &config.data.base_url,
        config.loader.timeout(),
    )?))
}

fn parse_month(month: &str) -> anyhow::Result<MonthKey> {
    Ok(MonthKey::parse(month)?)
}

fn print_papers(papers: &[Paper], limit: usize) {
    for paper in papers.iter().take(limit) {
        println!(
            "  {}  {}  {}",
            paper.id,
            paper.date.as_deref().unwrap_or("----------"),
            paper.title
        );
        if let Some(zh) = paper.zh_title.as_deref().filter(|t| !t.is_empty()) {
            println!("              {}", zh);
        }
    }
    if papers.len() > limit {
        println!("  ... and {} more", papers.len() - limit);
    }
}

async fn handle_serve(
    workspace: &Path,
    host: Option<String>,
    port: Option<u16>,
    upstream: Option<String>,
    persist_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = load_config(workspace)?;
    if let Some(host) = host {
        config.offline.host = host;
    }
    if let Some(port) = port {
        config.offline.port = port;
    }
    if upstream.is_some() {
        config.offline.upstream = upstream;
    }
    if persist_dir.is_some() {
        config.offline.persist_dir = persist_dir;
    }

    let upstream = config
        .offline
        .upstream
        .clone()
        .unwrap_or_else(|| config.data.base_url.clone());
    let network = Arc::new(HttpSource::new(&upstream)?);
    let storage = match &config.offline.persist_dir {
        Some(dir) => CacheStorage::persistent(workspace.join(dir)),
        None => CacheStorage::new(),
    };
    let origin = format!("http://{}:{}/", config.offline.host, config.offline.port);
    let cache = OfflineCache::new(config.offline.clone(), &origin, network, Arc::new(storage))?;

    let report = cache.start().await?;
    if let Err(e) = report.ensure_complete() {
        warn!(failed = ?report.failed, "{}", e);
    }
    println!("Serving {} through the offline cache at {}", upstream, origin);
    println!("Press Ctrl+C to stop.");

    server::run(cache, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    println!("Stopped.");
    Ok(())
}

async fn handle_months(workspace: &Path) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let source = http_source(&config)?;
    let manifest = fetch_manifest(source.as_ref(), &config.data).await?;

    println!(
        "{} months, {} papers{}",
        manifest.available_months.len(),
        manifest.total_paper_count,
        manifest
            .last_updated
            .map(|d| format!(", updated {}", d))
            .unwrap_or_default()
    );
    for month in &manifest.available_months {
        println!("  {}", month);
    }
    Ok(())
}

async fn handle_load(
    workspace: &Path,
    month: &str,
    stream: bool,
    limit: usize,
) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let month = parse_month(month)?;
    let loader = MonthLoader::new(
        http_source(&config)?,
        config.data.clone(),
        config.loader.clone(),
    );
    if stream {
        // Pretend the connection is just below the streaming threshold.
        loader.set_network_speed(
            config
                .loader
                .chunked_threshold_bytes_per_sec
                .saturating_sub(1)
                .max(1),
        );
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<insightarxiv_core::LoadProgress>();
    let reporter = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            let unit = match progress.phase {
                LoadPhase::Streaming => "records",
                LoadPhase::Downloading | LoadPhase::Parsing => "bytes",
            };
            match progress.percentage {
                Some(pct) => info!("{:?}: {} {} ({}%)", progress.phase, progress.loaded, unit, pct),
                None => info!("{:?}: {} {}", progress.phase, progress.loaded, unit),
            }
        }
    });

    let options = LoadOptions::default().chunked(stream).with_progress(tx);
    let mut state = AppState::new(config.cache.clone());
    let result = state.load_month(&loader, &month, options).await;
    let _ = reporter.await;
    let count = result?;

    println!("Loaded {} papers for {}", count, month);
    if let Some(speed) = loader.network_speed() {
        println!("Measured throughput: {} KiB/s", speed / 1024);
    }
    print_papers(
        &state.ordered_papers(&PaperFilter::default().with_month(month)),
        limit,
    );
    Ok(())
}

async fn handle_parse(
    workspace: &Path,
    month: &str,
    batch_size: Option<usize>,
    full: bool,
) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let month = parse_month(month)?;
    let worker = ParseWorker::new(http_source(&config)?, config.worker.clone());

    let mut request = WorkerRequest::new(config.data.month_path(&month), month);
    request.config.base_batch_size = batch_size;
    let mut handle = worker.spawn(request);
    let mut monitor = config.worker.monitor();

    loop {
        let event = match handle.next_event(&mut monitor).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => {
                handle.cancel();
                return Err(e.into());
            }
        };
        let line = match &event {
            WorkerEvent::Batch {
                month,
                papers,
                progress,
            } if !full => serde_json::json!({
                "type": "batch",
                "month": month,
                "papers": papers.len(),
                "progress": progress,
            })
            .to_string(),
            _ => serde_json::to_string(&event)?,
        };
        println!("{}", line);
        if event.is_terminal() {
            break;
        }
    }

    let summary = handle.join().await?;
    info!(
        papers = summary.total_papers,
        batches = summary.batches,
        batch_size = summary.batch_size,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "Parse finished"
    );
    Ok(())
}

async fn handle_search(
    workspace: &Path,
    query: &str,
    months: usize,
    categories: Vec<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let source = http_source(&config)?;
    let manifest = fetch_manifest(source.as_ref(), &config.data).await?;
    let loader = MonthLoader::new(source, config.data.clone(), config.loader.clone());

    let mut state = AppState::new(config.cache.clone());
    for (month, result) in loader.preload_recent(&manifest, months).await {
        match result {
            Ok(papers) => {
                state.apply_load(&month, &papers);
            }
            Err(e) => eprintln!("  Skipping {}: {}", month, e),
        }
    }
    state.set_manifest(manifest);

    let filter = PaperFilter::query(query).with_categories(categories);
    let hits = state.ordered_papers(&filter);
    println!(
        "{} matches for '{}' in {} papers",
        hits.len(),
        query,
        state.paper_count()
    );
    print_papers(&hits, limit);
    Ok(())
}

fn handle_build(
    workspace: &Path,
    input: &Path,
    output: Option<&Path>,
    min_frequency: usize,
) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let input = workspace.join(input);
    let output = output
        .map(|o| workspace.join(o))
        .unwrap_or_else(|| workspace.to_path_buf());

    let mut builder = DatabaseBuilder::new();
    let report = builder.ingest_dir(&input)?;
    println!(
        "Read {} records ({} superseded, {} skipped)",
        report.accepted + report.superseded,
        report.superseded,
        report.skipped
    );

    let database = builder.build(min_frequency)?;
    let written = database.write(&output, &config.data)?;
    println!(
        "Wrote {} papers in {} month files",
        database.manifest.total_paper_count,
        written.month_files.len()
    );
    println!("  manifest:       {}", written.manifest.display());
    println!(
        "  search index:   {} ({} terms)",
        written.search_index.display(),
        database.search_index.len()
    );
    println!(
        "  category index: {} ({} categories)",
        written.category_index.display(),
        database.category_index.len()
    );
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".insightarxiv");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = config::to_toml(&FeedConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(workspace)?;
            println!("{}", config::to_toml(&config)?);
            Ok(())
        }
    }
}
