use segvec::cli::{Cli, Commands, ConfigAction};
use segvec::config::{expand_path, Config, ConfigValidator};
use segvec::embedding::FastEmbedProvider;
use segvec::error::{Result, SegvecError};
use segvec::signals::SignalHandler;
use segvec::storage::{StorageManager, StorageStats};
use segvec::vector::{RankedPage, VectorizeSummary};
use segvec::VectorService;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Status => with_service(cli.config, |service, _| async move {
            cmd_status(&service).await
        })?,
        Commands::Health => with_service(cli.config, |service, _| async move {
            cmd_health(&service).await
        })?,
        Commands::Stats => with_service(cli.config, |service, _| async move {
            cmd_stats(&service).await
        })?,
        Commands::Cleanup => with_service(cli.config, |service, _| async move {
            let report = service.cleanup().await?;
            println!("✓ Cleanup complete");
            println!("  Invalid index records removed: {}", report.invalid_records);
            println!("  Orphan vector rows removed:    {}", report.orphan_entries);
            println!("  Orphan index files removed:    {}", report.orphan_files);
            Ok(())
        })?,
        Commands::Rebuild => with_service(cli.config, |service, cancel| async move {
            let report = service.rebuild(&cancel).await?;
            for summary in &report.summaries {
                print_summary(summary);
            }
            for (group_id, error) in &report.failed {
                println!("Group {}: failed: {}", group_id, error);
            }
            println!(
                "✓ Rebuilt {} group(s), {} failed{}",
                report.succeeded(),
                report.failed.len(),
                if report.cancelled { " [cancelled]" } else { "" }
            );
            Ok(())
        })?,
        Commands::Vectorize { group } => with_service(cli.config, |service, cancel| async move {
            let summary = service.vectorize_group_with_cancel(group, &cancel).await?;
            print_summary(&summary);
            Ok(())
        })?,
        Commands::Search {
            group,
            query,
            skip,
            take,
            json,
        } => with_service(cli.config, |service, cancel| async move {
            let page = service
                .search_with_cancel(group, &query, skip, take, &cancel)
                .await?;
            print_page(&page, skip, json)
        })?,
        Commands::Config { action } => cmd_config(cli.config, action)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "segvec=debug" } else { "segvec=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt().with_env_filter(filter).with_target(false).init();
}

/// Open the store, run `f` and always flush dirty indexes afterwards
fn with_service<F, Fut>(config_path: Option<PathBuf>, f: F) -> Result<()>
where
    F: FnOnce(VectorService, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let config = load_config(config_path)?;

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| SegvecError::io(e, "Failed to create tokio runtime"))?;

    runtime.block_on(async move {
        let data_dir = expand_path(&config.storage.data_dir)?;
        let storage = StorageManager::new(data_dir)?;

        let provider = FastEmbedProvider::new(&config.embedding.model)?;
        let service = VectorService::new(&storage, Arc::new(provider), &config)?;

        let cancel = CancellationToken::new();
        let watcher = SignalHandler::new()?.cancel_on_signal(cancel.clone());

        let result = f(service.clone(), cancel.clone()).await;

        let report = service.shutdown().await;
        cancel.cancel();
        let _ = watcher.await;

        if !report.is_clean() {
            tracing::warn!("Indexes left unsaved: {}", report.failed.join(", "));
        }

        result
    })
}

async fn cmd_status(service: &VectorService) -> Result<()> {
    let status = service.status().await?;

    println!("segvec Status");
    println!("=============");
    println!(
        "\nANN library: {}",
        if status.healthy { "healthy" } else { "UNHEALTHY" }
    );

    println!("\nIndex files:");
    for (kind, count) in &status.index_files {
        println!("  {:<20} {}", kind, count);
    }
    println!("\nVectors on disk: {}", status.total_vectors);
    println!(
        "Index size:      {}",
        StorageStats::format_size(status.total_file_size.max(0) as u64)
    );
    println!("Files in index directory: {}", status.files_on_disk);
    println!(
        "Index directory size:     {}",
        StorageStats::format_size(status.storage.index_dir_size)
    );

    let db = &status.storage.db;
    println!("\nStore:");
    println!("  Messages:        {}", db.message_count);
    println!("  Segments:        {}", db.segment_count);
    println!("  Vector rows:     {}", db.vector_entry_count);
    println!("  Valid index files: {}", db.index_file_count);

    Ok(())
}

async fn cmd_health(service: &VectorService) -> Result<()> {
    if service.is_healthy().await {
        println!("✓ Vector index is operational");
        Ok(())
    } else {
        Err(SegvecError::Other(anyhow::anyhow!(
            "Vector index health check failed"
        )))
    }
}

async fn cmd_stats(service: &VectorService) -> Result<()> {
    let stats = service.stats().await?;

    println!("Segments: {} total", stats.total_segments);
    println!("  Vectorized: {}", stats.vectorized_segments);
    println!("  Pending:    {}", stats.pending_segments);

    println!("\nVector entries:");
    for (kind, count) in &stats.entries_by_kind {
        println!("  {:<20} {}", kind, count);
    }

    if !stats.top_groups.is_empty() {
        println!("\nTop groups by segments:");
        for group in &stats.top_groups {
            println!(
                "  {:>16}  {} segment(s), {} vectorized",
                group.group_id, group.segments, group.vectorized
            );
        }
    }

    Ok(())
}

fn print_summary(summary: &VectorizeSummary) {
    println!(
        "Group {}: {} of {} vectorized, {} skipped, {} failed ({}ms){}",
        summary.group_id,
        summary.vectorized,
        summary.total,
        summary.skipped,
        summary.failed,
        summary.duration_ms,
        if summary.cancelled { " [cancelled]" } else { "" }
    );
}

fn print_page(page: &RankedPage, skip: usize, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(page).map_err(|e| SegvecError::Json {
            source: e,
            context: "Failed to serialize search results".to_string(),
        })?;
        println!("{}", out);
        return Ok(());
    }

    if page.items.is_empty() {
        println!("No matching conversations");
        return Ok(());
    }

    println!("{} matching conversation(s)\n", page.total_count);
    for (rank, hit) in page.items.iter().enumerate() {
        println!(
            "{:>3}. [{:.4}] {}  segment {}",
            skip + rank + 1,
            hit.distance,
            hit.message.date_time.format("%Y-%m-%d %H:%M"),
            hit.segment_id
        );
        println!("     {}", hit.message.content);
    }

    Ok(())
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path)?;
            let json = serde_json::to_string_pretty(&config).map_err(|e| SegvecError::Json {
                source: e,
                context: "Failed to serialize config".to_string(),
            })?;
            println!("{}", json);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SegvecError::io(e, format!("Failed to create config directory: {:?}", parent))
                })?;
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'segvec config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;
        return Ok(config);
    }

    Config::load(&path)
}
