//! Critic - multilingual movie review sentiment
//!
//! Command-line entry point over the prediction, translation and review
//! workflow library.

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use tracing::{info, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use critic::cli::{Args, CacheAction, Commands};
use critic::config::Config;
use critic::predictor::PredictionResult;
use critic::registry::BackendRegistry;
use critic::store::ReviewStore;
use critic::translate::{format_duration, TranslationCache, Translator};
use critic::{BackendKind, LanguageIdentifier, ReviewMetadata, ReviewWorkflow, SentimentPredictor};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(args.verbose)?;

    let config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if Path::new("config.toml").exists() {
                info!("Found config.toml in current directory, loading...");
                Config::from_file("config.toml")?
            } else {
                Config::default()
            }
        }
    };

    match args.command {
        Commands::Predict { text, model, json } => {
            let predictor = SentimentPredictor::new(&config);
            let kind = parse_backend(model.as_deref(), predictor.default_backend())?;
            let result = predictor.predict_sentiment(&text, kind);

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_prediction(&result);
            }
        }
        Commands::Detect { text } => {
            let identifier = LanguageIdentifier::new(config.language.clone());
            println!("{}", identifier.detect_language(&text));
        }
        Commands::Translate { text, lang } => {
            let lang = match lang {
                Some(lang) => lang,
                None => LanguageIdentifier::new(config.language.clone()).detect_language(&text),
            };
            let translator = Translator::new(&config.translate)?;
            let outcome = translator.translate_to_english(&text, &lang).await;

            println!("Language:   {}", lang);
            println!("Translated: {}", outcome.translated);
            if let Some(model) = &outcome.model {
                println!("Model:      {}", model);
            }
            println!("{}", outcome.text);
        }
        Commands::Analyze { text, model, movie_id, movie_title, rating, save } => {
            let workflow = ReviewWorkflow::new(&config)?;
            let kind = parse_backend(model.as_deref(), workflow.predictor().default_backend())?;
            let metadata = ReviewMetadata { movie_id, movie_title, rating };

            let mut record = workflow.analyze(&text, kind, &metadata).await;
            if save {
                let store = ReviewStore::new(&config.store.backup_path);
                record = store.append(&record)?;
                info!("Saved review {} to {}", record.review_id, store.path().display());
            }
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Models => {
            let registry = BackendRegistry::new(&config);
            let available = registry.available_models();

            println!("\nSentiment Backends:");
            println!("{:<15} {:<15} {:<10}", "Backend", "Artifacts", "Available");
            println!("{}", "-".repeat(40));
            for kind in BackendKind::ALL {
                println!(
                    "{:<15} {:<15} {:<10}",
                    kind.as_str(),
                    registry.artifact_status(kind).as_str(),
                    if available.contains(&kind) { "yes" } else { "no" }
                );
            }

            if registry.is_memory_limited() {
                println!("\nMemory-limited environment: lighter backends are tried first");
            }
        }
        Commands::Recompute { store, model } => {
            let store = ReviewStore::new(store.unwrap_or_else(|| config.store.backup_path.clone()));
            let mut records = store.load_all()?;
            if records.is_empty() {
                println!("No reviews found in {}", store.path().display());
                return Ok(());
            }

            let workflow = ReviewWorkflow::new(&config)?;
            let kind = parse_backend(model.as_deref(), workflow.predictor().default_backend())?;
            let fixed = workflow.recompute(&mut records, kind).await;
            store.rewrite(&records)?;

            println!("Recomputed sentiment for {} of {} reviews", fixed, records.len());
        }
        Commands::Cache { action } => {
            let cache = TranslationCache::new(config.translate.cache_dir.clone());

            match action {
                CacheAction::List => {
                    let items = cache.list().await?;
                    if items.is_empty() {
                        println!("No cached translations found.");
                    } else {
                        println!("\nCached Translations:");
                        println!("{:<35} {:<15} {:<50}", "Model", "Cached", "Source Text");
                        println!("{}", "-".repeat(100));

                        let now = critic::translate::cache::now_secs();
                        for item in items {
                            println!(
                                "{:<35} {:<15} {:<50}",
                                item.model,
                                format_duration(now.saturating_sub(item.cached_at)),
                                preview(&item.source_text, 47)
                            );
                        }
                    }
                }
                CacheAction::Clear => {
                    let deleted_count = cache.clear().await?;
                    println!("Cleared {} cached translations", deleted_count);
                }
                CacheAction::Info => {
                    let items = cache.list().await?;
                    let total_size = dir_size(cache.dir());
                    let now = critic::translate::cache::now_secs();

                    println!("\nTranslation Cache:");
                    println!("Directory: {}", cache.dir().display());
                    println!("Entries: {}", items.len());
                    println!("Size: {:.2} MB", total_size as f64 / 1024.0 / 1024.0);
                    if let Some(newest) = items.first() {
                        println!("Newest entry: {} ago", format_duration(now.saturating_sub(newest.cached_at)));
                    }
                    if let Some(oldest) = items.last() {
                        println!("Oldest entry: {} ago", format_duration(now.saturating_sub(oldest.cached_at)));
                    }

                    let mut models: Vec<&str> = items.iter().map(|i| i.model.as_str()).collect();
                    models.sort_unstable();
                    models.dedup();
                    println!("Models used: {:?}", models);
                }
            }
        }
    }

    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = std::env::current_dir()?.join(".critic").join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Daily rotation; the guard must outlive main
    let file_appender = rolling::daily(&log_dir, "critic.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);
    std::mem::forget(guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("critic.log").display()
    );

    Ok(())
}

fn parse_backend(name: Option<&str>, default: BackendKind) -> Result<BackendKind> {
    match name {
        Some(name) => Ok(name.parse()?),
        None => Ok(default),
    }
}

fn print_prediction(result: &PredictionResult) {
    println!("Label:        {}", result.label);
    println!("Score:        {:.4}", result.score);
    println!("P(positive):  {:.4}", result.prob_positive);
    println!("P(negative):  {:.4}", result.prob_negative);
    println!("Entropy:      {:.4}", result.entropy);
    println!("Backend:      {} (requested {})", result.backend_used, result.requested);
    println!("Elapsed:      {:.3}s", result.elapsed_time);
    if let Some(warning) = &result.warning {
        println!("Warning:      {}", warning);
    }
    if let Some(error) = &result.error {
        println!("Error:        {}", error);
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}

fn dir_size(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}
