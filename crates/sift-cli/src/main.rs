use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use sift_client::{OpenAiOracle, PlainTextCleaner};
use sift_core::models::{DocumentTexts, ExtractionResult, Job};
use sift_core::traits::{RuleStore, TextCleaner};
use sift_core::{JsonRuleStore, Mode, RunConfig, Scheduler, TracingRunReporter};

#[derive(Parser)]
#[command(name = "sift", version, about = "Document field extraction with learned patterns")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract fields from a batch of documents
    Extract {
        /// JSON file with the job list (`document_key`, `label`, `field_schema`)
        #[arg(short, long)]
        batch: PathBuf,

        /// Directory holding the extracted text of each document
        #[arg(short, long)]
        texts: PathBuf,

        /// Run mode: standard, smart or pro
        #[arg(long, env = "SIFT_MODE", default_value = "smart")]
        mode: Mode,

        /// Rules file, read before the run and rewritten after it
        #[arg(short, long, env = "SIFT_RULES", default_value = "rules.json")]
        rules: PathBuf,

        /// LLM model to use (e.g., "gpt-4o-mini", "gemini-2.5-flash")
        #[arg(short, long, env = "SIFT_MODEL")]
        model: String,

        /// OpenAI-compatible API base URL
        #[arg(
            long,
            env = "SIFT_BASE_URL",
            default_value = "https://api.openai.com/v1"
        )]
        base_url: String,

        /// API key (reads from SIFT_API_KEY env var if not provided)
        #[arg(short, long, env = "SIFT_API_KEY")]
        api_key: String,

        /// Deadline for each oracle call, in seconds
        #[arg(long, env = "SIFT_TIMEOUT_SECS", default_value_t = 20)]
        timeout_secs: u64,

        /// Normalize the text (whitespace, accents) before extraction
        #[arg(long, default_value_t = false)]
        clean: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },

    /// List cached patterns
    Rules {
        /// Rules file
        #[arg(short, long, env = "SIFT_RULES", default_value = "rules.json")]
        rules: PathBuf,

        /// Only show patterns for this label
        #[arg(short, long)]
        label: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sift=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Extract {
            batch,
            texts,
            mode,
            rules,
            model,
            base_url,
            api_key,
            timeout_secs,
            clean,
            format,
        } => {
            let cleaner = clean.then(PlainTextCleaner::new);
            let config = RunConfig::default()
                .with_mode(mode)
                .with_oracle_timeout(Duration::from_secs(timeout_secs))
                .with_learning_timeout(Duration::from_secs(timeout_secs));
            let oracle = OpenAiOracle::with_base_url(&api_key, &model, &base_url)
                .and_then(|o| o.with_timeout(config.oracle_timeout))
                .map_err(|e| anyhow::anyhow!(e))?;

            cmd_extract(
                &batch,
                &texts,
                cleaner.as_ref(),
                oracle,
                JsonRuleStore::new(rules),
                config,
                format,
            )
            .await?;
        }
        Commands::Rules { rules, label } => {
            cmd_rules(&JsonRuleStore::new(rules), label.as_deref()).await?;
        }
    }

    Ok(())
}

async fn cmd_extract(
    batch_path: &Path,
    texts_dir: &Path,
    cleaner: Option<&PlainTextCleaner>,
    oracle: OpenAiOracle,
    store: JsonRuleStore,
    config: RunConfig,
    format: OutputFormat,
) -> Result<()> {
    // 1. Load the job list
    let batch = tokio::fs::read_to_string(batch_path)
        .await
        .with_context(|| format!("Failed to read batch file: {}", batch_path.display()))?;
    let jobs: Vec<Job> = serde_json::from_str(&batch).context("Invalid JSON in batch file")?;

    tracing::info!(jobs = jobs.len(), mode = %config.mode, "Loaded batch");

    // 2. Load (and optionally clean) each document's text
    let texts = load_texts(&jobs, texts_dir, cleaner).await?;

    // 3. Run
    let scheduler = Scheduler::new(oracle.clone(), oracle, store, config);
    let cache = scheduler
        .load_cache()
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to load rules")?;
    let outcome = scheduler.run(&jobs, &texts, cache, &TracingRunReporter).await;

    // 4. Output results to stdout
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&outcome.results)?);
        }
        OutputFormat::Csv => write_csv(&outcome.results)?,
    }

    Ok(())
}

async fn load_texts(
    jobs: &[Job],
    dir: &Path,
    cleaner: Option<&PlainTextCleaner>,
) -> Result<DocumentTexts> {
    let mut texts = DocumentTexts::new();
    let mut seen = HashSet::new();

    for job in jobs {
        if !seen.insert(job.document_key.as_str()) {
            continue;
        }
        let Some(path) = find_text(dir, &job.document_key).await else {
            tracing::warn!(document_key = %job.document_key, "No text file found");
            continue;
        };
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read text file: {}", path.display()))?;
        let text = match cleaner {
            Some(c) => c.clean(&raw).map_err(|e| anyhow::anyhow!(e))?,
            None => raw,
        };
        texts.insert(job.document_key.clone(), Arc::from(text));
    }

    tracing::info!(documents = texts.len(), "Loaded document texts");
    Ok(texts)
}

/// Look for `<dir>/<key>`, then `<dir>/<key>.txt`, then `<dir>/<stem>.txt`.
async fn find_text(dir: &Path, document_key: &str) -> Option<PathBuf> {
    let mut candidates = vec![
        dir.join(document_key),
        dir.join(format!("{document_key}.txt")),
    ];
    if let Some(stem) = Path::new(document_key).file_stem().and_then(|s| s.to_str()) {
        candidates.push(dir.join(format!("{stem}.txt")));
    }

    for candidate in candidates {
        if tokio::fs::metadata(&candidate)
            .await
            .is_ok_and(|m| m.is_file())
        {
            return Some(candidate);
        }
    }
    None
}

fn write_csv(results: &[ExtractionResult]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    writer.write_record(["document_key", "label", "field", "value"])?;
    for result in results {
        for (field, value) in result.fields.iter() {
            writer.write_record([
                result.document_key.as_str(),
                result.label.as_str(),
                field,
                value.unwrap_or_default(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

async fn cmd_rules(store: &JsonRuleStore, label: Option<&str>) -> Result<()> {
    let rules = store
        .load()
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to load rules from {}", store.path().display()))?;

    let mut shown = 0;
    for (rule_label, fields) in &rules {
        if label.is_some_and(|l| l != rule_label) {
            continue;
        }
        println!("{}:", rule_label);
        for (field, pattern) in fields {
            println!("  {:<20} {}", field, pattern);
            shown += 1;
        }
    }

    if shown == 0 {
        println!("No patterns found in {}", store.path().display());
    } else {
        println!("\nTotal: {} patterns", shown);
    }

    Ok(())
}
