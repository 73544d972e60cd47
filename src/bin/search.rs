//! Search binary entry point.
//!
//! Command-line interface over the live index snapshot. Supports single-query
//! and interactive REPL modes with table or JSON output.
//!
//! # Examples
//!
//! Single query:
//! ```bash
//! search --query "neural networks"
//! ```
//!
//! JSON output:
//! ```bash
//! search --query "transformers" --format json --top-k 10
//! ```
//!
//! Interactive mode:
//! ```bash
//! search --interactive
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, ContentArrangement, Table};
use paper_search::{
    app::SearchContext,
    config::ConfigLoader,
    embedding::EmbeddingProvider,
    logging::init_logging,
    models::SearchResult,
    query::QueryService,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::{debug, error, info};

/// Output format for search results
#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    /// Human-friendly table
    Table,
    /// Machine-readable JSON format
    Json,
}

/// Search binary CLI for querying the paper index
#[derive(Parser, Debug)]
#[command(
    name = "search",
    version,
    about = "Search papers using semantic similarity",
    long_about = "Query the current index snapshot. Smaller distances mean closer matches. \
                  Run build-index first if no snapshot exists yet.

EXAMPLES:
  Single query:
    search --query \"neural networks\"

  JSON output:
    search --query \"transformers\" --format json

  Interactive mode:
    search --interactive"
)]
struct Args {
    /// Search prompt (required for single-query mode, omitted in interactive mode)
    #[arg(long, value_name = "TEXT", conflicts_with = "interactive")]
    query: Option<String>,

    /// Number of results to return (defaults to server.default_top_k)
    #[arg(long, value_name = "N")]
    top_k: Option<usize>,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Enable interactive REPL mode
    #[arg(long, short = 'i')]
    interactive: bool,

    /// Configuration file (defaults to ./paper-search.yaml when present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

const HELP: &str = "Commands:
  <query>          - Search for papers
  /top N           - Set number of results to N
  /format table    - Use table output format
  /format json     - Use JSON output format
  /detail N        - Show full details for result rank N
  /help            - Show this help
  Ctrl+D or Ctrl+C - Exit";

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

/// Format results as a pretty table
fn format_results_table(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No results found.".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Rank").add_attribute(Attribute::Bold),
        Cell::new("Title").add_attribute(Attribute::Bold),
        Cell::new("ID").add_attribute(Attribute::Bold),
        Cell::new("Distance").add_attribute(Attribute::Bold),
        Cell::new("URL").add_attribute(Attribute::Bold),
    ]);

    for (idx, result) in results.iter().enumerate() {
        table.add_row(vec![
            Cell::new(idx + 1),
            Cell::new(truncate(&result.title, 60)),
            Cell::new(&result.record_id),
            Cell::new(format!("{:.4}", result.distance)),
            Cell::new(result.url.as_deref().unwrap_or("-")),
        ]);
    }

    table.to_string()
}

fn format_results_json(results: &[SearchResult]) -> Result<String> {
    serde_json::to_string_pretty(results).context("Failed to serialize results to JSON")
}

/// Display detailed view of a single result
fn display_result_detail(result: &SearchResult, rank: usize) {
    println!("\n{}", "═".repeat(80));
    println!("Rank: {}", rank);
    println!("Title: {}", result.title);
    println!("ID: {}", result.record_id);
    if let Some(url) = &result.url {
        println!("URL: {}", url);
    }
    println!("Distance: {:.4}", result.distance);
    println!("\nAbstract:\n{}", result.abstract_text);
    println!("{}", "═".repeat(80));
}

fn print_results(results: &[SearchResult], format: &OutputFormat, elapsed_secs: f64) -> Result<()> {
    match format {
        OutputFormat::Table => {
            println!("{}", format_results_table(results));
            println!("\nFound {} results in {:.2}s", results.len(), elapsed_secs);
        }
        OutputFormat::Json => println!("{}", format_results_json(results)?),
    }
    Ok(())
}

/// Run interactive REPL mode
async fn run_interactive<E: EmbeddingProvider>(
    service: QueryService<E>,
    mut top_k: usize,
    mut format: OutputFormat,
) -> Result<()> {
    println!("Interactive Paper Search");
    println!("{}\n", HELP);

    let mut rl = DefaultEditor::new().context("Failed to create readline editor")?;
    let mut last_results: Vec<SearchResult> = Vec::new();

    loop {
        match rl.readline("Search> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line).ok();

                if line.starts_with('/') {
                    let parts: Vec<&str> = line.split_whitespace().collect();
                    match parts.as_slice() {
                        ["/help"] => println!("{}", HELP),
                        ["/top", n] => match n.parse::<usize>() {
                            Ok(n) if n > 0 && n <= service.max_top_k() => {
                                top_k = n;
                                println!("Set top-k to {}", top_k);
                            }
                            _ => eprintln!("Invalid number: must be between 1 and {}", service.max_top_k()),
                        },
                        ["/format", "table"] => {
                            format = OutputFormat::Table;
                            println!("Set output format to table");
                        }
                        ["/format", "json"] => {
                            format = OutputFormat::Json;
                            println!("Set output format to JSON");
                        }
                        ["/format", ..] => eprintln!("Usage: /format [table|json]"),
                        ["/detail", n] => match n.parse::<usize>() {
                            Ok(rank) if rank > 0 && rank <= last_results.len() => {
                                display_result_detail(&last_results[rank - 1], rank);
                            }
                            _ => eprintln!(
                                "Invalid rank: last search had {} results",
                                last_results.len()
                            ),
                        },
                        [cmd, ..] => eprintln!("Unknown command: {}. Type /help for available commands.", cmd),
                        [] => {}
                    }
                    continue;
                }

                let start = Instant::now();
                match service.query(line, top_k).await {
                    Ok(results) => {
                        if let Err(e) = print_results(&results, &format, start.elapsed().as_secs_f64()) {
                            eprintln!("Error formatting results: {}", e);
                        }
                        last_results = results;
                    }
                    Err(e) => eprintln!("Search failed: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                error!("Error reading input: {}", err);
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ConfigLoader::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging).context("Failed to initialize logging")?;

    if !args.interactive && args.query.is_none() {
        anyhow::bail!(
            "Either --query or --interactive must be specified.\n\
             Use --help for usage information."
        );
    }

    let top_k = args.top_k.unwrap_or(config.server.default_top_k);
    debug!(top_k, "resolved result count");

    let ctx = SearchContext::open(config)
        .await
        .context("Failed to open search context")?;

    if !ctx.load_snapshot().await? {
        anyhow::bail!(
            "No index snapshot found under {}.\n\
             Please run the build-index binary first.",
            ctx.config.snapshots_dir().display()
        );
    }

    let service = ctx.query_service();
    if let Some(manifest) = service.status() {
        info!(
            generation = %manifest.generation,
            model = %manifest.model_name,
            count = manifest.count,
            "serving snapshot"
        );
    }

    match args.query {
        Some(query) => {
            let start = Instant::now();
            let results = service
                .query(&query, top_k)
                .await
                .with_context(|| format!("Failed to execute search for query: '{}'", query))?;
            print_results(&results, &args.format, start.elapsed().as_secs_f64())
        }
        None => run_interactive(service, top_k, args.format).await,
    }
}
