use std::collections::BTreeMap;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use scirex_s2orc_join::app::{App, JoinOptions, locations_only};
use scirex_s2orc_join::config::{ConfigLoader, ResolvedConfig};
use scirex_s2orc_join::download::HttpShardDownloader;
use scirex_s2orc_join::error::JoinError;
use scirex_s2orc_join::lookup::SemanticScholarHttpClient;
use scirex_s2orc_join::output::{JsonOutput, LogSink};
use scirex_s2orc_join::scirex::{collect_doc_ids, document_title, read_documents};
use scirex_s2orc_join::store::Store;

#[derive(Parser)]
#[command(name = "scirex-join")]
#[command(about = "Map SciREX documents to their S2ORC shard locations")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Locate, resolve and join (default)")]
    Run(RefreshArgs),
    #[command(about = "Scan pdf_parses shards for SciREX content hashes")]
    Locate(RefreshArgs),
    #[command(about = "Resolve lookup metadata for every SciREX document")]
    Resolve(RefreshArgs),
    #[command(about = "Print the title derived for each SciREX document")]
    Titles,
}

#[derive(Args, Clone, Default)]
struct RefreshArgs {
    #[arg(long)]
    refresh_locations: bool,

    #[arg(long)]
    refresh_metadata: bool,

    #[arg(long)]
    refresh_join: bool,

    /// Print SciREX id to location only, without the report.
    #[arg(long)]
    mapping_only: bool,
}

impl RefreshArgs {
    fn options(&self) -> JoinOptions {
        JoinOptions {
            refresh_locations: self.refresh_locations,
            refresh_metadata: self.refresh_metadata,
            refresh_join: self.refresh_join,
        }
    }
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<JoinError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &JoinError) -> u8 {
    match error {
        err if err.is_configuration() => 2,
        JoinError::LookupHttp(_)
        | JoinError::LookupStatus { .. }
        | JoinError::RateLimitExhausted { .. }
        | JoinError::LookupTimeout { .. }
        | JoinError::DownloadHttp(_)
        | JoinError::DownloadStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run(RefreshArgs::default())) {
        Commands::Run(args) => run_join(config, args),
        Commands::Locate(args) => run_locate(config, args),
        Commands::Resolve(args) => run_resolve(config, args),
        Commands::Titles => run_titles(config),
    }
}

fn build_app(
    config: ResolvedConfig,
) -> miette::Result<App<SemanticScholarHttpClient, HttpShardDownloader, Store>> {
    let store = Store::new(&config);
    store.ensure_cache_root()?;
    let lookup = SemanticScholarHttpClient::new(&config.lookup)?;
    let downloader = HttpShardDownloader::new()?;
    Ok(App::new(config, lookup, downloader, store))
}

fn run_join(config: ResolvedConfig, args: RefreshArgs) -> miette::Result<()> {
    let scirex_ids = collect_doc_ids(&config.scirex_splits)?;
    let app = build_app(config)?;
    let (joined, report) = app.run(&scirex_ids, &args.options(), &LogSink)?;
    if args.mapping_only {
        JsonOutput::print_json(&locations_only(&joined)).into_diagnostic()?;
    } else {
        JsonOutput::print_report(&report).into_diagnostic()?;
    }
    Ok(())
}

fn run_locate(config: ResolvedConfig, args: RefreshArgs) -> miette::Result<()> {
    let scirex_ids = collect_doc_ids(&config.scirex_splits)?;
    let app = build_app(config)?;
    let (locations, result) = app.locate(&scirex_ids, &args.options(), &LogSink)?;
    if args.mapping_only {
        JsonOutput::print_json(&locations).into_diagnostic()?;
    } else {
        JsonOutput::print_locate(&result).into_diagnostic()?;
    }
    Ok(())
}

fn run_resolve(config: ResolvedConfig, args: RefreshArgs) -> miette::Result<()> {
    let scirex_ids = collect_doc_ids(&config.scirex_splits)?;
    let app = build_app(config)?;
    let options = args.options();
    let (locations, _) = app.locate(&scirex_ids, &options, &LogSink)?;
    let metadatas = app.resolve_metadata(&scirex_ids, &locations, &options, &LogSink)?;
    JsonOutput::print_json(&metadatas).into_diagnostic()?;
    Ok(())
}

fn run_titles(config: ResolvedConfig) -> miette::Result<()> {
    let mut titles = BTreeMap::new();
    for split in &config.scirex_splits {
        for doc in read_documents(split)? {
            let title = document_title(&doc)?;
            titles.insert(doc.doc_id, title);
        }
    }
    JsonOutput::print_json(&titles).into_diagnostic()?;
    Ok(())
}
