use chat_export_md::assets::EmbedStyle;
use chat_export_md::fetch::{Fetcher, HttpFetcher, OfflineFetcher};
use chat_export_md::fingerprint::FingerprintRegistry;
use chat_export_md::ledger::SqliteLedger;
use chat_export_md::logging;
use chat_export_md::pipeline::Orchestrator;
use chat_export_md::source::{ExportUnit, discover_units};
use chat_export_md::utils::ConvertConfig;

use clap::Parser;
use eyre::{Context, Result, eyre};
use log::{info, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Convert ChatGPT, Claude and Gemini chat exports to Markdown.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding `<provider>/<label>/` export bundles.
    /// Defaults to ./providers if not set in config.
    #[arg(value_name = "PROVIDERS_DIR")]
    providers_dir: Option<PathBuf>,

    /// Directory to write markdown and attachments to.
    /// Defaults to ./obsidian_export if not set in config.
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Path to the ledger of processed bundles.
    /// Defaults to <output>/ledger.sqlite.
    #[arg(long, value_name = "PATH")]
    ledger: Option<PathBuf>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/chat-export-md/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Comma-separated tags to add to frontmatter (e.g. "ai,chat").
    #[arg(long, value_name = "TAGS", value_delimiter = ',')]
    tags: Option<Vec<String>>,

    /// Only process the given bundle(s), as provider/label. Repeatable.
    #[arg(long, value_name = "PROVIDER/LABEL")]
    only: Vec<String>,

    /// Convert bundles even if the ledger says they were already processed.
    #[arg(short, long)]
    force: bool,

    /// Compare bundles against the known export shapes without converting.
    #[arg(long)]
    check: bool,

    /// Skip corrupt conversations instead of failing the whole bundle.
    #[arg(long)]
    skip_corrupt: bool,

    /// Never download remote images.
    #[arg(long)]
    offline: bool,

    /// How images are embedded in the markdown.
    #[arg(long, value_enum, value_name = "STYLE")]
    embed: Option<EmbedStyle>,

    /// Render user messages as blockquotes.
    #[arg(long)]
    quote_user: bool,

    /// Remove emoji from message text.
    #[arg(long)]
    strip_emoji: bool,

    /// Rewrite Unicode math symbols, sub/superscripts and arrow mappings as inline LaTeX.
    #[arg(long)]
    latex: bool,

    /// Remove `---` horizontal rules from message text.
    #[arg(long)]
    drop_rules: bool,

    /// Print the built-in schema fingerprints as JSON and exit.
    #[arg(long)]
    show_fingerprints: bool,

    /// Log every file written and every asset resolved.
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    providers_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    ledger_path: Option<PathBuf>,
    tags: Option<Vec<String>>,
    embed_style: Option<EmbedStyle>,
    quote_user: Option<bool>,
    strip_emoji: Option<bool>,
    latex_symbols: Option<bool>,
    drop_rules: Option<bool>,
    fetch_timeout_secs: Option<u64>,
    fetch_workers: Option<usize>,
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("chat-export-md/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn select_units(units: Vec<ExportUnit>, only: &[String]) -> Result<Vec<ExportUnit>> {
    if only.is_empty() {
        return Ok(units);
    }
    for key in only {
        if !units.iter().any(|u| &u.key() == key) {
            return Err(eyre!("No export bundle named {key}"));
        }
    }
    Ok(units
        .into_iter()
        .filter(|u| only.contains(&u.key()))
        .collect())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    let registry = FingerprintRegistry::builtin();
    if cli.show_fingerprints {
        let json = serde_json::to_string_pretty(&registry.all())
            .wrap_err("Failed to serialize fingerprints")?;
        println!("{json}");
        return Ok(());
    }

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Resolve directories (CLI > Config > Default)
    let providers_dir = cli
        .providers_dir
        .or(file_cfg.providers_dir)
        .unwrap_or_else(|| PathBuf::from("providers"));
    let output_dir = cli
        .output
        .or(file_cfg.output_dir)
        .unwrap_or_else(|| PathBuf::from("obsidian_export"));
    let ledger_path = cli
        .ledger
        .or(file_cfg.ledger_path)
        .unwrap_or_else(|| output_dir.join("ledger.sqlite"));

    if !providers_dir.is_dir() {
        return Err(eyre!(
            "Providers directory not found: {}\nPass it as the first argument or set providers_dir in config.toml.",
            providers_dir.display()
        ));
    }

    // 3. Build the conversion config
    let mut config = ConvertConfig {
        output_dir,
        tags: cli.tags.or(file_cfg.tags),
        embed_style: cli.embed.or(file_cfg.embed_style).unwrap_or_default(),
        quote_user: cli.quote_user || file_cfg.quote_user.unwrap_or(false),
        skip_corrupt: cli.skip_corrupt,
        strip_emoji: cli.strip_emoji || file_cfg.strip_emoji.unwrap_or(false),
        latex_symbols: cli.latex || file_cfg.latex_symbols.unwrap_or(false),
        drop_rules: cli.drop_rules || file_cfg.drop_rules.unwrap_or(false),
        ..Default::default()
    };
    if let Some(secs) = file_cfg.fetch_timeout_secs {
        config.fetch.request_timeout = Duration::from_secs(secs);
    }
    if let Some(workers) = file_cfg.fetch_workers {
        config.fetch_workers = workers.max(1);
    }

    let fetcher: Box<dyn Fetcher> = if cli.offline {
        Box::new(OfflineFetcher)
    } else {
        Box::new(HttpFetcher::new(config.fetch.clone()).wrap_err("Failed to build HTTP client")?)
    };

    // 4. Find bundles
    let units = discover_units(&providers_dir).wrap_err("Failed to list export bundles")?;
    let units = select_units(units, &cli.only)?;
    if units.is_empty() {
        warn!("No export bundles under {}", providers_dir.display());
        return Ok(());
    }
    info!("Found {} export bundle(s).", units.len());

    let orchestrator = Orchestrator::new(config, registry, fetcher);

    // 5. Check only
    if cli.check {
        let mut drifted = 0usize;
        for unit in &units {
            match orchestrator.check_unit(unit) {
                Ok(report) if report.is_empty() => info!("{}: matches", unit.key()),
                Ok(report) => {
                    drifted += 1;
                    info!("{}: {} drift item(s)", unit.key(), report.len());
                }
                Err(e) => {
                    drifted += 1;
                    log::error!("{}: {e}", unit.key());
                }
            }
        }
        if !cli.quiet {
            eprintln!("Checked {} bundle(s), {} with drift.", units.len(), drifted);
        }
        return Ok(());
    }

    // 6. Convert
    let mut ledger = SqliteLedger::open(&ledger_path)
        .wrap_err_with(|| format!("Failed to open ledger: {}", ledger_path.display()))?;
    let summary = orchestrator.run_batch(&units, &mut ledger, cli.force);

    if !cli.quiet {
        eprintln!("{}", summary.line());
    }

    let failed = summary.failed().count();
    if failed > 0 {
        return Err(eyre!("{failed} export bundle(s) failed to convert"));
    }
    Ok(())
}
