//! CLI binary for edgequake-drawing.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `AnalysisConfig` / `AnalysisRequest` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_drawing::analyze::enhance_all;
use edgequake_drawing::compare::Side;
use edgequake_drawing::pipeline::input::RawDrawing;
use edgequake_drawing::{
    analyze, compare, AnalysisConfig, AnalysisContext, AnalysisProgressCallback, AnalysisRequest,
    ComparisonOutcome, DrawingAnalysisResult, DrawingError, EnhancementProfile, ProgressCallback,
    ProviderId, ProviderSettings, ReasoningDepth,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner with one log line per finished stage. Both sides of a comparison
/// report through the same bar, so lines may interleave.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl AnalysisProgressCallback for CliProgressCallback {
    fn on_preprocess_start(&self, filename: &str, profile: EnhancementProfile) {
        self.bar.set_prefix("Enhancing");
        self.bar.set_message(format!("{filename} ({profile})"));
    }

    fn on_preprocess_complete(&self, width: u32, height: u32, elapsed_ms: u64) {
        self.bar.println(format!(
            "  {} Page enhanced  {}  {}",
            green("✓"),
            dim(&format!("{width}x{height}")),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
    }

    fn on_provider_start(&self, provider: ProviderId) {
        self.bar.set_prefix("Analysing");
        self.bar.set_message(provider.to_string());
    }

    fn on_provider_complete(&self, provider: ProviderId, ok: bool, elapsed_ms: u64) {
        self.bar.println(format!(
            "  {} {:<22}  {}",
            if ok { green("✓") } else { red("✗") },
            provider.to_string(),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Analyse with the default chat provider
  drawing-analyzer bracket.pdf

  # Reasoning provider at maximum depth, JSON to a file
  drawing-analyzer --provider reasoning-effort --reasoning xhigh flange.png -o flange.json

  # Compare two providers and keep the report
  drawing-analyzer --provider structured-extraction --compare-with reasoning-effort \
      --save-report reports/ shaft.pdf

  # Only run the enhancement pipeline and look at the result
  drawing-analyzer --profile aggressive --preprocess-only out/ scan.jpg

PROVIDERS:
  vision-chat            any edgequake-llm chat backend (DRAWING_CHAT_PROVIDER / DRAWING_CHAT_MODEL)
  reasoning-effort       OpenAI Responses API with reasoning.effort (DRAWING_REASONING_MODEL)
  structured-extraction  NDJSON extraction service (DRAWING_EXTRACTION_ENDPOINT)

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY               OpenAI API key (vision-chat, reasoning-effort)
  ANTHROPIC_API_KEY            Anthropic API key (vision-chat)
  GEMINI_API_KEY               Google Gemini API key (vision-chat)
  OPENAI_BASE_URL              Override the OpenAI API base URL
  W24TECHREAD_AUTH_TOKEN       Extraction service token
  W24TECHREAD_AUTH_REGION      Extraction service region
  DRAWING_EXTRACTION_ENDPOINT  Extraction service URL
  PDFIUM_LIB_PATH              Path to libpdfium (file or directory)
"#;

/// Analyse 2D engineering drawings with vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "drawing-analyzer",
    version,
    about = "Analyse 2D engineering drawings and normalise the results into one schema",
    long_about = "Enhance a technical drawing (PDF, PNG, JPEG), send it to an analysis \
provider and print the extracted dimensions, tolerances, material and manufacturing data in \
one provider-independent schema. Two providers can be compared side by side.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Drawing file (.pdf, .png, .jpg, .jpeg).
    input: PathBuf,

    /// Analysis provider: vision-chat, reasoning-effort, structured-extraction.
    #[arg(long, env = "DRAWING_PROVIDER", default_value = "vision-chat")]
    provider: ProviderId,

    /// Also analyse with this provider and compare the two results.
    #[arg(long, env = "DRAWING_COMPARE_WITH")]
    compare_with: Option<ProviderId>,

    /// Enhancement profile: fast, balanced, aggressive.
    #[arg(long, env = "DRAWING_PROFILE", default_value = "balanced")]
    profile: EnhancementProfile,

    /// Reasoning depth: medium, high, xhigh.
    #[arg(long, env = "DRAWING_REASONING", default_value = "high")]
    reasoning: ReasoningDepth,

    /// Drop items whose own confidence is below this (0.0–1.0).
    #[arg(long, env = "DRAWING_THRESHOLD", default_value_t = 0.7)]
    threshold: f64,

    /// Sheet to analyse (1-based).
    #[arg(long, env = "DRAWING_PAGE", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(1..))]
    page: u32,

    /// Rendering DPI for PDF sheets (72–600).
    #[arg(long, env = "DRAWING_DPI", default_value_t = 400,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Retries per provider call on transient failure.
    #[arg(long, env = "DRAWING_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Provider call timeout in seconds.
    #[arg(long, env = "DRAWING_API_TIMEOUT", default_value_t = 600)]
    api_timeout: u64,

    /// Wait this long for the extraction service to signal completion.
    #[arg(long, env = "DRAWING_EXTRACTION_TIMEOUT", default_value_t = 120)]
    extraction_timeout: u64,

    /// Save the comparison report as comparison_<timestamp>.json in this directory.
    #[arg(long, env = "DRAWING_SAVE_REPORT", requires = "compare_with")]
    save_report: Option<PathBuf>,

    /// Only decode and enhance; write PNG pages into this directory.
    #[arg(long, conflicts_with = "compare_with")]
    preprocess_only: Option<PathBuf>,

    /// Attach the provider-native payload as raw_response.
    #[arg(long, env = "DRAWING_RAW")]
    raw: bool,

    /// Print JSON instead of a summary.
    #[arg(long, env = "DRAWING_JSON")]
    json: bool,

    /// Write the JSON result to this file.
    #[arg(short, long, env = "DRAWING_OUTPUT")]
    output: Option<PathBuf>,

    /// Disable the progress spinner.
    #[arg(long, env = "DRAWING_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DRAWING_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and the result.
    #[arg(short, long, env = "DRAWING_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner provides the feedback that matters; keep INFO logs out of
    // its way unless asked for.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress = show_progress.then(CliProgressCallback::new);
    let config = build_config(&cli, progress.clone().map(|p| p as ProgressCallback))?;

    // ── Preprocess-only mode ─────────────────────────────────────────────
    if let Some(dir) = &cli.preprocess_only {
        let outcome = write_enhanced_pages(&cli, &config, dir).await;
        if let Some(p) = &progress {
            p.finish();
        }
        return match outcome {
            Ok(paths) => {
                if !cli.quiet {
                    for path in &paths {
                        eprintln!("{} {}", green("✔"), path.display());
                    }
                }
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => Ok(report_error(&e, cli.json)),
        };
    }

    // ── Run analysis ─────────────────────────────────────────────────────
    let bytes = tokio::fs::read(&cli.input)
        .await
        .with_context(|| format!("Failed to read {}", cli.input.display()))?;
    let filename = cli
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| cli.input.display().to_string());

    let ctx = AnalysisContext::from_settings(config, &ProviderSettings::from_env());
    let request = AnalysisRequest::new(cli.provider, filename, bytes)
        .with_profile(cli.profile)
        .with_reasoning(cli.reasoning)
        .with_threshold(cli.threshold)
        .with_page(cli.page as usize);

    match cli.compare_with {
        None => {
            let outcome = analyze(&ctx, &request).await;
            if let Some(p) = &progress {
                p.finish();
            }
            let result = match outcome {
                Ok(r) => r,
                Err(e) => return Ok(report_error(&e, cli.json)),
            };
            emit(&cli, &result, || print_result(&result)).await?;
        }
        Some(second) => {
            let outcome = compare(&ctx, &request, second).await;
            if let Some(p) = &progress {
                p.finish();
            }
            let outcome = match outcome {
                Ok(o) => o,
                Err(e) => return Ok(report_error(&e, cli.json)),
            };
            if let Some(dir) = &cli.save_report {
                let path = outcome.save(dir).context("Failed to save comparison report")?;
                if !cli.quiet {
                    eprintln!("{} Report saved to {}", green("✔"), bold(&path.display().to_string()));
                }
            }
            emit(&cli, &outcome, || print_comparison(&outcome)).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<AnalysisConfig> {
    let mut builder = AnalysisConfig::builder()
        .dpi(cli.dpi)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .extraction_timeout_secs(cli.extraction_timeout)
        .include_raw_response(cli.raw);
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

/// Print `ErrorReport` tag + message and pick the exit code.
fn report_error(e: &DrawingError, json: bool) -> ExitCode {
    let report = e.report();
    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{s}"),
            Err(_) => eprintln!("[{}] {}", report.kind, report.message),
        }
    } else {
        eprintln!("{} {} {}", red("✘"), bold(&format!("[{}]", report.kind)), report.message);
    }
    ExitCode::from(match report.kind {
        edgequake_drawing::ErrorKind::Preprocessing => 2,
        edgequake_drawing::ErrorKind::Credential => 3,
        _ => 1,
    })
}

/// Write JSON to `--output`, print JSON with `--json`, else the summary.
async fn emit<T: Serialize>(cli: &Cli, value: &T, summary: impl FnOnce()) -> Result<()> {
    if let Some(path) = &cli.output {
        let json = serde_json::to_string_pretty(value).context("Failed to serialise result")?;
        write_atomic(path, json.as_bytes()).await?;
        if !cli.quiet {
            eprintln!("{} Result written to {}", green("✔"), bold(&path.display().to_string()));
        }
    }
    if cli.json {
        let json = serde_json::to_string_pretty(value).context("Failed to serialise result")?;
        println!("{json}");
    } else if cli.output.is_none() || !cli.quiet {
        summary();
    }
    Ok(())
}

/// Atomic write: temp file next to the target, then rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

async fn write_enhanced_pages(
    cli: &Cli,
    config: &AnalysisConfig,
    dir: &Path,
) -> Result<Vec<PathBuf>, DrawingError> {
    let raw = RawDrawing::from_path(&cli.input, config.max_input_bytes).await?;
    if let Some(cb) = &config.progress_callback {
        cb.on_preprocess_start(&raw.filename, cli.profile);
    }
    let pages = enhance_all(&raw, cli.profile, config).await?;

    let stem = cli
        .input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "drawing".to_string());
    std::fs::create_dir_all(dir).map_err(|source| DrawingError::ReportWriteFailed {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut written = Vec::with_capacity(pages.len());
    for page in &pages {
        let path = dir.join(format!("{stem}_page{}_{}.png", page.index, cli.profile));
        page.image
            .save(&path)
            .map_err(|e| DrawingError::ReportWriteFailed {
                path: path.clone(),
                source: io::Error::other(e.to_string()),
            })?;
        written.push(path);
    }
    Ok(written)
}

// ── Summaries ────────────────────────────────────────────────────────────

fn or_dash(v: Option<&str>) -> &str {
    v.unwrap_or("-")
}

fn print_result(r: &DrawingAnalysisResult) {
    let m = &r.metadata;
    let (dims, features, tolerances) = r.item_counts();

    println!("{}", bold(&r.title));
    println!(
        "  Drawing no.  {}   Revision {}   Scale {}",
        or_dash(r.drawing_number.as_deref()),
        or_dash(r.revision.as_deref()),
        or_dash(r.scale.as_deref())
    );
    println!(
        "  Material     {}",
        r.material
            .as_ref()
            .map(|mat| match &mat.standard {
                Some(s) => format!("{} ({s})", mat.name),
                None => mat.name.clone(),
            })
            .unwrap_or_else(|| "-".into())
    );
    println!("  Part         {} / {}", r.geometry.part_type, r.geometry.shape_type);
    println!(
        "  Items        {dims} dimensions, {features} features, {tolerances} tolerances   complexity {:.2}",
        r.geometry.complexity_score
    );
    for (label, d) in &r.geometry.overall_dimensions {
        println!(
            "    {:<24} {} {}{}",
            label,
            d.value,
            d.unit,
            d.tolerance.as_deref().map(|t| format!(" {t}")).unwrap_or_default()
        );
    }
    println!(
        "  Process      {} (setups {}, {})",
        r.manufacturing.primary_process, r.manufacturing.setup_count, r.manufacturing.difficulty_level
    );
    println!(
        "  {}",
        dim(&format!(
            "{} / {}  {:.1}s  confidence {:.0}%  tokens {}",
            m.provider,
            m.model_used,
            m.processing_time,
            m.confidence_score * 100.0,
            m.tokens_used.map(|t| t.to_string()).unwrap_or_else(|| "n/a".into())
        ))
    );
    for w in &m.warnings {
        println!("  {} {}", cyan("⚠"), w);
    }
}

fn print_comparison(o: &ComparisonOutcome) {
    let r = &o.report;
    let name = |side: Side| match side {
        Side::First => &r.first.provider,
        Side::Second => &r.second.provider,
    };

    println!("{}", bold(&format!("{}  vs  {}", r.first.provider, r.second.provider)));
    for f in &r.fields {
        println!(
            "  {} {:<32} {}  |  {}",
            if f.matched { green("✓") } else { red("✗") },
            f.field,
            f.first,
            f.second
        );
    }
    for (label, a, b) in [
        ("dimensions", r.first.counts.dimensions, r.second.counts.dimensions),
        ("features", r.first.counts.features, r.second.counts.features),
        ("tolerances", r.first.counts.tolerances, r.second.counts.tolerances),
        ("surface finishes", r.first.counts.surface_finishes, r.second.counts.surface_finishes),
    ] {
        println!("    {:<32} {a}  |  {b}", label);
    }
    println!(
        "  Matched {}/{} fields   faster: {} (Δ {:.2}s)   higher confidence: {} (Δ {:.2})",
        r.matched_fields,
        r.fields.len(),
        name(r.faster),
        r.time_difference,
        name(r.higher_confidence),
        r.confidence_difference
    );
    for (side, summary) in [(&r.first.provider, &r.first), (&r.second.provider, &r.second)] {
        for w in &summary.warnings {
            println!("  {} {}: {}", cyan("⚠"), side, w);
        }
    }
}
