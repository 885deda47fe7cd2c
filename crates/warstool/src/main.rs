use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use warstool_core::capture::{
    CaptureUnit, default_capture_filename, list_captures, write_capture,
};
use warstool_core::config::{WarsConfig, load_config};
use warstool_core::crawl::{CancelToken, CrawlOptions, CrawlReport, CrawlStatus, crawl};
use warstool_core::extract::RecordExtractor;
use warstool_core::fetch::{FetchError, HttpPageFetcher, PageFetcher};
use warstool_core::merge::{archive_inputs, merge_files};
use warstool_core::query::{GameType, HistoryQuery, InitPosType, OpponentType, current_month};
use warstool_core::rank::Rank;
use warstool_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, normalize_for_display, resolve_paths,
};
use warstool_core::session::{Credentials, CookieSessionProvider, Session, SessionProvider};

#[derive(Debug, Parser)]
#[command(
    name = "warstool",
    version,
    about = "Crawl, store and merge Shogi Wars match history"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    result_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    result_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            result_dir: cli.result_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Crawl one month of match history into a capture file")]
    Crawl(CrawlArgs),
    #[command(about = "Merge capture files, dropping duplicate matches")]
    Merge(MergeArgs),
    #[command(about = "List capture files in the result directory")]
    List,
    #[command(about = "Extract matches from a saved history page")]
    Extract(ExtractArgs),
    #[command(about = "Sort rank labels strongest first")]
    Rank(RankArgs),
}

#[derive(Debug, Args)]
struct CrawlArgs {
    #[arg(long, value_name = "ID", help = "Account to crawl (default: the session's account)")]
    account: Option<String>,
    #[arg(long, value_name = "TEXT", help = "Keep only matches whose participants contain TEXT")]
    opponent: Option<String>,
    #[arg(long, value_name = "YYYY-MM", help = "Target month (default: current month)")]
    month: Option<String>,
    #[arg(long, value_name = "CODE", default_value = "10min", help = "10min, sb, s1 or a server gtype code")]
    gtype: String,
    #[arg(long, value_name = "KIND", default_value = "normal")]
    opponent_type: String,
    #[arg(long, value_name = "KIND", default_value = "normal")]
    init_pos_type: String,
    #[arg(long, value_name = "PAGES", help = "Stop after this many pages")]
    limit: Option<u32>,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(long, value_name = "VALUE", help = "Session cookie (default: SHOGIWARS_SESSION_COOKIE)")]
    session_cookie: Option<String>,
    #[arg(long, value_name = "DIR", num_args = 0..=1, help = "Save each fetched page as history_page_<n>.html")]
    dump_html: Option<Option<PathBuf>>,
    #[arg(long, value_name = "SECONDS", help = "Cancel the crawl after this long")]
    max_duration_secs: Option<u64>,
}

#[derive(Debug, Args)]
struct MergeArgs {
    #[arg(required = true, value_name = "INPUT")]
    inputs: Vec<PathBuf>,
    #[arg(long, value_name = "PATH")]
    output: PathBuf,
    #[arg(long, help = "Move merged inputs into the backup directory")]
    archive: bool,
}

#[derive(Debug, Args)]
struct ExtractArgs {
    html_file: PathBuf,
    #[arg(long, value_name = "ID", default_value = "")]
    account: String,
    #[arg(long, value_name = "TEXT")]
    opponent: Option<String>,
}

#[derive(Debug, Args)]
struct RankArgs {
    #[arg(required = true)]
    ranks: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Crawl(args)) => run_crawl(&runtime, args),
        Some(Commands::Merge(args)) => run_merge(&runtime, args),
        Some(Commands::List) => run_list(&runtime),
        Some(Commands::Extract(args)) => run_extract(&runtime, args),
        Some(Commands::Rank(args)) => run_rank(args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Writes every fetched page body before handing it on.
struct DumpingFetcher<F> {
    inner: F,
    dump_dir: Option<PathBuf>,
}

impl<F: PageFetcher> PageFetcher for DumpingFetcher<F> {
    fn fetch_page(
        &mut self,
        session: &Session,
        query: &HistoryQuery,
        page: u32,
    ) -> std::result::Result<String, FetchError> {
        let body = self.inner.fetch_page(session, query, page)?;
        if let Some(dir) = &self.dump_dir {
            let path = dir.join(format!("history_page_{page}.html"));
            if let Err(error) = fs::create_dir_all(dir).and_then(|()| fs::write(&path, &body)) {
                warn!(path = %path.display(), %error, "failed to dump history page");
            }
        }
        Ok(body)
    }

    fn request_count(&self) -> usize {
        self.inner.request_count()
    }
}

fn run_crawl(runtime: &RuntimeOptions, args: CrawlArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;

    let credentials = Credentials::resolve(args.session_cookie, args.account)?;
    let provider = CookieSessionProvider::from_config(&config);
    let (session, account) = provider.establish_session(&credentials)?;

    let query = HistoryQuery {
        account,
        opponent: None,
        month: args.month.unwrap_or_else(current_month),
        game_type: GameType::parse(&args.gtype)?,
        opponent_type: OpponentType::parse(&args.opponent_type)?,
        init_pos_type: InitPosType::parse(&args.init_pos_type)?,
        page_limit: args.limit,
    }
    .with_opponent(args.opponent.as_deref());
    query.validate()?;

    let output = args
        .output
        .unwrap_or_else(|| paths.result_dir.join(default_capture_filename(&query)));
    let mut fetcher = DumpingFetcher {
        inner: HttpPageFetcher::new(),
        dump_dir: args
            .dump_html
            .map(|dir| dir.unwrap_or_else(|| paths.dump_dir.clone())),
    };
    let cancel = match args.max_duration_secs {
        Some(seconds) => CancelToken::new().with_deadline(Duration::from_secs(seconds)),
        None => CancelToken::new(),
    };

    let report = crawl(
        &mut fetcher,
        &session,
        &RecordExtractor::new(&config.base_url()),
        &query,
        &CrawlOptions::from_config(&config),
        &cancel,
    );

    let outcome = report_crawl(&mut io::stdout().lock(), &query, report, &output);
    print_diagnostics(runtime, &paths, &config);

    if let CrawlStatus::Aborted(reason) = outcome? {
        bail!(
            "crawl aborted for account {} month {}: {reason}",
            query.account,
            query.month
        );
    }
    Ok(())
}

/// Prints the crawl summary, then persists the capture. The summary is
/// written even when persisting fails.
fn report_crawl(
    out: &mut impl Write,
    query: &HistoryQuery,
    report: CrawlReport,
    output: &Path,
) -> Result<CrawlStatus> {
    writeln!(out, "crawl")?;
    writeln!(out, "account: {}", query.account)?;
    writeln!(out, "month: {}", query.month)?;
    writeln!(out, "gtype: {}", query.game_type.label())?;
    writeln!(out, "opponent: {}", query.opponent_filter().unwrap_or("<none>"))?;
    writeln!(out, "status: {}", report.status.label())?;
    writeln!(out, "pages_fetched: {}", report.pages_fetched)?;
    writeln!(out, "requests: {}", report.request_count)?;
    writeln!(out, "matches: {}", report.matches.len())?;
    writeln!(out, "filtered_out: {}", report.filtered_out)?;

    if report.is_aborted() && report.matches.is_empty() {
        writeln!(out, "output: <not written>")?;
        return Ok(report.status);
    }
    let unit = CaptureUnit::from_crawl(query, report.matches);
    if let Err(error) = write_capture(output, &unit) {
        writeln!(out, "output: <write failed>")?;
        return Err(error.into());
    }
    writeln!(out, "output: {}", normalize_for_display(output))?;
    Ok(report.status)
}

fn run_merge(runtime: &RuntimeOptions, args: MergeArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let outcome = merge_files(&args.inputs, &args.output)?;

    println!("merge");
    for (input, stats) in outcome
        .merged_inputs
        .iter()
        .zip(outcome.report.per_input.iter())
    {
        println!(
            "input: {} (total {}, added {}, duplicates {})",
            normalize_for_display(input),
            stats.total,
            stats.added,
            stats.duplicates
        );
    }
    for skipped in &outcome.skipped_inputs {
        println!("skipped: {}", normalize_for_display(skipped));
    }
    println!("matches: {}", outcome.report.unit.matches.len());
    println!("duplicates: {}", outcome.report.duplicates);
    println!("output: {}", normalize_for_display(&args.output));

    if args.archive {
        let moved = archive_inputs(&outcome.merged_inputs, &paths.backup_dir, &args.output)?;
        for target in &moved {
            println!("archived: {}", normalize_for_display(target));
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_list(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let listing = list_captures(&paths.result_dir)?;

    println!("captures: {}", listing.captures.len());
    for capture in &listing.captures {
        let name = capture
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| normalize_for_display(&capture.path));
        println!(
            "{name}\taccount={}\tmonth={}\topponent={}\tmatches={}\tmodified={}",
            capture.account,
            capture.month,
            capture.opponent,
            capture.match_count,
            format_modified(capture.modified)
        );
    }
    if !listing.warnings.is_empty() {
        println!("warnings:");
        for warning in &listing.warnings {
            println!("  - {warning}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_extract(runtime: &RuntimeOptions, args: ExtractArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let raw = fs::read_to_string(&args.html_file)
        .with_context(|| format!("failed to read {}", args.html_file.display()))?;

    let extraction = RecordExtractor::new(&config.base_url()).extract(
        &raw,
        args.account.trim(),
        args.opponent.as_deref(),
    );
    println!("{}", serde_json::to_string_pretty(&extraction)?);
    Ok(())
}

fn run_rank(args: RankArgs) -> Result<()> {
    let mut ranks: Vec<(Rank, &str)> = args
        .ranks
        .iter()
        .map(|label| (Rank::parse(label), label.as_str()))
        .collect();
    ranks.sort_by(|left, right| right.0.cmp(&left.0));
    for (rank, label) in ranks {
        println!("{label}\t{rank}");
    }
    Ok(())
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        result_dir: runtime.result_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides);
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    Ok(resolve_paths(&context, &overrides))
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths, config: &WarsConfig) {
    if !runtime.diagnostics {
        return;
    }
    println!("\n[diagnostics]\n{}", paths.diagnostics());
    println!("base_url={}", config.base_url());
    println!("user_agent={}", config.user_agent());
    println!("politeness_ms={}", config.politeness_ms());
    println!("max_retries={}", config.max_retries());
    println!("retry_delay_ms={}", config.retry_delay_ms());
    println!("timeout_ms={}", config.timeout_ms());
}

fn format_modified(modified: Option<SystemTime>) -> String {
    modified
        .map(|time| {
            DateTime::<Local>::from(time)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "<unknown>".to_string())
}


#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;
    use warstool_core::crawl::{AbortReason, CrawlReport, CrawlStatus};
    use warstool_core::model::{MatchIdentity, MatchRecord, Winner};
    use warstool_core::query::HistoryQuery;

    use super::report_crawl;

    fn report(status: CrawlStatus, ids: &[&str]) -> CrawlReport {
        let matches = ids
            .iter()
            .map(|id| {
                let identity = MatchIdentity::parse(id).expect("valid identity");
                MatchRecord::new(identity, format!("https://shogiwars.heroz.jp/games/{id}"), Winner::First)
            })
            .collect();
        CrawlReport {
            matches,
            status,
            pages_fetched: 2,
            request_count: 2,
            filtered_out: 0,
        }
    }

    #[test]
    fn summary_is_printed_before_a_failed_write() {
        let temp = tempdir().expect("tempdir");
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "not a directory").expect("write blocker");
        let output = blocker.join("capture.json");

        let mut out = Vec::new();
        let result = report_crawl(
            &mut out,
            &HistoryQuery::for_account("ohakado"),
            report(CrawlStatus::Completed, &["ohakado-rival-20251028_220236"]),
            &output,
        );
        assert!(result.is_err());
        let printed = String::from_utf8(out).expect("utf8 output");
        assert!(printed.contains("status: completed"));
        assert!(printed.contains("pages_fetched: 2"));
        assert!(printed.contains("matches: 1"));
        assert!(printed.contains("output: <write failed>"));
        assert!(!output.exists());
    }

    #[test]
    fn completed_crawl_writes_capture() {
        let temp = tempdir().expect("tempdir");
        let output = temp.path().join("result").join("capture.json");

        let mut out = Vec::new();
        let status = report_crawl(
            &mut out,
            &HistoryQuery::for_account("ohakado"),
            report(CrawlStatus::LimitReached, &["ohakado-rival-20251028_220236"]),
            &output,
        )
        .expect("report crawl");
        assert_eq!(status, CrawlStatus::LimitReached);
        assert!(output.is_file());
        let printed = String::from_utf8(out).expect("utf8 output");
        assert!(printed.contains("status: limit_reached"));
        assert!(printed.ends_with("capture.json\n"));
    }

    #[test]
    fn empty_aborted_crawl_skips_the_write() {
        let temp = tempdir().expect("tempdir");
        let output = temp.path().join("capture.json");

        let mut out = Vec::new();
        let status = report_crawl(
            &mut out,
            &HistoryQuery::for_account("ohakado"),
            report(CrawlStatus::Aborted(AbortReason::Cancelled { page: 1 }), &[]),
            &output,
        )
        .expect("report crawl");
        assert!(matches!(status, CrawlStatus::Aborted(_)));
        assert!(!output.exists());
        let printed = String::from_utf8(out).expect("utf8 output");
        assert!(printed.contains("output: <not written>"));
    }
}
