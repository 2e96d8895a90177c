use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tessera_core::format::TileArchiveReader;
use tessera_core::pipeline::{
    MapErrorDecision, MissingTiles, MissingTilesDecision, RetryDecision,
};
use tessera_core::source::{
    DirectoryTileCache, FileLayout, FileTileSource, HttpSource, ReqwestClient, UrlTemplate,
};
use tessera_core::telemetry::{MapProgress, ProgressEvent, ProgressSink, tags};
use tessera_core::{
    AtlasCreationOrchestrator, AtlasReport, AtlasSpec, DecisionHandler, DownloadConfig,
    HeadlessPolicy, LayerSpec, LoadMethod, MapBuilder, MapOutcome, MapSpec, TesseraError,
    TileCoord, TileProvider, TileRange, TileSource, TileSourceResolver,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tessera",
    version,
    about = "Tessera tile downloader",
    long_about = "Download map tiles concurrently and assemble them into tile directories."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download tiles from a URL template into a z/x/y directory tree.
    Download {
        /// URL template, e.g. https://tile.example.org/{z}/{x}/{y}.png
        template: String,

        /// Tile range as ZOOM:MINX-MAXX:MINY-MAXY. Repeat for more zoom levels.
        #[arg(short, long = "range", required = true, value_parser = parse_range)]
        ranges: Vec<TileRange>,

        /// Destination directory for assembled tiles.
        #[arg(short, long, default_value = "tiles")]
        output: PathBuf,

        /// Map name used in progress output and directory layout.
        #[arg(long, default_value = "map")]
        name: String,

        /// File extension of written tiles.
        #[arg(long, default_value = "png")]
        ext: String,

        /// TOML file with download settings.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of worker threads (defaults to CPU count).
        #[arg(long)]
        workers: Option<usize>,

        /// Retries per tile after the first attempt.
        #[arg(long)]
        retries: Option<u32>,

        /// Retryable errors tolerated per map before asking what to do.
        #[arg(long)]
        threshold: Option<u64>,

        /// Tile cache directory consulted before the network.
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Fill the tile cache only; requires --cache.
        #[arg(long, default_value_t = false)]
        cache_only: bool,

        /// Never prompt; answer every decision with the given policy.
        #[arg(long, value_enum)]
        headless: Option<HeadlessArg>,

        /// Do not ask about download errors or missing tiles.
        #[arg(long, default_value_t = false)]
        ignore_errors: bool,
    },
    /// Assemble tiles from a local tile directory without downloading.
    Copy {
        /// Root of the source tile tree.
        input: PathBuf,

        #[arg(short, long = "range", required = true, value_parser = parse_range)]
        ranges: Vec<TileRange>,

        #[arg(short, long, default_value = "tiles")]
        output: PathBuf,

        #[arg(long, value_enum, default_value_t = LayoutArg::Osm)]
        layout: LayoutArg,

        #[arg(long, default_value = "png")]
        ext: String,
    },
    /// Print the records of a tile archive.
    Inspect {
        archive: PathBuf,

        /// List every record instead of a summary.
        #[arg(long, default_value_t = false)]
        list: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HeadlessArg {
    /// Keep going and accept gaps.
    Proceed,
    /// Skip maps that hit the error threshold or miss tiles.
    Skip,
    /// Stop the run at the first problem.
    Abort,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LayoutArg {
    Osm,
    Osmand,
    Tms,
}

impl From<LayoutArg> for FileLayout {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::Osm => FileLayout::Osm,
            LayoutArg::Osmand => FileLayout::OsmAnd,
            LayoutArg::Tms => FileLayout::Tms,
        }
    }
}

impl HeadlessArg {
    fn policy(self) -> HeadlessPolicy {
        match self {
            Self::Proceed => HeadlessPolicy::default(),
            Self::Skip => HeadlessPolicy::default()
                .with_retry_decision(RetryDecision::Skip)
                .with_missing_tiles_decision(MissingTilesDecision::Skip)
                .with_map_error_decision(MapErrorDecision::Continue),
            Self::Abort => HeadlessPolicy::default()
                .with_retry_decision(RetryDecision::Abort)
                .with_missing_tiles_decision(MissingTilesDecision::Abort),
        }
    }
}

fn main() {
    init_tracing();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Download {
            template,
            ranges,
            output,
            name,
            ext,
            config,
            workers,
            retries,
            threshold,
            cache,
            cache_only,
            headless,
            ignore_errors,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(retries) = retries {
                config.max_download_retries = retries;
            }
            if let Some(threshold) = threshold {
                config.retry_error_threshold = threshold;
            }

            let decisions: Arc<dyn DecisionHandler> = match headless {
                Some(arg) if ignore_errors => Arc::new(arg.policy().ignoring_download_errors()),
                Some(arg) => Arc::new(arg.policy()),
                None => Arc::new(PromptDecisions { ignore_errors }),
            };
            let request = DownloadRequest {
                template,
                ranges,
                output,
                name,
                ext,
                cache,
                cache_only,
            };
            download_command(config, request, decisions)?
        }
        Commands::Copy {
            input,
            ranges,
            output,
            layout,
            ext,
        } => copy_command(input, ranges, output, layout.into(), ext)?,
        Commands::Inspect { archive, list } => inspect_command(&archive, list)?,
    }

    Ok(())
}

struct DownloadRequest {
    template: String,
    ranges: Vec<TileRange>,
    output: PathBuf,
    name: String,
    ext: String,
    cache: Option<PathBuf>,
    cache_only: bool,
}

/// File settings layered over the defaults; workers default to one per CPU.
fn load_config(path: Option<&Path>) -> anyhow::Result<DownloadConfig> {
    let defaults = DownloadConfig {
        workers: num_cpus::get(),
        ..DownloadConfig::default()
    };
    match path {
        Some(path) => DownloadConfig::from_file_over(path, &defaults)
            .with_context(|| format!("load config {}", path.display())),
        None => Ok(defaults),
    }
}

fn download_command(
    config: DownloadConfig,
    request: DownloadRequest,
    decisions: Arc<dyn DecisionHandler>,
) -> anyhow::Result<()> {
    if request.cache_only && request.cache.is_none() {
        bail!("--cache-only needs a --cache directory");
    }

    let client = Arc::new(ReqwestClient::new(&config.http)?);
    let template = UrlTemplate::parse(&request.template)?;
    let source: Arc<dyn TileSource> = Arc::new(HttpSource::new(&request.name, template, client));

    let cache = request
        .cache
        .as_ref()
        .map(|root| DirectoryTileCache::open(root).map(Arc::new))
        .transpose()?;
    let load_method = if cache.is_some() {
        LoadMethod::Default
    } else {
        LoadMethod::Source
    };
    let map = MapSpec::new(&request.name, source, request.ranges).with_load_method(load_method);
    let atlas = AtlasSpec::new(
        &request.name,
        vec![LayerSpec::new(&request.name, vec![map])],
    );

    let mut orchestrator = AtlasCreationOrchestrator::new(config)?
        .with_decision_handler(decisions)
        .with_progress_sink(Arc::new(ConsoleProgress::new()));
    if let Some(cache) = &cache {
        orchestrator = orchestrator.with_resolver(TileSourceResolver::with_cache(cache.clone()));
    }

    eprintln!(
        "downloading {} tiles with {} workers...",
        atlas.tile_count(),
        orchestrator.config().workers
    );
    let report = match cache {
        Some(cache) if request.cache_only => orchestrator.run_cache_only(&atlas, cache)?,
        _ => {
            let mut builder = DirectoryBuilder::new(&request.output, &request.ext);
            orchestrator.run(&atlas, &mut builder)?
        }
    };
    eprintln!();
    print_summary(&report, &request.output);
    Ok(())
}

fn copy_command(
    input: PathBuf,
    ranges: Vec<TileRange>,
    output: PathBuf,
    layout: FileLayout,
    ext: String,
) -> anyhow::Result<()> {
    let name = input
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tiles")
        .to_owned();
    let source = Arc::new(FileTileSource::open(&name, &input, layout, &ext)?);
    let atlas = AtlasSpec::new(
        &name,
        vec![LayerSpec::new(&name, vec![MapSpec::new(&name, source, ranges)])],
    );

    let orchestrator = AtlasCreationOrchestrator::new(DownloadConfig::default())?;
    let mut builder = DirectoryBuilder::new(&output, &ext);
    let report = orchestrator.run(&atlas, &mut builder)?;
    print_summary(&report, &output);
    Ok(())
}

fn inspect_command(path: &Path, list: bool) -> anyhow::Result<()> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let size = file.metadata()?.len();
    let reader = TileArchiveReader::scan(BufReader::new(file))?;

    println!("archive: {}", path.display());
    println!("  size: {}", format_bytes(size));
    println!("  finalized: {}", reader.is_finalized());
    println!("  valid bytes: {}", format_bytes(reader.valid_len()));
    println!("  records: {}", reader.entries().len());

    let payload: u64 = reader
        .entries()
        .iter()
        .map(|entry| u64::from(entry.length))
        .sum();
    println!("  payload: {}", format_bytes(payload));

    let mut zooms = std::collections::BTreeMap::<u32, u64>::new();
    for entry in reader.entries() {
        *zooms.entry(entry.coord.zoom).or_default() += 1;
    }
    for (zoom, count) in zooms {
        println!("  zoom {zoom:>2}: {count} tiles");
    }

    if list {
        for entry in reader.entries() {
            println!(
                "{}\toffset={}\tlength={}",
                entry.coord, entry.offset, entry.length
            );
        }
    }
    Ok(())
}

/// Writes assembled maps as `{output}/{z}/{x}/{y}.{ext}`.
struct DirectoryBuilder {
    output: PathBuf,
    ext: String,
    written: u64,
}

impl DirectoryBuilder {
    fn new(output: &Path, ext: &str) -> Self {
        Self {
            output: output.to_path_buf(),
            ext: ext.trim_start_matches('.').to_owned(),
            written: 0,
        }
    }

    fn tile_path(&self, coord: TileCoord) -> PathBuf {
        self.output
            .join(coord.zoom.to_string())
            .join(coord.x.to_string())
            .join(format!("{}.{}", coord.y, self.ext))
    }
}

impl MapBuilder for DirectoryBuilder {
    fn build_map(&mut self, map: &MapSpec, tiles: &dyn TileProvider) -> tessera_core::Result<()> {
        for coord in map.coords() {
            let Some(data) = tiles.tile(coord)? else {
                continue;
            };
            let path = self.tile_path(coord);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &data)?;
            self.written += 1;
        }
        tracing::info!(map = %map.name, written = self.written, "map assembled");
        Ok(())
    }

    fn abort(&mut self) {
        tracing::warn!(output = %self.output.display(), written = self.written, "assembly aborted");
    }
}

/// Asks the user on stdin whenever the pipeline needs a decision.
struct PromptDecisions {
    ignore_errors: bool,
}

impl PromptDecisions {
    fn ask(&self, question: &str, choices: &[(&str, char)]) -> char {
        let menu: Vec<String> = choices
            .iter()
            .map(|(label, key)| format!("[{key}] {label}"))
            .collect();
        let stdin = io::stdin();
        loop {
            eprint!("\n{question}\n  {} > ", menu.join("  "));
            let _ = io::stderr().flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => return choices[choices.len() - 1].1,
                Ok(_) => {}
            }
            if let Some(answer) = line.trim().chars().next().map(|ch| ch.to_ascii_lowercase()) {
                if choices.iter().any(|(_, key)| *key == answer) {
                    return answer;
                }
            }
        }
    }
}

impl DecisionHandler for PromptDecisions {
    fn on_retry_threshold(&self, progress: &MapProgress) -> RetryDecision {
        let question = format!(
            "map \"{}\": {} download errors so far ({} of {} tiles done)",
            progress.map, progress.retryable_errors, progress.tiles_completed, progress.tiles_total
        );
        let choices = [
            ("continue", 'c'),
            ("retry map", 'r'),
            ("skip map", 's'),
            ("abort", 'a'),
        ];
        match self.ask(&question, &choices) {
            'c' => RetryDecision::Continue,
            'r' => RetryDecision::Retry,
            's' => RetryDecision::Skip,
            _ => RetryDecision::Abort,
        }
    }

    fn on_missing_tiles(&self, missing: &MissingTiles) -> MissingTilesDecision {
        let question = format!(
            "map \"{}\": {} of {} tiles are missing",
            missing.map,
            missing.missing(),
            missing.expected
        );
        let choices = [("proceed", 'p'), ("skip map", 's'), ("abort", 'a')];
        match self.ask(&question, &choices) {
            'p' => MissingTilesDecision::Proceed,
            's' => MissingTilesDecision::Skip,
            _ => MissingTilesDecision::Abort,
        }
    }

    fn on_map_error(&self, map: &str, error: &TesseraError) -> MapErrorDecision {
        let question = format!("map \"{map}\" failed: {error}");
        match self.ask(&question, &[("continue with next map", 'c'), ("abort", 'a')]) {
            'c' => MapErrorDecision::Continue,
            _ => MapErrorDecision::Abort,
        }
    }

    fn ignore_download_errors(&self) -> bool {
        self.ignore_errors
    }
}

/// Single-line progress display on stderr.
struct ConsoleProgress {
    started_at: Instant,
    last_render_ms: AtomicU64,
}

impl ConsoleProgress {
    const REFRESH: Duration = Duration::from_millis(250);

    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_render_ms: AtomicU64::new(0),
        }
    }

    fn render(&self, progress: &MapProgress) {
        let now_ms = self.started_at.elapsed().as_millis() as u64;
        let last = self.last_render_ms.load(Ordering::Relaxed);
        let done = progress.tiles_completed >= progress.tiles_total;
        if !done && now_ms.saturating_sub(last) < Self::REFRESH.as_millis() as u64 {
            return;
        }
        self.last_render_ms.store(now_ms, Ordering::Relaxed);

        let secs = progress.elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            progress.tiles_completed as f64 / secs
        } else {
            0.0
        };
        let remaining = progress.tiles_total.saturating_sub(progress.tiles_completed);
        let eta = if rate > 0.0 {
            Duration::from_secs_f64(remaining as f64 / rate)
        } else {
            Duration::ZERO
        };
        let percent = if progress.tiles_total == 0 {
            100.0
        } else {
            progress.tiles_completed as f64 * 100.0 / progress.tiles_total as f64
        };
        eprint!(
            "\r{} {percent:5.1}% | {}/{} tiles | archived {} | errors {} | failed {} | {rate:.1} tiles/s | eta {}   ",
            progress.map,
            progress.tiles_completed,
            progress.tiles_total,
            progress.tiles_archived,
            progress.retryable_errors,
            progress.permanent_failures,
            format_duration(eta),
        );
    }
}

impl ProgressSink for ConsoleProgress {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::TileCompleted { progress, .. } => self.render(progress),
            ProgressEvent::MapStarted {
                map,
                tiles_total,
                pass,
                ..
            } if *pass > 1 => eprintln!("\nrestarting {map} ({tiles_total} tiles, pass {pass})"),
            ProgressEvent::MapAssembling {
                map,
                tiles_archived,
            } => eprintln!("\nassembling {map} from {tiles_archived} tiles..."),
            ProgressEvent::MapFinished { map, outcome } => match outcome {
                MapOutcome::Skipped => eprintln!("\n{map}: skipped"),
                MapOutcome::Failed { error } => eprintln!("\n{map}: failed: {error}"),
                MapOutcome::Completed { .. } => {}
            },
            _ => {}
        }
    }
}

fn print_summary(report: &AtlasReport, output: &Path) {
    println!("download complete");
    println!("  output: {}", output.display());
    println!("  elapsed: {}", format_duration(report.elapsed));
    println!(
        "  maps: {} completed, {} skipped, {} failed",
        report.completed(),
        report.skipped(),
        report.failed()
    );
    let bytes = report
        .telemetry
        .counter_or_zero(tags::METRIC_ARCHIVE_APPEND_BYTES);
    let secs = report.elapsed.as_secs_f64().max(f64::EPSILON);
    println!("  archived: {} ({}/s)", format_bytes(bytes), format_rate(bytes as f64 / secs));
    for map in &report.maps {
        println!(
            "  {}/{}: {}/{} tiles archived, {} absent, {} failed, {} retries, {} pass(es) in {}",
            map.layer,
            map.map,
            map.tiles_archived,
            map.tiles_total,
            map.absent,
            map.permanent_failures,
            map.retryable_errors,
            map.passes,
            format_duration(map.elapsed)
        );
    }
}

fn parse_range(value: &str) -> Result<TileRange, String> {
    let parts: Vec<&str> = value.split(':').collect();
    let [zoom, xs, ys] = parts.as_slice() else {
        return Err(format!("expected ZOOM:MINX-MAXX:MINY-MAXY, got {value}"));
    };
    let zoom = zoom
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("invalid zoom: {zoom}"))?;
    let (min_x, max_x) = parse_span(xs)?;
    let (min_y, max_y) = parse_span(ys)?;
    TileRange::new(zoom, min_x, max_x, min_y, max_y).map_err(|error| error.to_string())
}

fn parse_span(value: &str) -> Result<(u32, u32), String> {
    let parse = |raw: &str| {
        raw.trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid tile index: {raw}"))
    };
    match value.split_once('-') {
        Some((min, max)) => Ok((parse(min)?, parse(max)?)),
        None => {
            let single = parse(value)?;
            Ok((single, single))
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

fn format_rate(bytes_per_second: f64) -> String {
    if !bytes_per_second.is_finite() || bytes_per_second <= 0.0 {
        return "0 B".to_string();
    }
    format_bytes(bytes_per_second as u64)
}

fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let millis = duration.subsec_millis();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else if minutes > 0 {
        format!("{minutes:02}:{seconds:02}")
    } else {
        format!("{seconds}.{millis:03}s")
    }
}
