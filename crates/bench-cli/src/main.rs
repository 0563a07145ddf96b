use anyhow::{anyhow, Result};
use bench_runner::work::{build_work_list, partition};
use bench_runner::{
    discover_models, load_config, rescore, run_benchmark, thread_fabric, BenchmarkConfig,
    Confrontation, FileFabric, HtmlRenderer, MeanStateAnalysis, PairOutcome, RunOptions,
    RunSummary, Selection, SoloContext, WorkerContext,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "bench",
    version = "0.3.0",
    about = "Model benchmarking against observational datasets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct Target {
    #[arg(long, default_value = "benchmark.yaml")]
    config: PathBuf,
    /// Directory relative paths resolve against (default: $BENCH_ROOT, then
    /// the config's directory).
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(long, value_delimiter = ',')]
    models: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    confrontations: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    regions: Vec<String>,
}

#[derive(Args, Clone, Debug)]
struct Pool {
    /// Total number of workers in the run.
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// This process's rank; workers then coordinate through --fabric-dir
    /// instead of running as threads of one process.
    #[arg(long, requires = "fabric_dir")]
    rank: Option<usize>,
    #[arg(long)]
    fabric_dir: Option<PathBuf>,
    #[arg(long)]
    barrier_timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        pool: Pool,
        /// Recompute pairs that already have results.
        #[arg(long)]
        clean: bool,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 1)]
        workers: usize,
        #[arg(long)]
        json: bool,
    },
    /// Recompute overall scores from existing results.
    Scores {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        pool: Pool,
        #[arg(long)]
        json: bool,
    },
    /// Remove results and report pages of the selected confrontations.
    Clean {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// A parsed config with its root and the requested selection.
struct Loaded {
    config: BenchmarkConfig,
    root: PathBuf,
    selection: Selection,
}

impl Loaded {
    fn new(target: &Target) -> Result<Self> {
        let config = load_config(&target.config)?;
        let root = resolve_root(target.root.as_deref(), &target.config);
        let selection = Selection {
            models: target.models.clone(),
            confrontations: target.confrontations.clone(),
            regions: target.regions.clone(),
        };
        Ok(Self {
            config,
            root,
            selection,
        })
    }

    fn build_dir(&self) -> PathBuf {
        self.config.build_dir(&self.root)
    }

    fn models(&self) -> Result<Vec<bench_runner::ModelResult>> {
        discover_models(
            &self.config.models_dir(&self.root),
            self.selection.models.as_deref(),
        )
    }

    fn confrontations(&self) -> Result<Vec<Confrontation>> {
        self.config.build_confrontations(&self.root, &self.selection)
    }
}

fn resolve_root(flag: Option<&Path>, config: &Path) -> PathBuf {
    if let Some(root) = flag {
        return root.to_path_buf();
    }
    if let Some(root) = std::env::var_os("BENCH_ROOT").filter(|v| !v.is_empty()) {
        return PathBuf::from(root);
    }
    match config.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Runs `job` once per worker of this process: on a file fabric when a rank
/// is given, on threads when several workers share the process.
fn with_pool<T: Send>(
    pool: &Pool,
    job: impl Fn(&dyn WorkerContext) -> Result<T> + Sync,
) -> Result<Vec<T>> {
    if let Some(rank) = pool.rank {
        let dir = pool
            .fabric_dir
            .as_deref()
            .ok_or_else(|| anyhow!("--rank requires --fabric-dir"))?;
        let ctx = FileFabric::new(dir, rank, pool.workers)?
            .with_timeout(pool.barrier_timeout_secs.map(Duration::from_secs));
        return Ok(vec![job(&ctx)?]);
    }
    if pool.workers <= 1 {
        return Ok(vec![job(&SoloContext)?]);
    }
    let workers = thread_fabric(pool.workers)?;
    thread::scope(|s| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|ctx| {
                let job = &job;
                s.spawn(move || job(&ctx))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| -> Result<T> { h.join().map_err(|_| anyhow!("worker thread panicked"))? })
            .collect()
    })
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            target,
            pool,
            clean,
            json,
        } => {
            let started = Instant::now();
            let loaded = Loaded::new(&target)?;
            let options = RunOptions {
                clean,
                build_dir: loaded.build_dir(),
            };
            let summaries = with_pool(&pool, |ctx| {
                let models = loaded.models()?;
                let mut confrontations = loaded.confrontations()?;
                run_benchmark(
                    ctx,
                    &models,
                    &mut confrontations,
                    &MeanStateAnalysis,
                    &HtmlRenderer,
                    &options,
                )
            })?;
            let elapsed_s = started.elapsed().as_secs_f64();
            info!(elapsed_s, "run finished");
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "build_dir": options.build_dir.display().to_string(),
                    "workers": summaries,
                    "elapsed_s": elapsed_s
                })));
            }
            for summary in &summaries {
                print_run_summary(summary);
            }
            println!("completed in {:.2} s", elapsed_s);
        }
        Commands::Describe {
            target,
            workers,
            json,
        } => {
            let loaded = Loaded::new(&target)?;
            let models = loaded.models()?;
            let confrontations = loaded.confrontations()?;
            let payload = describe_to_json(&loaded, &models, &confrontations, workers)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": payload
                })));
            }
            print_description(&loaded, &models, &confrontations, workers)?;
        }
        Commands::Scores { target, pool, json } => {
            let loaded = Loaded::new(&target)?;
            let options = RunOptions {
                clean: false,
                build_dir: loaded.build_dir(),
            };
            let records = with_pool(&pool, |ctx| {
                let models = loaded.models()?;
                let confrontations = loaded.confrontations()?;
                rescore(ctx, &models, &confrontations, &HtmlRenderer, &options)
            })?;
            let records: Vec<_> = records.into_iter().flatten().collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "scores",
                    "scores": records
                })));
            }
            for record in &records {
                let scores: Vec<String> = record
                    .scores
                    .iter()
                    .map(|(region, score)| format!("{}={:.4}", region, score))
                    .collect();
                println!("{} / {}: {}", record.confrontation, record.model, scores.join(" "));
            }
        }
        Commands::Clean { target, json } => {
            let loaded = Loaded::new(&target)?;
            let mut removed = Vec::new();
            for conf in loaded.confrontations()? {
                removed.extend(remove_outputs(&conf)?);
            }
            let index = HtmlRenderer::summary_page(&loaded.build_dir());
            if index.is_file() {
                fs::remove_file(&index)?;
                removed.push(index);
            }
            if json {
                let removed: Vec<String> =
                    removed.iter().map(|p| p.display().to_string()).collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "clean",
                    "removed": removed
                })));
            }
            for path in &removed {
                println!("removed: {}", path.display());
            }
        }
    }
    Ok(None)
}

/// Deletes the artifacts and pages a run writes for `conf`.
fn remove_outputs(conf: &Confrontation) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !conf.output_path.is_dir() {
        return Ok(removed);
    }
    let prefix = format!("{}_", conf.name);
    let page = format!("{}.html", conf.name);
    for entry in fs::read_dir(&conf.output_path)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let generated = name == page
            || (name.starts_with(&prefix) && (name.ends_with(".json") || name.ends_with(".html")));
        if generated && path.is_file() {
            fs::remove_file(&path)?;
            removed.push(path);
        }
    }
    Ok(removed)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            concat!(
                "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",",
                "\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
            )
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Scores { json, .. }
        | Commands::Clean { json, .. } => *json,
    }
}

fn outcome_label(outcome: &PairOutcome) -> String {
    match outcome {
        PairOutcome::Cached => "cached".to_string(),
        PairOutcome::Completed => "completed".to_string(),
        PairOutcome::Skipped(kind) => format!("skipped ({})", kind.as_str()),
    }
}

fn print_run_summary(summary: &RunSummary) {
    println!(
        "rank {}/{}: items [{}, {}) of {}",
        summary.rank,
        summary.workers,
        summary.assigned_start,
        summary.assigned_end,
        summary.total_items
    );
    if !summary.masters.is_empty() {
        println!("  master of: {}", summary.masters.join(", "));
    }
    for pair in &summary.pairs {
        println!(
            "  {} / {}: {} in {:.2} s",
            pair.longname,
            pair.model,
            outcome_label(&pair.outcome),
            pair.elapsed_s
        );
    }
}

fn describe_to_json(
    loaded: &Loaded,
    models: &[bench_runner::ModelResult],
    confrontations: &[Confrontation],
    workers: usize,
) -> Result<Value> {
    let items = build_work_list(models.len(), confrontations.len());
    let slices = (0..workers.max(1))
        .map(|rank| {
            let range = partition(items.len(), workers.max(1), rank)?;
            Ok(json!({ "rank": rank, "start": range.start, "end": range.end }))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(json!({
        "root": loaded.root.display().to_string(),
        "build_dir": loaded.build_dir().display().to_string(),
        "models": models
            .iter()
            .map(|m| json!({ "name": m.name, "color": m.color }))
            .collect::<Vec<_>>(),
        "confrontations": confrontations.iter().map(|c| json!({
            "name": c.name,
            "longname": c.longname,
            "source": c.source.display().to_string(),
            "variable": c.variable,
            "alternate_vars": c.alternate_vars,
            "output_path": c.output_path.display().to_string(),
            "regions": c.regions.iter().map(|r| r.name.clone()).collect::<Vec<_>>(),
            "weights": c.weights,
            "land": c.land,
        })).collect::<Vec<_>>(),
        "work_items": items.len(),
        "slices": slices
    }))
}

fn print_description(
    loaded: &Loaded,
    models: &[bench_runner::ModelResult],
    confrontations: &[Confrontation],
    workers: usize,
) -> Result<()> {
    println!("root: {}", loaded.root.display());
    println!("build_dir: {}", loaded.build_dir().display());
    println!("models: {}", models.len());
    for model in models {
        println!("  {}", model.name);
    }
    println!("confrontations: {}", confrontations.len());
    for conf in confrontations {
        println!(
            "  {} ({}) variable={} source={}",
            conf.longname,
            conf.name,
            conf.variable,
            conf.source.display()
        );
    }
    let items = build_work_list(models.len(), confrontations.len());
    println!("work_items: {}", items.len());
    let workers = workers.max(1);
    for rank in 0..workers {
        let range = partition(items.len(), workers, rank)?;
        println!("  rank {}: [{}, {})", rank, range.start, range.end);
    }
    Ok(())
}
