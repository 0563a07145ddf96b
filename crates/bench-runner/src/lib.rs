//! Runs every model against every confrontation across a pool of workers.
//!
//! A run is a fixed sequence of phases separated by barriers: local scoring,
//! plot limits, overall scores, per-pair pages, confrontation pages (by each
//! confrontation's elected master) and the summary page (by rank 0). Each
//! file has exactly one writer; the only shared write is the benchmark
//! artifact, which only the master creates.

pub mod config;
pub mod confrontation;
pub mod fabric;
pub mod family;
pub mod model;
pub mod report;
pub mod work;

use anyhow::Result;
use bench_core::{Artifact, ConfrontError, FailureKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

pub use bench_analysis::{Analysis, MeanStateAnalysis};
pub use config::{load_config, BenchmarkConfig, Selection};
pub use confrontation::Confrontation;
pub use fabric::{thread_fabric, FileFabric, SoloContext, ThreadWorker, WorkerContext};
pub use model::{discover_models, ModelResult, ModelSource};
pub use report::{HtmlRenderer, Renderer, SummaryTable};

use work::{
    build_work_list, elect_leaders, partition, verify_work_list, work_list_digest, LeaderTable,
    WorkItem,
};

#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Recompute pairs even when a valid artifact exists.
    pub clean: bool,
    pub build_dir: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairOutcome {
    Cached,
    Completed,
    Skipped(FailureKind),
}

#[derive(Clone, Debug, Serialize)]
pub struct PairRecord {
    pub confrontation: String,
    pub longname: String,
    pub model: String,
    pub outcome: PairOutcome,
    pub elapsed_s: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub rank: usize,
    pub workers: usize,
    pub assigned_start: usize,
    pub assigned_end: usize,
    pub total_items: usize,
    /// Confrontations this worker was elected master of.
    pub masters: Vec<String>,
    pub pairs: Vec<PairRecord>,
    pub elapsed_s: f64,
}

/// Runs this worker's share of the benchmark. Every worker in `ctx` must
/// call this with the same models and confrontations in the same order.
pub fn run_benchmark(
    ctx: &dyn WorkerContext,
    models: &[ModelResult],
    confrontations: &mut [Confrontation],
    analysis: &dyn Analysis,
    renderer: &dyn Renderer,
    options: &RunOptions,
) -> Result<RunSummary> {
    let started = Instant::now();
    let items = build_work_list(models.len(), confrontations.len());
    let model_names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
    let conf_names: Vec<&str> = confrontations.iter().map(|c| c.name.as_str()).collect();
    verify_work_list(ctx, &work_list_digest(&items, &model_names, &conf_names))?;

    let range = partition(items.len(), ctx.size(), ctx.rank())?;
    let local = &items[range.clone()];
    let leaders = elect_leaders(ctx, local, confrontations.len())?;
    info!(
        rank = ctx.rank(),
        workers = ctx.size(),
        start = range.start,
        end = range.end,
        total = items.len(),
        "assigned work"
    );

    let pairs = run_local_pairs(
        ctx.rank(),
        local,
        models,
        confrontations,
        analysis,
        &leaders,
        options.clean,
    )?;
    ctx.barrier()?;

    for conf in confrontations.iter_mut() {
        conf.determine_plot_limits()?;
    }
    ctx.barrier()?;

    let scored: Vec<&WorkItem> = local
        .iter()
        .zip(&pairs)
        .filter(|(_, p)| !matches!(p.outcome, PairOutcome::Skipped(_)))
        .map(|(item, _)| item)
        .collect();
    for item in &scored {
        let conf = &confrontations[item.confrontation];
        let model = &models[item.model];
        let overall = conf.compute_overall_score(&model.name)?;
        debug!(confrontation = %conf.name, model = %model.name, ?overall, "overall score");
    }
    ctx.barrier()?;

    for item in &scored {
        let conf = &confrontations[item.confrontation];
        let model = &models[item.model];
        let slots = conf.figure_slots(&model.name)?;
        renderer.render_pair(conf, model, &slots)?;
    }
    ctx.barrier()?;

    let mut masters = Vec::new();
    for (c, conf) in confrontations.iter().enumerate() {
        if leaders.is_master(c) {
            renderer.render_confrontation(conf, &conf.metric_table()?)?;
            masters.push(conf.name.clone());
        }
    }
    ctx.barrier()?;

    if ctx.rank() == 0 {
        let summary = SummaryTable::collect(confrontations, models);
        renderer.render_summary(&options.build_dir, &summary)?;
    }
    ctx.barrier()?;

    let elapsed_s = started.elapsed().as_secs_f64();
    info!(rank = ctx.rank(), elapsed_s, "benchmark complete");
    Ok(RunSummary {
        rank: ctx.rank(),
        workers: ctx.size(),
        assigned_start: range.start,
        assigned_end: range.end,
        total_items: items.len(),
        masters,
        pairs,
        elapsed_s,
    })
}

/// Confronts this worker's pairs in order. Pairs with a valid artifact are
/// reused unless `clean`, which first deletes the pair's artifact so a pair
/// that now fails leaves nothing behind. Recoverable failures are recorded
/// and skipped.
fn run_local_pairs(
    rank: usize,
    local: &[WorkItem],
    models: &[ModelResult],
    confrontations: &mut [Confrontation],
    analysis: &dyn Analysis,
    leaders: &LeaderTable,
    clean: bool,
) -> Result<Vec<PairRecord>> {
    if clean {
        for (c, conf) in confrontations.iter().enumerate() {
            let path = conf.benchmark_path();
            if leaders.is_master(c) && path.exists() {
                fs::remove_file(&path)?;
            }
        }
    }
    let mut records = Vec::with_capacity(local.len());
    for item in local {
        let model = &models[item.model];
        let master = leaders.is_master(item.confrontation);
        let conf = &mut confrontations[item.confrontation];
        let started = Instant::now();
        let result_path = conf.result_path(&model.name);
        if clean && result_path.exists() {
            fs::remove_file(&result_path)?;
        }
        let cached = !clean
            && Artifact::is_valid(&result_path)
            && (!master || Artifact::is_valid(&conf.benchmark_path()));
        let outcome = if cached {
            PairOutcome::Cached
        } else {
            match conf.confront(model, analysis, master) {
                Ok(()) => PairOutcome::Completed,
                Err(err) => {
                    let kind = err
                        .downcast_ref::<ConfrontError>()
                        .and_then(ConfrontError::failure_kind);
                    match kind {
                        Some(kind) => {
                            warn!(
                                rank,
                                confrontation = %conf.name,
                                model = %model.name,
                                kind = kind.as_str(),
                                error = %err,
                                "skipping pair"
                            );
                            PairOutcome::Skipped(kind)
                        }
                        None => {
                            return Err(err.context(format!(
                                "confronting {} with {}",
                                model.name, conf.name
                            )))
                        }
                    }
                }
            }
        };
        let elapsed_s = started.elapsed().as_secs_f64();
        info!(
            rank,
            confrontation = %conf.longname,
            model = %model.name,
            outcome = ?outcome,
            elapsed_s,
            "pair finished"
        );
        records.push(PairRecord {
            confrontation: conf.name.clone(),
            longname: conf.longname.clone(),
            model: model.name.clone(),
            outcome,
            elapsed_s,
        });
    }
    Ok(records)
}

#[derive(Clone, Debug, Serialize)]
pub struct RescoreRecord {
    pub confrontation: String,
    pub model: String,
    pub scores: BTreeMap<String, f64>,
}

/// Recomputes overall scores from existing artifacts with the current
/// weights, then rank 0 re-renders the summary page. Pairs without a valid
/// artifact are left alone.
pub fn rescore(
    ctx: &dyn WorkerContext,
    models: &[ModelResult],
    confrontations: &[Confrontation],
    renderer: &dyn Renderer,
    options: &RunOptions,
) -> Result<Vec<RescoreRecord>> {
    let items = build_work_list(models.len(), confrontations.len());
    let model_names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
    let conf_names: Vec<&str> = confrontations.iter().map(|c| c.name.as_str()).collect();
    verify_work_list(ctx, &work_list_digest(&items, &model_names, &conf_names))?;
    let range = partition(items.len(), ctx.size(), ctx.rank())?;

    let mut records = Vec::new();
    for item in &items[range] {
        let conf = &confrontations[item.confrontation];
        let model = &models[item.model];
        if !Artifact::is_valid(&conf.result_path(&model.name)) {
            debug!(confrontation = %conf.name, model = %model.name, "no artifact to rescore");
            continue;
        }
        let scores = conf.compute_overall_score(&model.name)?;
        records.push(RescoreRecord {
            confrontation: conf.name.clone(),
            model: model.name.clone(),
            scores,
        });
    }
    ctx.barrier()?;
    if ctx.rank() == 0 {
        let summary = SummaryTable::collect(confrontations, models);
        renderer.render_summary(&options.build_dir, &summary)?;
    }
    ctx.barrier()?;
    Ok(records)
}
