//! One benchmark dataset and everything computed against it.

use anyhow::{anyhow, Context, Result};
use bench_analysis::Analysis;
use bench_core::variable::nearest_index;
use bench_core::{
    Artifact, ConfrontError, Region, Variable, VariableFile, ARTIFACT_EXT, BENCHMARK_NAME,
    LAND_FRACTION_THRESHOLD, TIME_TOLERANCE_DAYS,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{default_weights, Weights};
use crate::family::{metric_display_name, AxisLabel, Colormap, FamilyKind, MetricFamily};
use crate::model::{ExtractRequest, ModelResult};

/// Lower bound on the weight sum of an overall score.
const MIN_WEIGHT_SUM: f64 = 1e-12;

/// Shared drawing range of one metric family across all models.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FamilyLimits {
    pub min: f64,
    pub max: f64,
    pub unit: String,
    pub colormap: String,
    pub label: String,
    pub has_legend: bool,
}

pub type PlotLimits = BTreeMap<MetricFamily, FamilyLimits>;

/// `model → region → metric display name → value`
pub type MetricTable = BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>;

/// A figure the report for one model should show.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FigureSlot {
    pub section: &'static str,
    pub family: MetricFamily,
    pub variable: String,
    pub region: String,
    pub file_name: String,
    pub legend: bool,
}

#[derive(Debug)]
pub struct Confrontation {
    pub name: String,
    pub longname: String,
    pub source: PathBuf,
    pub variable: String,
    pub alternate_vars: Vec<String>,
    pub output_path: PathBuf,
    pub regions: Vec<Region>,
    pub weights: Weights,
    pub colormap: String,
    pub land: bool,
    data: Option<Variable>,
    limits: Option<PlotLimits>,
}

impl Confrontation {
    /// Fails with `MisplacedData` when `source` does not exist.
    pub fn new(
        name: &str,
        source: &Path,
        variable: &str,
        output_path: &Path,
    ) -> std::result::Result<Self, ConfrontError> {
        if !source.exists() {
            return Err(ConfrontError::MisplacedData {
                confrontation: name.to_string(),
                path: source.to_path_buf(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            longname: name.to_string(),
            source: source.to_path_buf(),
            variable: variable.to_string(),
            alternate_vars: Vec::new(),
            output_path: output_path.to_path_buf(),
            regions: vec![Region::global()],
            weights: default_weights(),
            colormap: "jet".to_string(),
            land: false,
            data: None,
            limits: None,
        })
    }

    pub fn with_longname(mut self, longname: String) -> Self {
        self.longname = longname;
        self
    }

    pub fn with_alternate_vars(mut self, alternate_vars: Vec<String>) -> Self {
        self.alternate_vars = alternate_vars;
        self
    }

    pub fn with_regions(mut self, regions: Vec<Region>) -> Self {
        self.regions = regions;
        self
    }

    pub fn with_weights(mut self, weights: Weights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_colormap(mut self, colormap: &str) -> Self {
        self.colormap = colormap.to_string();
        self
    }

    pub fn with_land(mut self, land: bool) -> Self {
        self.land = land;
        self
    }

    pub fn result_path(&self, model: &str) -> PathBuf {
        Artifact::path_for(&self.output_path, &self.name, model)
    }

    pub fn benchmark_path(&self) -> PathBuf {
        Artifact::path_for(&self.output_path, &self.name, BENCHMARK_NAME)
    }

    pub fn limits(&self) -> Option<&PlotLimits> {
        self.limits.as_ref()
    }

    /// The observations, read from disk on first use.
    pub fn observations(&mut self) -> std::result::Result<&Variable, ConfrontError> {
        if self.data.is_none() {
            let file = VariableFile::load(&self.source)?;
            let obs = file
                .find(&self.variable, &self.alternate_vars)
                .cloned()
                .ok_or_else(|| ConfrontError::InvalidVariable {
                    name: self.variable.clone(),
                    reason: format!("not present in {}", self.source.display()),
                })?;
            debug!(
                confrontation = %self.name,
                source = %self.source.display(),
                "loaded observations"
            );
            self.data = Some(obs);
        }
        self.data.as_ref().ok_or_else(|| ConfrontError::InvalidVariable {
            name: self.variable.clone(),
            reason: "observations unavailable".to_string(),
        })
    }

    /// Produces time-aligned, unit-matched observation and model series.
    pub fn stage(
        &mut self,
        model: &ModelResult,
    ) -> std::result::Result<(Variable, Variable), ConfrontError> {
        let variable = self.variable.clone();
        let alternates = self.alternate_vars.clone();
        let land = self.land;
        let obs = self.observations()?.clone();
        let (Some(t0), Some(tf)) = (obs.first_time(), obs.last_time()) else {
            return Err(ConfrontError::TimeMismatch(format!(
                "observation {} has no time axis",
                obs.name
            )));
        };
        let sites = obs.ndata().map(|_| &obs.grid);
        let request = ExtractRequest {
            variable: &variable,
            alternates: &alternates,
            sites,
            initial_time: t0,
            final_time: tf,
        };
        let model_var = model.extract_time_series(&request)?;
        let (obs, mut model_var) = align(obs, model_var)?;
        if land
            && model_var.is_spatial()
            && !model_var.mask_low_land_fraction(LAND_FRACTION_THRESHOLD)
        {
            return Err(ConfrontError::AreasNotInModel {
                model: model.name.clone(),
                variable: variable.clone(),
            });
        }
        model_var.convert(&obs.unit)?;
        Ok((obs, model_var))
    }

    /// Stages and scores one model, writing its result artifact and, when
    /// `master` and none exists yet, the benchmark artifact.
    pub fn confront(
        &mut self,
        model: &ModelResult,
        analysis: &dyn Analysis,
        master: bool,
    ) -> Result<()> {
        let (obs, model_var) = self.stage(model)?;
        let mut results = Artifact::new(&model.name, model.color);
        let benchmark_path = self.benchmark_path();
        let mut benchmark = if master && !Artifact::is_valid(&benchmark_path) {
            Some(Artifact::benchmark())
        } else {
            None
        };
        analysis.analyze(&obs, &model_var, &mut results, &self.regions, benchmark.as_mut())?;
        results.write(&self.result_path(&model.name))?;
        if let Some(mut benchmark) = benchmark {
            benchmark.write(&benchmark_path)?;
        }
        Ok(())
    }

    /// Every readable artifact of this confrontation, benchmark included,
    /// sorted by file name.
    fn artifacts(&self) -> Result<Vec<(PathBuf, Artifact)>> {
        if !self.output_path.is_dir() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_", self.name);
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.output_path)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let is_artifact = entry.file_type().is_file()
                && file_name.starts_with(&prefix)
                && entry.path().extension().and_then(|s| s.to_str()) == Some(ARTIFACT_EXT);
            if !is_artifact {
                continue;
            }
            match Artifact::load(entry.path()) {
                Ok(artifact) => out.push((entry.into_path(), artifact)),
                Err(e) => {
                    warn!(confrontation = %self.name, error = %e, "skipping unreadable artifact")
                }
            }
        }
        Ok(out)
    }

    /// Reduces the min/max of every map family over all models' artifacts.
    pub fn determine_plot_limits(&mut self) -> Result<&PlotLimits> {
        let mut limits = PlotLimits::new();
        for (_, artifact) in self.artifacts()? {
            for (name, stored) in &artifact.variables {
                if stored.variable.size() <= 1 {
                    continue;
                }
                let Some(family) = MetricFamily::of_variable(name) else {
                    continue;
                };
                let descriptor = family.descriptor();
                if descriptor.kind != FamilyKind::Map {
                    continue;
                }
                let (Some(lo), Some(hi)) = (stored.min, stored.max) else {
                    continue;
                };
                let entry = limits.entry(family).or_insert_with(|| FamilyLimits {
                    min: lo,
                    max: hi,
                    unit: stored.unit().to_string(),
                    colormap: String::new(),
                    label: String::new(),
                    has_legend: descriptor.has_legend,
                });
                entry.min = entry.min.min(lo);
                entry.max = entry.max.max(hi);
            }
        }
        for (family, entry) in limits.iter_mut() {
            let descriptor = family.descriptor();
            if descriptor.symmetric {
                let vabs = entry.min.abs().max(entry.max.abs());
                entry.min = -vabs;
                entry.max = vabs;
            }
            entry.colormap = match descriptor.colormap {
                Colormap::Fixed(name) => name.to_string(),
                Colormap::Choose => self.colormap.clone(),
            };
            entry.label = match descriptor.label {
                AxisLabel::Unit => entry.unit.clone(),
                AxisLabel::Fixed(label) => label.to_string(),
            };
        }
        Ok(&*self.limits.insert(limits))
    }

    /// Recomputes `overall_score_over_<region>` for one model from the
    /// scores already in its artifact and the current weights, rewriting the
    /// artifact atomically. Returns the score per region.
    pub fn compute_overall_score(&self, model: &str) -> Result<BTreeMap<String, f64>> {
        let path = self.result_path(model);
        let mut artifact = Artifact::load(&path)
            .with_context(|| format!("loading results of {} for {}", model, self.name))?;
        let mut overall = BTreeMap::new();
        for region in &self.regions {
            let tag = region.tag();
            let mut weighted = 0.0;
            let mut sum_of_weights = 0.0;
            for name in artifact.variables.keys() {
                if !name.contains("score") || name.contains("overall") {
                    continue;
                }
                let Some(kind) = name.strip_suffix(&tag) else {
                    continue;
                };
                let Some(value) = artifact.scalar(name) else {
                    continue;
                };
                let Some(weight) = self.weights.get(kind) else {
                    warn!(
                        confrontation = %self.name,
                        kind,
                        "no weight for score kind, leaving it out"
                    );
                    continue;
                };
                weighted += weight * value;
                sum_of_weights += weight;
            }
            let score = weighted / sum_of_weights.max(MIN_WEIGHT_SUM);
            overall.insert(region.name.clone(), score);
        }
        for (region, score) in &overall {
            let name = format!("overall_score_over_{}", region);
            artifact.insert(Variable::scalar(name, "1", *score));
        }
        artifact.write(&path)?;
        Ok(overall)
    }

    /// Figures to draw for one model, from its artifact and the reduced
    /// limits. Call after [`Confrontation::determine_plot_limits`].
    pub fn figure_slots(&self, model: &str) -> Result<Vec<FigureSlot>> {
        let limits = self
            .limits
            .as_ref()
            .ok_or_else(|| anyhow!("plot limits for {} have not been determined", self.name))?;
        let artifact = Artifact::load(&self.result_path(model))?;
        let mut slots = Vec::new();
        for (name, stored) in &artifact.variables {
            let Some(family) = MetricFamily::of_variable(name) else {
                continue;
            };
            let descriptor = family.descriptor();
            let var = &stored.variable;
            let has_cells = var.is_spatial() || var.ndata().is_some();
            let mut push = |region: &str| {
                slots.push(FigureSlot {
                    section: descriptor.section,
                    family,
                    variable: name.clone(),
                    region: region.to_string(),
                    file_name: format!("{}_{}_{}.png", model, region, descriptor.id),
                    legend: descriptor.has_legend,
                });
            };
            match descriptor.kind {
                FamilyKind::Map
                    if has_cells && !var.is_temporal() && limits.contains_key(&family) =>
                {
                    for region in &self.regions {
                        push(&region.name);
                    }
                }
                FamilyKind::Series if !has_cells && var.is_temporal() => {
                    if let Some(region) = self.regions.iter().find(|r| name.ends_with(&r.tag())) {
                        push(&region.name);
                    }
                }
                _ => {}
            }
        }
        Ok(slots)
    }

    /// Scalar metrics of every model (and the benchmark) by region, keyed by
    /// display name.
    pub fn metric_table(&self) -> Result<MetricTable> {
        let mut table = MetricTable::new();
        for (_, artifact) in self.artifacts()? {
            let per_model = table.entry(artifact.name.clone()).or_default();
            for (name, stored) in &artifact.variables {
                if stored.variable.size() > 1 {
                    continue;
                }
                let Some(value) = artifact.scalar(name) else {
                    continue;
                };
                for region in &self.regions {
                    let Some(kind) = name.strip_suffix(&region.tag()) else {
                        continue;
                    };
                    if let Some(display) = metric_display_name(kind) {
                        per_model
                            .entry(region.name.clone())
                            .or_default()
                            .insert(display.to_string(), value);
                    }
                }
            }
        }
        Ok(table)
    }
}

/// Trims both series to their common time window and checks that they pair
/// up sample by sample and site by site.
pub fn align(
    mut obs: Variable,
    mut model: Variable,
) -> std::result::Result<(Variable, Variable), ConfrontError> {
    let bounds = |v: &Variable| match (v.first_time(), v.last_time()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(ConfrontError::TimeMismatch(format!("{} has no time samples", v.name))),
    };
    let (obs_first, obs_last) = bounds(&obs)?;
    let (mod_first, mod_last) = bounds(&model)?;
    let t0 = obs_first.max(mod_first);
    let tf = obs_last.min(mod_last);
    if t0 > tf {
        return Err(ConfrontError::TimeMismatch(format!(
            "no overlap between observation [{}, {}] and model [{}, {}]",
            obs_first, obs_last, mod_first, mod_last
        )));
    }
    for var in [&mut obs, &mut model] {
        let time = var.time.as_deref().unwrap_or_default();
        let begin = nearest_index(time, t0);
        let end = nearest_index(time, tf) + 1;
        var.trim_time(begin, end)?;
    }
    let obs_time = obs.time.as_deref().unwrap_or_default();
    let mod_time = model.time.as_deref().unwrap_or_default();
    if obs_time.len() != mod_time.len() {
        return Err(ConfrontError::TimeMismatch(format!(
            "observation has {} samples in the overlap, model has {}",
            obs_time.len(),
            mod_time.len()
        )));
    }
    if let Some((a, b)) = obs_time
        .iter()
        .zip(mod_time)
        .find(|(a, b)| (*a - *b).abs() > TIME_TOLERANCE_DAYS)
    {
        return Err(ConfrontError::TimeMismatch(format!(
            "paired samples at {} and {} are more than {} days apart",
            a, b, TIME_TOLERANCE_DAYS
        )));
    }
    if obs.ndata() != model.ndata() {
        return Err(ConfrontError::SiteMismatch {
            obs: obs.ndata().unwrap_or(0),
            model: model.ndata().unwrap_or(0),
        });
    }
    Ok((obs, model))
}
