//! Scoring of a staged observation/model pair.
//!
//! The runner treats analysis as a black box behind [`Analysis`]: it hands
//! over two aligned, unit-matched series and the artifacts to fill, and reads
//! back whatever named metrics were written. [`MeanStateAnalysis`] is the
//! built-in scorer.

use anyhow::{anyhow, Result};
use bench_core::{Artifact, Grid, Region, Variable};
use tracing::debug;

/// Writes metric variables for one staged pair into `results`, and
/// observation-only diagnostics into `benchmark` when given.
pub trait Analysis: Send + Sync {
    fn analyze(
        &self,
        obs: &Variable,
        model: &Variable,
        results: &mut Artifact,
        regions: &[Region],
        benchmark: Option<&mut Artifact>,
    ) -> Result<()>;
}

/// Period-mean, bias, RMSE and spatial-distribution scoring.
///
/// Per cell it compares time means and the centered RMS error, normalized by
/// the observed temporal standard deviation; scores are `exp(-relative
/// error)` averaged over the cells of each region. The spatial distribution
/// score is the Taylor score of the period-mean fields and is only written
/// for regions with at least two cells.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeanStateAnalysis;

struct CellStats {
    obs_mean: Option<f64>,
    mod_mean: Option<f64>,
    obs_std: Option<f64>,
    rmse: Option<f64>,
    crmse: Option<f64>,
}

impl Analysis for MeanStateAnalysis {
    fn analyze(
        &self,
        obs: &Variable,
        model: &Variable,
        results: &mut Artifact,
        regions: &[Region],
        benchmark: Option<&mut Artifact>,
    ) -> Result<()> {
        let model = align_cells(obs, model)?;
        let var = obs.name.as_str();
        let unit = obs.unit.as_str();
        let cells: Vec<CellStats> = (0..obs.ncell()).map(|c| cell_stats(obs, &model, c)).collect();

        let obs_timeint: Vec<Option<f64>> = cells.iter().map(|c| c.obs_mean).collect();
        let mod_timeint: Vec<Option<f64>> = cells.iter().map(|c| c.mod_mean).collect();
        let bias: Vec<Option<f64>> = cells
            .iter()
            .map(|c| Some(c.mod_mean? - c.obs_mean?))
            .collect();
        let rmse: Vec<Option<f64>> = cells.iter().map(|c| c.rmse).collect();

        let map = |name: String, data: Vec<Option<f64>>| -> Result<Variable> {
            Ok(Variable::new(name, unit, None, obs.grid.clone(), data)?)
        };
        results.insert(map(format!("timeint_of_{}", var), mod_timeint.clone())?);
        results.insert(map(format!("bias_of_{}", var), bias.clone())?);
        results.insert(map(format!("rmse_of_{}", var), rmse.clone())?);

        let mut benchmark = benchmark;
        if let Some(bench) = benchmark.as_deref_mut() {
            bench.insert(map(format!("timeint_of_{}", var), obs_timeint.clone())?);
        }

        for region in regions {
            let members: Vec<usize> = (0..obs.ncell())
                .filter(|&c| match obs.grid.cell_coords(c) {
                    Some((lat, lon)) => region.contains(lat, lon),
                    None => true,
                })
                .collect();
            if members.is_empty() {
                debug!(region = %region.name, variable = var, "no cells in region");
                continue;
            }
            let tag = region.tag();
            let pick = |values: &[Option<f64>]| mean(members.iter().map(|&c| values[c]));

            if let Some(v) = pick(&mod_timeint) {
                results.insert(Variable::scalar(format!("period_mean{}", tag), unit, v));
            }
            if let Some(v) = pick(&bias) {
                results.insert(Variable::scalar(format!("bias{}", tag), unit, v));
            }
            if let Some(v) = pick(&rmse) {
                results.insert(Variable::scalar(format!("rmse{}", tag), unit, v));
            }
            let bias_score = mean(members.iter().map(|&c| {
                let s = &cells[c];
                relative_score(s.mod_mean? - s.obs_mean?, s.obs_std?, s.obs_mean?)
            }));
            if let Some(v) = bias_score {
                results.insert(Variable::scalar(format!("bias_score{}", tag), "1", v));
            }
            let rmse_score = mean(members.iter().map(|&c| {
                let s = &cells[c];
                relative_score(s.crmse?, s.obs_std?, s.obs_mean?)
            }));
            if let Some(v) = rmse_score {
                results.insert(Variable::scalar(format!("rmse_score{}", tag), "1", v));
            }
            if let Some(v) = taylor_score(&members, &obs_timeint, &bias) {
                results.insert(Variable::scalar(format!("sd_score{}", tag), "1", v));
            }
            if obs.is_temporal() {
                results.insert(regional_series(&model, &members, var, &tag)?);
            }

            if let Some(bench) = benchmark.as_deref_mut() {
                if let Some(v) = pick(&obs_timeint) {
                    bench.insert(Variable::scalar(format!("period_mean{}", tag), unit, v));
                }
                if obs.is_temporal() {
                    bench.insert(regional_series(obs, &members, var, &tag)?);
                }
            }
        }
        Ok(())
    }
}

/// Brings the model onto the observation's cells. A gridless observation is
/// compared with the model's mean over its unmasked cells; otherwise spatial
/// models are sampled by nearest grid point when the grids differ.
fn align_cells(obs: &Variable, model: &Variable) -> Result<Variable> {
    if model.grid == obs.grid {
        return Ok(model.clone());
    }
    if obs.grid == Grid::None {
        return collapse_cells(model);
    }
    if model.ncell() == obs.ncell() && !model.is_spatial() {
        return Ok(model.clone());
    }
    if model.is_spatial() {
        return Ok(model.sample_onto(&obs.grid)?);
    }
    Err(anyhow!(
        "cannot compare {} cells of model {} with {} observed cells",
        model.ncell(),
        model.name,
        obs.ncell()
    ))
}

/// Per time sample mean over every unmasked cell. Cells masked by the land
/// fraction are already `None` and drop out.
fn collapse_cells(var: &Variable) -> Result<Variable> {
    let ncell = var.ncell();
    let data = (0..var.ntime())
        .map(|t| mean((0..ncell).map(|c| var.get(t, c))))
        .collect();
    Ok(Variable::new(
        var.name.clone(),
        var.unit.clone(),
        var.time.clone(),
        Grid::None,
        data,
    )?)
}

fn cell_stats(obs: &Variable, model: &Variable, c: usize) -> CellStats {
    let nt = obs.ntime().min(model.ntime());
    let obs_mean = mean((0..nt).map(|t| obs.get(t, c)));
    let mod_mean = mean((0..nt).map(|t| model.get(t, c)));
    let obs_std = obs_mean.and_then(|m| {
        mean((0..nt).map(|t| obs.get(t, c).map(|o| (o - m).powi(2)))).map(f64::sqrt)
    });
    let paired = |t: usize| Some((obs.get(t, c)?, model.get(t, c)?));
    let rmse = mean((0..nt).map(|t| paired(t).map(|(o, m)| (m - o).powi(2)))).map(f64::sqrt);
    let crmse = match (obs_mean, mod_mean) {
        (Some(om), Some(mm)) => mean((0..nt).map(|t| {
            paired(t).map(|(o, m)| ((m - mm) - (o - om)).powi(2))
        }))
        .map(f64::sqrt),
        _ => None,
    };
    CellStats {
        obs_mean,
        mod_mean,
        obs_std,
        rmse,
        crmse,
    }
}

/// `exp(-|error| / scale)` where the scale is the observed variability, or
/// the observed magnitude when the observation is constant.
fn relative_score(error: f64, obs_std: f64, obs_mean: f64) -> Option<f64> {
    let scale = if obs_std > 0.0 { obs_std } else { obs_mean.abs() };
    if scale > 0.0 {
        Some((-error.abs() / scale).exp())
    } else if error == 0.0 {
        Some(1.0)
    } else {
        Some(0.0)
    }
}

fn taylor_score(members: &[usize], obs: &[Option<f64>], bias: &[Option<f64>]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = members
        .iter()
        .filter_map(|&c| {
            let o = obs[c]?;
            Some((o, o + bias[c]?))
        })
        .collect();
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let (mo, mm) = pairs
        .iter()
        .fold((0.0, 0.0), |acc, (o, m)| (acc.0 + o / n, acc.1 + m / n));
    let so = (pairs.iter().map(|(o, _)| (o - mo).powi(2)).sum::<f64>() / n).sqrt();
    let sm = (pairs.iter().map(|(_, m)| (m - mm).powi(2)).sum::<f64>() / n).sqrt();
    if so == 0.0 || sm == 0.0 {
        return None;
    }
    let r = pairs.iter().map(|(o, m)| (o - mo) * (m - mm)).sum::<f64>() / (n * so * sm);
    let sigma = sm / so;
    Some(2.0 * (1.0 + r) / (sigma + 1.0 / sigma).powi(2))
}

fn regional_series(var: &Variable, members: &[usize], name: &str, tag: &str) -> Result<Variable> {
    let data = (0..var.ntime())
        .map(|t| mean(members.iter().map(|&c| var.get(t, c))))
        .collect();
    Ok(Variable::new(
        format!("spaceint_of_{}{}", name, tag),
        var.unit.clone(),
        var.time.clone(),
        Grid::None,
        data,
    )?)
}

fn mean(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, n) = values
        .flatten()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sites(n: usize) -> Grid {
        Grid::Sites {
            lat: (0..n).map(|i| i as f64 * 10.0).collect(),
            lon: (0..n).map(|i| i as f64 * 10.0).collect(),
        }
    }

    fn series(name: &str, values: &[[f64; 2]]) -> Variable {
        let time = (0..values.len()).map(|t| t as f64 * 30.0).collect();
        let data = values.iter().flat_map(|row| row.iter().map(|v| Some(*v))).collect();
        Variable::new(name, "g m-2 d-1", Some(time), sites(2), data).expect("valid")
    }

    #[test]
    fn identical_series_score_perfectly() {
        let obs = series("gpp", &[[1.0, 4.0], [3.0, 2.0], [2.0, 6.0]]);
        let mut results = Artifact::new("M", [0.0, 0.0, 0.0]);
        let mut bench = Artifact::benchmark();
        MeanStateAnalysis
            .analyze(&obs, &obs, &mut results, &[Region::global()], Some(&mut bench))
            .expect("analyze");
        assert_eq!(results.scalar("bias_over_global"), Some(0.0));
        assert_eq!(results.scalar("bias_score_over_global"), Some(1.0));
        assert_eq!(results.scalar("rmse_score_over_global"), Some(1.0));
        let sd = results.scalar("sd_score_over_global").expect("two sites");
        assert!((sd - 1.0).abs() < 1e-12);
        assert!(results.get("bias_of_gpp").is_some());
        assert!(results.get("spaceint_of_gpp_over_global").is_some());
        assert!(bench.get("timeint_of_gpp").is_some());
        assert_eq!(bench.scalar("period_mean_over_global"), Some(3.0));
    }

    #[test]
    fn biased_model_scores_below_one() {
        let obs = series("gpp", &[[1.0, 4.0], [3.0, 2.0], [2.0, 6.0]]);
        let model = series("gpp", &[[2.0, 5.0], [4.0, 3.0], [3.0, 7.0]]);
        let mut results = Artifact::new("M", [0.0, 0.0, 0.0]);
        MeanStateAnalysis
            .analyze(&obs, &model, &mut results, &[Region::global()], None)
            .expect("analyze");
        assert_eq!(results.scalar("bias_over_global"), Some(1.0));
        let score = results.scalar("bias_score_over_global").expect("score");
        assert!(score > 0.0 && score < 1.0);
        // a uniform offset leaves the centered error at zero
        assert_eq!(results.scalar("rmse_score_over_global"), Some(1.0));
    }

    #[test]
    fn gridless_observation_is_compared_with_the_spatial_mean() {
        let time = vec![15.0, 45.0, 75.0];
        let obs = Variable::new("tas", "K", Some(time.clone()), Grid::None, vec![Some(1.0); 3])
            .expect("obs");
        let grid = Grid::Spatial {
            lat: vec![5.0, 45.0],
            lon: vec![5.0, 45.0],
        };
        // only the cell nearest the origin agrees with the observation
        let cells = [Some(1.0), Some(100.0), Some(100.0), Some(100.0)];
        let data = (0..3).flat_map(|_| cells).collect();
        let model =
            Variable::new("tas", "K", Some(time.clone()), grid.clone(), data).expect("model");
        let mut results = Artifact::new("M", [0.0, 0.0, 0.0]);
        MeanStateAnalysis
            .analyze(&obs, &model, &mut results, &[Region::global()], None)
            .expect("analyze");
        let period_mean = results.scalar("period_mean_over_global").expect("mean");
        assert!((period_mean - 75.25).abs() < 1e-12);
        let bias = results.scalar("bias_over_global").expect("bias");
        assert!((bias - 74.25).abs() < 1e-12);
        let score = results.scalar("bias_score_over_global").expect("score");
        assert!(score < 1e-6);

        // a land-masked cell is left out of the mean
        let masked = [Some(1.0), Some(100.0), Some(100.0), None];
        let data = (0..3).flat_map(|_| masked).collect();
        let model = Variable::new("tas", "K", Some(time), grid, data).expect("model");
        let mut results = Artifact::new("M", [0.0, 0.0, 0.0]);
        MeanStateAnalysis
            .analyze(&obs, &model, &mut results, &[Region::global()], None)
            .expect("analyze");
        assert_eq!(results.scalar("period_mean_over_global"), Some(67.0));
    }

    #[test]
    fn empty_regions_write_nothing() {
        let obs = series("gpp", &[[1.0, 4.0], [3.0, 2.0]]);
        let arctic = Region {
            name: "arctic".to_string(),
            lat: [66.0, 90.0],
            lon: [-180.0, 180.0],
        };
        let mut results = Artifact::new("M", [0.0, 0.0, 0.0]);
        MeanStateAnalysis
            .analyze(&obs, &obs, &mut results, &[arctic], None)
            .expect("analyze");
        assert!(results.variables.keys().all(|k| !k.ends_with("_over_arctic")));
    }
}
