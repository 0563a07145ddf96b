use bench_core::{FailureKind, Grid, Variable, VariableFile};
use bench_runner::{
    discover_models, load_config, run_benchmark, thread_fabric, HtmlRenderer, MeanStateAnalysis,
    PairOutcome, RunOptions, RunSummary, Selection,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use walkdir::WalkDir;

const CONFIG: &str = r#"
models_dir: MODELS
confrontations:
  - name: GPP
    source: DATA/gpp.json
    variable: gpp
  - name: LE
    source: DATA/le.json
    variable: le
    alternate_vars: [hfls]
"#;

fn temp_root(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "bench_pipeline_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&dir).expect("temp root");
    dir
}

fn monthly(n: usize) -> Vec<f64> {
    (0..n).map(|k| 15.0 + 30.0 * k as f64).collect()
}

fn write_vars(path: &Path, variables: Vec<Variable>) {
    VariableFile { variables }.write(path).expect("write variables");
}

fn site_obs(name: &str, unit: &str, scale: f64) -> Variable {
    let times = monthly(12);
    let data = (0..times.len() * 2)
        .map(|i| Some(scale * (2.0 + (i % 4) as f64)))
        .collect();
    Variable::new(
        name,
        unit,
        Some(times),
        Grid::Sites {
            lat: vec![10.0, 20.0],
            lon: vec![10.0, 20.0],
        },
        data,
    )
    .expect("obs")
}

fn gridded(name: &str, unit: &str, scale: f64, phase: usize) -> Variable {
    let times = monthly(24);
    let data = (0..times.len() * 4)
        .map(|i| Some(scale * (1.5 + ((i + phase) % 5) as f64)))
        .collect();
    Variable::new(
        name,
        unit,
        Some(times),
        Grid::Spatial {
            lat: vec![10.0, 20.0],
            lon: vec![10.0, 20.0],
        },
        data,
    )
    .expect("model")
}

/// Monthly model output that loses step halfway through: the second half
/// sits 20 days late.
fn drifting(name: &str, unit: &str, scale: f64) -> Variable {
    let times: Vec<f64> = monthly(12)
        .into_iter()
        .enumerate()
        .map(|(k, t)| if k < 6 { t } else { t + 20.0 })
        .collect();
    let data = (0..times.len() * 4)
        .map(|i| Some(scale * (1.0 + (i % 3) as f64)))
        .collect();
    Variable::new(
        name,
        unit,
        Some(times),
        Grid::Spatial {
            lat: vec![10.0, 20.0],
            lon: vec![10.0, 20.0],
        },
        data,
    )
    .expect("drifting")
}

/// Two site confrontations and three models; `beta` has no latent heat.
fn setup(tag: &str) -> PathBuf {
    let root = temp_root(tag);
    fs::create_dir_all(root.join("DATA")).expect("data");
    write_vars(&root.join("DATA/gpp.json"), vec![site_obs("gpp", "g m-2 d-1", 1.0)]);
    write_vars(&root.join("DATA/le.json"), vec![site_obs("le", "W m-2", 20.0)]);
    for (i, model) in ["alpha", "beta", "gamma"].into_iter().enumerate() {
        let dir = root.join("MODELS").join(model);
        fs::create_dir_all(&dir).expect("model dir");
        let mut vars = vec![gridded("gpp", "kg m-2 s-1", 2.5e-8, i)];
        if model != "beta" {
            vars.push(gridded("hfls", "W m-2", 18.0, i + 1));
        }
        write_vars(&dir.join("output.json"), vars);
    }
    fs::write(root.join("benchmark.yaml"), CONFIG).expect("config");
    root
}

fn run_workers(root: &Path, workers: usize, clean: bool) -> Vec<RunSummary> {
    let config = load_config(&root.join("benchmark.yaml")).expect("config");
    let options = RunOptions {
        clean,
        build_dir: config.build_dir(root),
    };
    let fabric = thread_fabric(workers).expect("fabric");
    let mut summaries: Vec<RunSummary> = thread::scope(|s| {
        let handles: Vec<_> = fabric
            .into_iter()
            .map(|ctx| {
                let config = &config;
                let options = &options;
                s.spawn(move || {
                    let models = discover_models(&config.models_dir(root), None).expect("models");
                    let mut confs = config
                        .build_confrontations(root, &Selection::default())
                        .expect("confrontations");
                    run_benchmark(
                        &ctx,
                        &models,
                        &mut confs,
                        &MeanStateAnalysis,
                        &HtmlRenderer,
                        options,
                    )
                    .expect("run")
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("worker")).collect()
    });
    summaries.sort_by_key(|s| s.rank);
    summaries
}

fn outcomes(summaries: &[RunSummary]) -> BTreeMap<(String, String), PairOutcome> {
    summaries
        .iter()
        .flat_map(|s| s.pairs.iter())
        .map(|p| ((p.confrontation.clone(), p.model.clone()), p.outcome))
        .collect()
}

fn artifact_bytes(build_dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(build_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("json"))
        .map(|e| (e.path().to_path_buf(), fs::read(e.path()).expect("read artifact")))
        .collect()
}

fn key(conf: &str, model: &str) -> (String, String) {
    (conf.to_string(), model.to_string())
}

/// Score cells of `conf`'s row on the summary page, in model order.
fn summary_scores(root: &Path, conf: &str) -> Vec<String> {
    let index = fs::read_to_string(root.join("_build/index.html")).expect("index");
    let link = format!("<a href=\"{}/{}.html\">", conf, conf);
    let row = index.lines().find(|l| l.contains(&link)).expect("summary row");
    row.trim_end_matches("</tr>")
        .split("<td>")
        .skip(3)
        .map(|cell| cell.trim_end_matches("</td>").to_string())
        .collect()
}

#[test]
fn failed_pair_is_isolated_and_rerun_is_cached() {
    let root = setup("isolation");
    let build = root.join("_build");
    let first = run_workers(&root, 2, false);

    let got = outcomes(&first);
    assert_eq!(got.len(), 6);
    for model in ["alpha", "beta", "gamma"] {
        assert_eq!(got[&key("GPP", model)], PairOutcome::Completed);
    }
    assert_eq!(got[&key("LE", "alpha")], PairOutcome::Completed);
    assert_eq!(
        got[&key("LE", "beta")],
        PairOutcome::Skipped(FailureKind::VarNotInModel)
    );
    assert_eq!(got[&key("LE", "gamma")], PairOutcome::Completed);

    assert!(build.join("LE/LE_alpha.json").is_file());
    assert!(!build.join("LE/LE_beta.json").exists());
    assert!(build.join("LE/LE_gamma.json").is_file());
    assert!(build.join("GPP/GPP_Benchmark.json").is_file());
    assert!(build.join("LE/LE_Benchmark.json").is_file());
    assert!(build.join("GPP/GPP.html").is_file());
    assert!(build.join("LE/LE.html").is_file());
    assert!(build.join("LE/LE_alpha.html").is_file());
    assert!(!build.join("LE/LE_beta.html").exists());
    assert!(build.join("index.html").is_file());

    // 6 items over 2 workers: rank 0 owns all of GPP, rank 1 all of LE
    assert_eq!(first[0].masters, vec!["GPP".to_string()]);
    assert_eq!(first[1].masters, vec!["LE".to_string()]);

    let before = artifact_bytes(&build);
    assert_eq!(before.len(), 7);
    let second = run_workers(&root, 2, false);
    for (pair, outcome) in outcomes(&second) {
        if pair == key("LE", "beta") {
            assert_eq!(outcome, PairOutcome::Skipped(FailureKind::VarNotInModel));
        } else {
            assert_eq!(outcome, PairOutcome::Cached, "{:?}", pair);
        }
    }
    assert_eq!(artifact_bytes(&build), before);
    let _ = fs::remove_dir_all(root);
}

#[test]
fn uneven_partition_covers_every_pair_once() {
    let root = setup("uneven");
    let summaries = run_workers(&root, 3, false);
    let ranges: Vec<_> = summaries
        .iter()
        .map(|s| (s.assigned_start, s.assigned_end))
        .collect();
    assert_eq!(ranges, vec![(0, 2), (2, 4), (4, 6)]);
    let total: usize = summaries.iter().map(|s| s.pairs.len()).sum();
    assert_eq!(total, 6);
    assert_eq!(outcomes(&summaries).len(), 6);
    // GPP: rank 0 owns two pairs; LE: rank 2 owns two
    assert_eq!(summaries[0].masters, vec!["GPP".to_string()]);
    assert!(summaries[1].masters.is_empty());
    assert_eq!(summaries[2].masters, vec!["LE".to_string()]);

    let index = fs::read_to_string(root.join("_build/index.html")).expect("index");
    assert!(index.contains("<th>alpha</th><th>beta</th><th>gamma</th>"));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn clean_run_drops_results_of_pairs_that_now_fail() {
    let root = setup("clean_stale");
    let build = root.join("_build");
    let first = run_workers(&root, 1, false);
    assert_eq!(outcomes(&first)[&key("GPP", "beta")], PairOutcome::Completed);
    assert!(build.join("GPP/GPP_beta.json").is_file());
    assert_eq!(summary_scores(&root, "GPP").len(), 3);
    assert!(summary_scores(&root, "GPP").iter().all(|c| c != "-"));

    write_vars(&root.join("MODELS/beta/output.json"), Vec::new());
    let second = run_workers(&root, 1, true);
    assert_eq!(
        outcomes(&second)[&key("GPP", "beta")],
        PairOutcome::Skipped(FailureKind::VarNotInModel)
    );
    assert!(!build.join("GPP/GPP_beta.json").exists());
    let cells = summary_scores(&root, "GPP");
    assert_eq!(cells[1], "-");
    assert_ne!(cells[0], "-");
    assert_ne!(cells[2], "-");
    let _ = fs::remove_dir_all(root);
}

#[test]
fn time_axis_mismatch_skips_only_that_pair() {
    let root = setup("time_mismatch");
    let build = root.join("_build");
    write_vars(
        &root.join("MODELS/gamma/output.json"),
        vec![
            drifting("gpp", "kg m-2 s-1", 2.5e-8),
            gridded("hfls", "W m-2", 18.0, 3),
        ],
    );
    let summaries = run_workers(&root, 2, false);
    let got = outcomes(&summaries);
    assert_eq!(
        got[&key("GPP", "gamma")],
        PairOutcome::Skipped(FailureKind::TimeMismatch)
    );
    assert_eq!(got[&key("GPP", "alpha")], PairOutcome::Completed);
    assert_eq!(got[&key("GPP", "beta")], PairOutcome::Completed);
    assert_eq!(got[&key("LE", "gamma")], PairOutcome::Completed);
    assert!(!build.join("GPP/GPP_gamma.json").exists());
    assert!(build.join("GPP/GPP_Benchmark.json").is_file());
    assert_eq!(summary_scores(&root, "GPP")[2], "-");
    let _ = fs::remove_dir_all(root);
}
