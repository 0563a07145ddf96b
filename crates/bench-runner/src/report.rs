use anyhow::{Context, Result};
use bench_core::{atomic_write_bytes, Artifact};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::confrontation::{Confrontation, FigureSlot, MetricTable};
use crate::model::ModelResult;

/// Overall scores of every model on every confrontation, in run order, one
/// row per confrontation and region.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SummaryTable {
    pub models: Vec<String>,
    pub rows: Vec<SummaryRow>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SummaryRow {
    pub confrontation: String,
    pub longname: String,
    pub region: String,
    pub output_path: PathBuf,
    /// Missing when the pair was skipped or never scored.
    pub scores: BTreeMap<String, Option<f64>>,
}

impl SummaryTable {
    /// Reads `overall_score_over_<region>` for every region of every
    /// confrontation from the result artifacts.
    pub fn collect(confrontations: &[Confrontation], models: &[ModelResult]) -> Self {
        let mut table = SummaryTable {
            models: models.iter().map(|m| m.name.clone()).collect(),
            rows: Vec::new(),
        };
        for conf in confrontations {
            let artifacts: Vec<Option<Artifact>> = models
                .iter()
                .map(|m| Artifact::load(&conf.result_path(&m.name)).ok())
                .collect();
            for region in &conf.regions {
                let key = format!("overall_score{}", region.tag());
                let scores = models
                    .iter()
                    .zip(&artifacts)
                    .map(|(m, a)| (m.name.clone(), a.as_ref().and_then(|a| a.scalar(&key))))
                    .collect();
                table.rows.push(SummaryRow {
                    confrontation: conf.name.clone(),
                    longname: conf.longname.clone(),
                    region: region.name.clone(),
                    output_path: conf.output_path.clone(),
                    scores,
                });
            }
        }
        table
    }
}

/// Turns computed results into report files.
pub trait Renderer: Send + Sync {
    fn render_pair(
        &self,
        conf: &Confrontation,
        model: &ModelResult,
        slots: &[FigureSlot],
    ) -> Result<()>;
    fn render_confrontation(&self, conf: &Confrontation, table: &MetricTable) -> Result<()>;
    fn render_summary(&self, build_dir: &Path, summary: &SummaryTable) -> Result<()>;
}

/// Plain HTML tables, no figures.
#[derive(Clone, Copy, Debug, Default)]
pub struct HtmlRenderer;

impl HtmlRenderer {
    pub fn pair_page(conf: &Confrontation, model: &str) -> PathBuf {
        conf.output_path.join(format!("{}_{}.html", conf.name, model))
    }

    pub fn confrontation_page(conf: &Confrontation) -> PathBuf {
        confrontation_page_in(&conf.output_path, &conf.name)
    }

    pub fn summary_page(build_dir: &Path) -> PathBuf {
        build_dir.join("index.html")
    }
}

fn confrontation_page_in(output_path: &Path, name: &str) -> PathBuf {
    output_path.join(format!("{}.html", name))
}

/// `page` as a `/`-separated link from `build_dir`, or as given when it lies
/// outside.
fn link_from(build_dir: &Path, page: &Path) -> String {
    let rel = page.strip_prefix(build_dir).unwrap_or(page);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        concat!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n",
            "<title>{}</title>\n</head>\n<body>\n<h1>{}</h1>\n{}</body>\n</html>\n"
        ),
        escape(title),
        escape(title),
        body
    )
}

fn write_page(path: &Path, html: &str) -> Result<()> {
    atomic_write_bytes(path, html.as_bytes())
        .with_context(|| format!("writing report page {}", path.display()))
}

fn fmt_value(v: f64) -> String {
    format!("{:.4}", v)
}

impl Renderer for HtmlRenderer {
    fn render_pair(
        &self,
        conf: &Confrontation,
        model: &ModelResult,
        slots: &[FigureSlot],
    ) -> Result<()> {
        let mut body = String::new();
        let mut section = "";
        for slot in slots {
            if slot.section != section {
                if !section.is_empty() {
                    body.push_str("</table>\n");
                }
                section = slot.section;
                body.push_str(&format!("<h2>{}</h2>\n<table>\n", escape(section)));
                body.push_str(concat!(
                    "<tr><th>Figure</th><th>Variable</th><th>Region</th>",
                    "<th>Range</th><th>Colormap</th></tr>\n"
                ));
            }
            let limits = conf.limits().and_then(|l| l.get(&slot.family));
            let (range, colormap) = match limits {
                Some(l) => (
                    format!("{} .. {} {}", fmt_value(l.min), fmt_value(l.max), l.label),
                    l.colormap.clone(),
                ),
                None => (String::new(), String::new()),
            };
            body.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                escape(&slot.file_name),
                escape(&slot.variable),
                escape(&slot.region),
                escape(&range),
                escape(&colormap)
            ));
        }
        if !section.is_empty() {
            body.push_str("</table>\n");
        }
        let title = format!("{} / {}", conf.longname, model.name);
        write_page(&Self::pair_page(conf, &model.name), &page(&title, &body))
    }

    fn render_confrontation(&self, conf: &Confrontation, table: &MetricTable) -> Result<()> {
        let mut body = String::new();
        let regions: BTreeSet<&String> = table.values().flat_map(|r| r.keys()).collect();
        for region in regions {
            let columns: BTreeSet<&String> = table
                .values()
                .filter_map(|r| r.get(region))
                .flat_map(|m| m.keys())
                .collect();
            body.push_str(&format!(
                "<h2>{}</h2>\n<table>\n<tr><th>Model</th>",
                escape(region)
            ));
            for column in &columns {
                body.push_str(&format!("<th>{}</th>", escape(column)));
            }
            body.push_str("</tr>\n");
            for (model, per_region) in table {
                let Some(metrics) = per_region.get(region) else {
                    continue;
                };
                body.push_str(&format!("<tr><td>{}</td>", escape(model)));
                for column in &columns {
                    let cell = metrics.get(*column).map(|v| fmt_value(*v)).unwrap_or_default();
                    body.push_str(&format!("<td>{}</td>", cell));
                }
                body.push_str("</tr>\n");
            }
            body.push_str("</table>\n");
        }
        write_page(&Self::confrontation_page(conf), &page(&conf.longname, &body))
    }

    fn render_summary(&self, build_dir: &Path, summary: &SummaryTable) -> Result<()> {
        let mut body = String::from("<table>\n<tr><th>Confrontation</th><th>Region</th>");
        for model in &summary.models {
            body.push_str(&format!("<th>{}</th>", escape(model)));
        }
        body.push_str("</tr>\n");
        for row in &summary.rows {
            let page = confrontation_page_in(&row.output_path, &row.confrontation);
            body.push_str(&format!(
                "<tr><td><a href=\"{}\">{}</a></td><td>{}</td>",
                escape(&link_from(build_dir, &page)),
                escape(&row.longname),
                escape(&row.region)
            ));
            for model in &summary.models {
                let cell = row
                    .scores
                    .get(model)
                    .copied()
                    .flatten()
                    .map(fmt_value)
                    .unwrap_or_else(|| "-".to_string());
                body.push_str(&format!("<td>{}</td>", cell));
            }
            body.push_str("</tr>\n");
        }
        body.push_str("</table>\n");
        write_page(&Self::summary_page(build_dir), &page("Overall Scores", &body))
    }
}
