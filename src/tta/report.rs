use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Serialize, Deserialize};

use crate::data::dataset::DatasetKind;
use crate::ensemble::policy::EnsemblePolicy;
use crate::error::Result;
use crate::math::matrix::Matrix;
use crate::math::stats::{argmax, top_k};
use crate::stats::running_stats::RunningStats;

// ---------------------------------------------------------------------------
// Per-class accuracy chart
// ---------------------------------------------------------------------------

/// Which classes a chart shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassFilter {
    /// Every class with at least one observation.
    All,
    /// Only classes whose accuracy dropped with adaptation.
    Worse,
}

/// Grouped bar chart of per-class accuracy without / with adaptation.
pub fn class_accuracy_svg(stats: &RunningStats, class_names: &[String], filter: ClassFilter) -> String {
    let (no_adapt, adapt) = stats.class_accuracies();
    let classes: Vec<usize> = (0..stats.num_classes())
        .filter(|&c| no_adapt[c] >= 0.0 || adapt[c] >= 0.0)
        .filter(|&c| filter == ClassFilter::All || adapt[c] < no_adapt[c])
        .collect();

    let pad_l = 48.0f64;
    let pad_r = 16.0f64;
    let pad_t = 24.0f64;
    let pad_b = 90.0f64;
    let group_w = 22.0f64;
    let w = pad_l + pad_r + group_w * classes.len().max(1) as f64;
    let h = 320.0f64;
    let plot_h = h - pad_t - pad_b;

    let grey_grid = "#f0f2f5";
    let grey_text = "#999";
    let grey_bar = "#9ca3af";
    let blue_bar = "#1e40af";
    let dark_text = "#333";

    let y_of = |pct: f64| pad_t + (1.0 - pct.max(0.0) / 100.0) * plot_h;

    let grid: String = (0..=4).map(|g| {
        let pct = g as f64 * 25.0;
        let y = y_of(pct);
        format!(
            "<text x=\"{:.1}\" y=\"{:.1}\" text-anchor=\"end\" fill=\"{}\" font-size=\"10\">{:.0}</text>\n\
             <line x1=\"{:.1}\" y1=\"{:.1}\" x2=\"{:.1}\" y2=\"{:.1}\" stroke=\"{}\" stroke-width=\"1\"/>",
            pad_l - 4.0, y + 4.0, grey_text, pct,
            pad_l, y, w - pad_r, y, grey_grid
        )
    }).collect::<Vec<_>>().join("\n");

    let bar_w = group_w * 0.4;
    let bars: String = classes.iter().enumerate().map(|(slot, &c)| {
        let x0 = pad_l + slot as f64 * group_w + group_w * 0.1;
        let bar = |x: f64, pct: f64, fill: &str| {
            let y = y_of(pct);
            format!(
                "<rect x=\"{:.1}\" y=\"{:.1}\" width=\"{:.1}\" height=\"{:.1}\" fill=\"{}\"/>",
                x, y, bar_w, pad_t + plot_h - y, fill
            )
        };
        let label_x = x0 + bar_w;
        let label_y = h - pad_b + 10.0;
        let name = class_names.get(c).map(String::as_str).unwrap_or("?");
        format!(
            "{}\n{}\n<text x=\"{:.1}\" y=\"{:.1}\" transform=\"rotate(60 {:.1} {:.1})\" fill=\"{}\" font-size=\"9\">{}</text>",
            bar(x0, no_adapt[c], grey_bar),
            bar(x0 + bar_w, adapt[c], blue_bar),
            label_x, label_y, label_x, label_y, dark_text, escape(name)
        )
    }).collect::<Vec<_>>().join("\n");

    format!(
        "<svg class=\"class-accuracy-svg\" width=\"{:.0}\" height=\"{:.0}\" xmlns=\"http://www.w3.org/2000/svg\">\n\
         {}\n{}\n\
         <!-- Legend -->\n\
         <rect x=\"{:.1}\" y=\"4\" width=\"10\" height=\"10\" fill=\"{}\"/>\n\
         <text x=\"{:.1}\" y=\"13\" fill=\"{}\" font-size=\"10\">no adaptation</text>\n\
         <rect x=\"{:.1}\" y=\"4\" width=\"10\" height=\"10\" fill=\"{}\"/>\n\
         <text x=\"{:.1}\" y=\"13\" fill=\"{}\" font-size=\"10\">adapted</text>\n\
         </svg>",
        w, h,
        grid, bars,
        pad_l, grey_bar,
        pad_l + 14.0, dark_text,
        pad_l + 100.0, blue_bar,
        pad_l + 114.0, dark_text
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub fn write_chart(path: impl AsRef<Path>, svg: &str) -> Result<()> {
    std::fs::write(path, svg)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Scalar metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub tag: String,
    pub value: f64,
    pub step: usize,
}

/// Appends one JSON object per scalar to `metrics.jsonl`.
pub struct MetricsWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl MetricsWriter {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(MetricsWriter { path, writer: BufWriter::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let line = serde_json::to_string(&Scalar { tag: tag.to_string(), value, step })?;
        writeln!(self.writer, "{}", line)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run summary and debug reports
// ---------------------------------------------------------------------------

/// Contents of `final_result.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub dataset: DatasetKind,
    pub backbone: String,
    pub ensemble_enabled: bool,
    /// Adapted top-1 in percent.
    pub top1: f64,
    pub run_name: String,
    pub ensemble_policy: Option<EnsemblePolicy>,
}

impl RunSummary {
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

/// Top-5 table of the adapted prediction for one sample.
pub fn prediction_report(index: usize, label: usize, probs: &[f64], class_names: &[String]) -> String {
    let name = |c: usize| class_names.get(c).map(String::as_str).unwrap_or("?");
    let mut out = format!("sample {}\nlabel: {} ({})\n", index, label, name(label));
    for (rank, c) in top_k(probs, 5).into_iter().enumerate() {
        let marker = if c == label { " *" } else { "" };
        out.push_str(&format!("{}. {:<30} {:.4}{}\n", rank + 1, name(c), probs[c], marker));
    }
    out
}

/// Top-1 of every kept view followed by the top-5 of their average: what
/// the augmented batch predicted before the prompt moved.
pub fn batch_report(index: usize, label: usize, kept: &[usize], probs: &Matrix, class_names: &[String]) -> String {
    let name = |c: usize| class_names.get(c).map(String::as_str).unwrap_or("?");
    let mut out = format!("sample {} batch\nlabel: {} ({})\n", index, label, name(label));
    for (view, row) in kept.iter().zip(&probs.data) {
        let c = argmax(row);
        let marker = if c == label { " *" } else { "" };
        out.push_str(&format!("view {:>3}: {:<30} {:.4}{}\n", view, name(c), row.get(c).copied().unwrap_or(0.0), marker));
    }
    let avg = probs.mean_rows();
    out.push_str("average:\n");
    for (rank, c) in top_k(&avg, 5).into_iter().enumerate() {
        out.push_str(&format!("{}. {:<30} {:.4}\n", rank + 1, name(c), avg[c]));
    }
    out
}
