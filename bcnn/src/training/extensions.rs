//! Trainer extensions: learning-rate schedule, object snapshots and reporting.

use std::{collections::BTreeMap, fs, path::PathBuf};

use burn::{
    module::Module, optim::Optimizer, record::CompactRecorder, tensor::backend::AutodiffBackend,
};
use plotters::prelude::*;
use serde::{Deserialize, Serialize};

use super::{
    trainer::{Extension, LogEntry, TrainState},
    trigger::IntervalTrigger,
};
use crate::{
    error::{BcnnError, BcnnResult},
    models::{PatchDiscriminator, Regressor},
};

/// Shifts the learning rate linearly between two iterations.
///
/// The value is `value_range.0` up to `time_range.0`, `value_range.1` from
/// `time_range.1` on, and interpolated in between.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearShift {
    value_range: (f64, f64),
    time_range: (usize, usize),
}

impl LinearShift {
    /// Creates the schedule.
    pub const fn new(value_range: (f64, f64), time_range: (usize, usize)) -> Self {
        Self {
            value_range,
            time_range,
        }
    }

    /// Learning rate after `iteration` updates.
    pub fn value_at(&self, iteration: usize) -> f64 {
        let (v1, v2) = self.value_range;
        let (t1, t2) = self.time_range;
        if iteration <= t1 {
            v1
        } else if iteration >= t2 {
            v2
        } else {
            let rate = (iteration - t1) as f64 / (t2 - t1) as f64;
            v1 + rate * (v2 - v1)
        }
    }
}

impl<B, OG, OD> Extension<B, OG, OD> for LinearShift
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    fn name(&self) -> &str {
        "linear_shift"
    }

    fn initialize(&mut self, state: &mut TrainState<B, OG, OD>) -> BcnnResult<()> {
        state.updater.set_learning_rate(self.value_at(state.iteration));
        Ok(())
    }

    fn run(&mut self, state: &mut TrainState<B, OG, OD>) -> BcnnResult<()> {
        state.updater.set_learning_rate(self.value_at(state.iteration));
        Ok(())
    }
}

/// Which network a `SnapshotObject` saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTarget {
    /// The generator (without the output activation).
    Generator,
    /// The discriminator.
    Discriminator,
}

/// Saves one network as `{prefix}{iteration:08}.mpk`.
#[derive(Debug, Clone)]
pub struct SnapshotObject {
    target: SnapshotTarget,
    prefix: String,
    trigger: IntervalTrigger,
}

impl SnapshotObject {
    /// Snapshots `target` whenever `trigger` fires.
    pub fn new(target: SnapshotTarget, prefix: impl Into<String>, trigger: IntervalTrigger) -> Self {
        Self {
            target,
            prefix: prefix.into(),
            trigger,
        }
    }
}

impl<B, OG, OD> Extension<B, OG, OD> for SnapshotObject
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    fn name(&self) -> &str {
        &self.prefix
    }

    fn trigger(&self) -> IntervalTrigger {
        self.trigger
    }

    fn run(&mut self, state: &mut TrainState<B, OG, OD>) -> BcnnResult<()> {
        let path = state
            .out
            .join(format!("{}{:08}", self.prefix, state.iteration));
        let recorder = CompactRecorder::new();
        match self.target {
            SnapshotTarget::Generator => state
                .updater
                .generator()
                .predictor()
                .clone()
                .save_file(&path, &recorder)?,
            SnapshotTarget::Discriminator => state
                .updater
                .discriminator()
                .clone()
                .save_file(&path, &recorder)?,
        }
        tracing::debug!(path = %path.display(), "network snapshot saved");
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Accumulator {
    sums: BTreeMap<String, (f64, usize)>,
}

/// Averages observations over an interval and appends them to `<out>/log`.
#[derive(Debug, Clone)]
pub struct LogReport {
    keys: Option<Vec<String>>,
    interval: IntervalTrigger,
    file_name: String,
    accumulator: Accumulator,
}

impl LogReport {
    /// Logs `keys` (all observed keys when `None`) every `interval`.
    pub fn new(keys: Option<Vec<String>>, interval: IntervalTrigger) -> Self {
        Self {
            keys,
            interval,
            file_name: "log".to_string(),
            accumulator: Accumulator::default(),
        }
    }
}

impl<B, OG, OD> Extension<B, OG, OD> for LogReport
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    fn name(&self) -> &str {
        "log_report"
    }

    fn run(&mut self, state: &mut TrainState<B, OG, OD>) -> BcnnResult<()> {
        for (key, value) in &state.observation {
            let wanted = self
                .keys
                .as_ref()
                .is_none_or(|keys| keys.iter().any(|k| k == key));
            if wanted {
                let slot = self.accumulator.sums.entry(key.clone()).or_insert((0.0, 0));
                slot.0 += value;
                slot.1 += 1;
            }
        }

        if !self.interval.fires(state.iteration) {
            return Ok(());
        }

        let mut entry = LogEntry::new();
        for (key, (sum, count)) in std::mem::take(&mut self.accumulator.sums) {
            if count > 0 {
                entry.insert(key, sum / count as f64);
            }
        }
        entry.insert("epoch".to_string(), state.epoch as f64);
        entry.insert("iteration".to_string(), state.iteration as f64);
        entry.insert("elapsed_time".to_string(), state.elapsed_time());
        state.log.push(entry);

        fs::write(
            state.out.join(&self.file_name),
            serde_json::to_string_pretty(&state.log)?,
        )?;
        Ok(())
    }

    fn state_dict(&self) -> Option<serde_json::Value> {
        serde_json::to_value(&self.accumulator).ok()
    }

    fn load_state_dict(&mut self, state: serde_json::Value) -> BcnnResult<()> {
        self.accumulator = serde_json::from_value(state)?;
        Ok(())
    }
}

/// Emits one structured log line per new log entry.
#[derive(Debug, Clone)]
pub struct PrintReport {
    keys: Vec<String>,
    printed: usize,
}

impl PrintReport {
    /// Prints `keys` of every new log entry.
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys, printed: 0 }
    }

    fn format(&self, entry: &LogEntry) -> String {
        self.keys
            .iter()
            .map(|key| match entry.get(key) {
                Some(value) if key == "iteration" || key == "epoch" => {
                    format!("{key}={value:.0}")
                }
                Some(value) => format!("{key}={value:.6}"),
                None => format!("{key}=-"),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl<B, OG, OD> Extension<B, OG, OD> for PrintReport
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    fn name(&self) -> &str {
        "print_report"
    }

    fn initialize(&mut self, state: &mut TrainState<B, OG, OD>) -> BcnnResult<()> {
        self.printed = state.log.len();
        Ok(())
    }

    fn run(&mut self, state: &mut TrainState<B, OG, OD>) -> BcnnResult<()> {
        for entry in &state.log[self.printed.min(state.log.len())..] {
            tracing::info!(target: "bcnn::report", "{}", self.format(entry));
        }
        self.printed = state.log.len();
        Ok(())
    }
}

/// Periodic progress line with throughput and estimated time left.
#[derive(Debug, Clone)]
pub struct ProgressBar {
    interval: IntervalTrigger,
    last: Option<(usize, f64)>,
}

impl ProgressBar {
    /// Reports every `update_interval` iterations.
    pub const fn new(update_interval: usize) -> Self {
        Self {
            interval: IntervalTrigger::new(update_interval),
            last: None,
        }
    }
}

impl<B, OG, OD> Extension<B, OG, OD> for ProgressBar
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    fn name(&self) -> &str {
        "progress_bar"
    }

    fn trigger(&self) -> IntervalTrigger {
        self.interval
    }

    fn initialize(&mut self, state: &mut TrainState<B, OG, OD>) -> BcnnResult<()> {
        self.last = Some((state.iteration, state.elapsed_time()));
        Ok(())
    }

    fn run(&mut self, state: &mut TrainState<B, OG, OD>) -> BcnnResult<()> {
        let now = state.elapsed_time();
        let (last_iteration, last_time) = self.last.unwrap_or((0, 0.0));
        let seconds = (now - last_time).max(f64::EPSILON);
        let speed = (state.iteration - last_iteration) as f64 / seconds;
        let remaining = state.max_iteration.saturating_sub(state.iteration) as f64;
        let percent = 100.0 * state.iteration as f64 / state.max_iteration.max(1) as f64;

        tracing::info!(
            iteration = state.iteration,
            max_iteration = state.max_iteration,
            epoch = state.epoch,
            percent = format!("{percent:.2}"),
            iters_per_sec = format!("{speed:.3}"),
            eta_secs = (remaining / speed.max(f64::EPSILON)).round(),
            "progress"
        );
        self.last = Some((state.iteration, now));
        Ok(())
    }
}

/// Line chart of logged keys against the iteration, written as PNG.
#[derive(Debug, Clone)]
pub struct PlotReport {
    keys: Vec<String>,
    file_name: String,
    trigger: IntervalTrigger,
}

const PLOT_SIZE: (u32, u32) = (640, 480);

impl PlotReport {
    /// Plots `keys` into `<out>/<file_name>` whenever `trigger` fires.
    pub fn new(keys: Vec<String>, file_name: impl Into<String>, trigger: IntervalTrigger) -> Self {
        Self {
            keys,
            file_name: file_name.into(),
            trigger,
        }
    }

    /// Keys whose last `/`-separated segment starts with `prefix`.
    pub fn select_keys(keys: &[String], prefix: &str) -> Vec<String> {
        keys.iter()
            .filter(|key| key.rsplit('/').next().unwrap_or(key).starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Draws the series found in `log`. Nothing is written without data.
    ///
    /// # Errors
    ///
    /// Returns `BcnnError::Render` if drawing or encoding fails.
    pub fn draw(&self, log: &[LogEntry], path: PathBuf) -> BcnnResult<()> {
        let series: Vec<Vec<(f64, f64)>> = self
            .keys
            .iter()
            .map(|key| {
                log.iter()
                    .filter_map(|entry| Some((*entry.get("iteration")?, *entry.get(key)?)))
                    .filter(|(_, v)| v.is_finite())
                    .collect()
            })
            .collect();
        let points = series.iter().flatten();
        let (mut x0, mut x1, mut y0, mut y1) =
            (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY);
        for (x, y) in points {
            x0 = x0.min(*x);
            x1 = x1.max(*x);
            y0 = y0.min(*y);
            y1 = y1.max(*y);
        }
        if !x0.is_finite() {
            return Ok(());
        }
        if x1 <= x0 {
            x1 = x0 + 1.0;
        }
        if y1 <= y0 {
            y1 = y0 + 1.0;
        }

        let render = |message: String| BcnnError::Render { message };
        let root = BitMapBackend::new(&path, PLOT_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(|e| render(e.to_string()))?;
        {
            let mut chart = ChartBuilder::on(&root)
                .margin(16)
                .build_cartesian_2d(x0..x1, y0..y1)
                .map_err(|e| render(e.to_string()))?;
            let area = chart.plotting_area().get_pixel_range();
            root.draw(&Rectangle::new(
                [(area.0.start, area.1.start), (area.0.end, area.1.end)],
                BLACK.stroke_width(1),
            ))
            .map_err(|e| render(e.to_string()))?;

            for (index, points) in series.into_iter().enumerate() {
                chart
                    .draw_series(LineSeries::new(points, Palette99::pick(index).stroke_width(2)))
                    .map_err(|e| render(e.to_string()))?;
            }
        }
        root.present().map_err(|e| render(e.to_string()))?;
        Ok(())
    }
}

impl<B, OG, OD> Extension<B, OG, OD> for PlotReport
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    fn name(&self) -> &str {
        &self.file_name
    }

    fn trigger(&self) -> IntervalTrigger {
        self.trigger
    }

    fn run(&mut self, state: &mut TrainState<B, OG, OD>) -> BcnnResult<()> {
        self.draw(&state.log, state.out.join(&self.file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_shift_schedule() {
        let shift = LinearShift::new((4e-4, 0.0), (100, 200));

        assert_eq!(shift.value_at(0), 4e-4);
        assert_eq!(shift.value_at(100), 4e-4);
        assert!((shift.value_at(150) - 2e-4).abs() < 1e-12);
        assert_eq!(shift.value_at(200), 0.0);
        assert_eq!(shift.value_at(500), 0.0);
    }

    #[test]
    fn plot_keys_select_by_last_segment() {
        let keys: Vec<String> = ["loss_gen", "loss_cond", "loss_dis", "validation/main/accuracy"]
            .iter()
            .map(ToString::to_string)
            .collect();

        assert_eq!(PlotReport::select_keys(&keys, "loss").len(), 3);
        assert_eq!(
            PlotReport::select_keys(&keys, "accuracy"),
            vec!["validation/main/accuracy".to_string()]
        );
    }

    #[test]
    fn print_report_formats_missing_keys() {
        let report = PrintReport::new(vec!["iteration".to_string(), "loss_gen".to_string()]);
        let entry = LogEntry::from([("iteration".to_string(), 100.0)]);

        assert_eq!(report.format(&entry), "iteration=100 loss_gen=-");
    }

    #[test]
    fn plot_is_written_when_data_exists() {
        let dir = tempfile::tempdir().unwrap();
        let report = PlotReport::new(
            vec!["loss_gen".to_string()],
            "loss.png",
            IntervalTrigger::new(1),
        );
        let log: Vec<LogEntry> = (1..5)
            .map(|i| {
                LogEntry::from([
                    ("iteration".to_string(), f64::from(i * 100)),
                    ("loss_gen".to_string(), 1.0 / f64::from(i)),
                ])
            })
            .collect();

        report.draw(&[], dir.path().join("empty.png")).unwrap();
        assert!(!dir.path().join("empty.png").exists());

        report.draw(&log, dir.path().join("loss.png")).unwrap();
        assert!(dir.path().join("loss.png").is_file());
    }
}
