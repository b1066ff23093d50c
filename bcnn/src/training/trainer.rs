//! Iteration-based training loop with extensions and resumable snapshots.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use burn::{
    data::dataloader::DataLoader,
    module::Module,
    optim::Optimizer,
    record::{CompactRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use super::trigger::{EarlyStoppingTrigger, IntervalTrigger};
use crate::{
    data::PairBatch,
    error::{BcnnError, BcnnResult},
    models::{PatchDiscriminator, Regressor},
    updater::{GanUpdater, Observation},
};

/// One row of the training log: `iteration`, `epoch`, `elapsed_time` and the
/// averaged observations.
pub type LogEntry = BTreeMap<String, f64>;

const STATE_FILE: &str = "trainer_state.json";

/// Mutable state shared between the loop and the extensions.
pub struct TrainState<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    /// Updater owning the networks and optimizers.
    pub updater: GanUpdater<B, OG, OD>,
    /// Completed updates.
    pub iteration: usize,
    /// Completed passes over the training set.
    pub epoch: usize,
    /// Values reported during the current iteration.
    pub observation: Observation,
    /// Entries written by the log report.
    pub log: Vec<LogEntry>,
    /// Output directory.
    pub out: PathBuf,
    /// Iteration at which training stops at the latest.
    pub max_iteration: usize,
    started: Instant,
    elapsed_before: f64,
}

impl<B, OG, OD> TrainState<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    /// Seconds spent training, including time before a resume.
    pub fn elapsed_time(&self) -> f64 {
        self.elapsed_before + self.started.elapsed().as_secs_f64()
    }
}

/// A hook run after updates whose trigger fires.
pub trait Extension<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    /// Unique name, used as key of the saved extension state.
    fn name(&self) -> &str;

    /// When the extension runs.
    fn trigger(&self) -> IntervalTrigger {
        IntervalTrigger::every_iteration()
    }

    /// Called once before the first update (also after a resume).
    fn initialize(&mut self, _state: &mut TrainState<B, OG, OD>) -> BcnnResult<()> {
        Ok(())
    }

    /// Runs the extension.
    fn run(&mut self, state: &mut TrainState<B, OG, OD>) -> BcnnResult<()>;

    /// State to persist in snapshots.
    fn state_dict(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restores state saved by `state_dict`.
    fn load_state_dict(&mut self, _state: serde_json::Value) -> BcnnResult<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    iteration: usize,
    epoch: usize,
    elapsed_time: f64,
    learning_rate: f64,
    stop_trigger: EarlyStoppingTrigger,
    log: Vec<LogEntry>,
    extensions: BTreeMap<String, serde_json::Value>,
}

/// Runs updates until the stop trigger fires.
pub struct Trainer<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    state: TrainState<B, OG, OD>,
    train_loader: Arc<dyn DataLoader<B, PairBatch<B>>>,
    stop_trigger: EarlyStoppingTrigger,
    extensions: Vec<Box<dyn Extension<B, OG, OD>>>,
    snapshot_trigger: Option<IntervalTrigger>,
}

impl<B, OG, OD> Trainer<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<Regressor<B>, B>,
    OD: Optimizer<PatchDiscriminator<B>, B>,
{
    /// Creates a trainer writing into `out`.
    pub fn new(
        updater: GanUpdater<B, OG, OD>,
        train_loader: Arc<dyn DataLoader<B, PairBatch<B>>>,
        stop_trigger: EarlyStoppingTrigger,
        out: impl Into<PathBuf>,
    ) -> Self {
        let max_iteration = stop_trigger.max_iteration();
        Self {
            state: TrainState {
                updater,
                iteration: 0,
                epoch: 0,
                observation: Observation::new(),
                log: Vec::new(),
                out: out.into(),
                max_iteration,
                started: Instant::now(),
                elapsed_before: 0.0,
            },
            train_loader,
            stop_trigger,
            extensions: Vec::new(),
            snapshot_trigger: None,
        }
    }

    /// Registers an extension. Extensions run in registration order.
    pub fn extend(&mut self, extension: impl Extension<B, OG, OD> + 'static) -> &mut Self {
        self.extensions.push(Box::new(extension));
        self
    }

    /// Writes `snapshot_iter_{iteration:08}` whenever `trigger` fires, after all
    /// extensions have run.
    pub fn snapshot_on(&mut self, trigger: IntervalTrigger) -> &mut Self {
        self.snapshot_trigger = Some(trigger);
        self
    }

    /// Shared training state.
    pub const fn state(&self) -> &TrainState<B, OG, OD> {
        &self.state
    }

    /// Consumes the trainer and returns the updater.
    pub fn into_updater(self) -> GanUpdater<B, OG, OD> {
        self.state.updater
    }

    /// Runs the training loop.
    ///
    /// # Errors
    ///
    /// Returns an error if an extension or a snapshot fails, or the training
    /// loader yields no batch.
    pub fn run(&mut self) -> BcnnResult<()> {
        fs::create_dir_all(&self.state.out)?;
        self.state.started = Instant::now();
        for extension in &mut self.extensions {
            extension.initialize(&mut self.state)?;
        }

        tracing::info!(
            iteration = self.state.iteration,
            max_iteration = self.state.max_iteration,
            out = %self.state.out.display(),
            "training started"
        );

        if self.stop_trigger.should_stop(self.state.iteration, &self.state.observation) {
            return Ok(());
        }

        let loader = self.train_loader.clone();
        'training: loop {
            let mut progressed = false;
            for batch in loader.iter() {
                progressed = true;
                self.step(batch)?;
                if self
                    .stop_trigger
                    .should_stop(self.state.iteration, &self.state.observation)
                {
                    break 'training;
                }
            }
            if !progressed {
                return Err(BcnnError::Dataset {
                    message: "training loader produced no batches".to_string(),
                });
            }
            self.state.epoch += 1;
        }

        tracing::info!(
            iteration = self.state.iteration,
            epoch = self.state.epoch,
            elapsed_time = self.state.elapsed_time(),
            "training finished"
        );
        Ok(())
    }

    fn step(&mut self, batch: PairBatch<B>) -> BcnnResult<()> {
        self.state.observation = self.state.updater.update(batch);
        self.state.iteration += 1;

        let iteration = self.state.iteration;
        for extension in &mut self.extensions {
            if extension.trigger().fires(iteration) {
                extension.run(&mut self.state)?;
            }
        }
        if self.snapshot_trigger.is_some_and(|trigger| trigger.fires(iteration)) {
            let dir = self.state.out.join(format!("snapshot_iter_{iteration:08}"));
            self.save_snapshot(&dir)?;
        }
        Ok(())
    }

    /// Saves networks, optimizer states and the loop state into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if a record or the state file cannot be written.
    pub fn save_snapshot(&self, dir: &Path) -> BcnnResult<()> {
        fs::create_dir_all(dir)?;
        let recorder = CompactRecorder::new();
        let updater = &self.state.updater;

        updater
            .generator()
            .clone()
            .save_file(dir.join("generator"), &recorder)?;
        updater
            .discriminator()
            .clone()
            .save_file(dir.join("discriminator"), &recorder)?;
        recorder.record(updater.optim_gen().to_record(), dir.join("optim_gen"))?;
        recorder.record(updater.optim_dis().to_record(), dir.join("optim_dis"))?;

        let saved = SavedState {
            iteration: self.state.iteration,
            epoch: self.state.epoch,
            elapsed_time: self.state.elapsed_time(),
            learning_rate: updater.learning_rates().0,
            stop_trigger: self.stop_trigger.clone(),
            log: self.state.log.clone(),
            extensions: self
                .extensions
                .iter()
                .filter_map(|ext| Some((ext.name().to_string(), ext.state_dict()?)))
                .collect(),
        };
        fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(&saved)?)?;

        tracing::info!(snapshot = %dir.display(), "snapshot saved");
        Ok(())
    }

    /// Restores a snapshot written by `save_snapshot`. The iteration limit of
    /// this trainer is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if a record or the state file cannot be read.
    pub fn resume(&mut self, dir: &Path, device: &B::Device) -> BcnnResult<()>
    where
        OG: Clone,
        OD: Clone,
    {
        let recorder = CompactRecorder::new();
        let updater = &mut self.state.updater;

        let generator = updater
            .generator()
            .clone()
            .load_file(dir.join("generator"), &recorder, device)?;
        let discriminator = updater
            .discriminator()
            .clone()
            .load_file(dir.join("discriminator"), &recorder, device)?;
        updater.load_models(generator, discriminator);

        let optim_gen = updater
            .optim_gen()
            .clone()
            .load_record(recorder.load(dir.join("optim_gen"), device)?);
        let optim_dis = updater
            .optim_dis()
            .clone()
            .load_record(recorder.load(dir.join("optim_dis"), device)?);
        updater.load_optimizers(optim_gen, optim_dis);

        let saved: SavedState = serde_json::from_str(&fs::read_to_string(dir.join(STATE_FILE))?)?;
        updater.set_learning_rate(saved.learning_rate);
        self.state.iteration = saved.iteration;
        self.state.epoch = saved.epoch;
        self.state.elapsed_before = saved.elapsed_time;
        self.state.log = saved.log;
        self.stop_trigger.resume_from(saved.stop_trigger);

        let mut states = saved.extensions;
        for extension in &mut self.extensions {
            if let Some(state) = states.remove(extension.name()) {
                extension.load_state_dict(state)?;
            }
        }

        tracing::info!(
            snapshot = %dir.display(),
            iteration = self.state.iteration,
            epoch = self.state.epoch,
            "resumed from snapshot"
        );
        Ok(())
    }
}
