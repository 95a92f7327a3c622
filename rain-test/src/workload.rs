//! A scripted workload that records what every simulated user executed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rain_core::generator::exponential_delay;
use rain_core::operation::{Operation, OperationTrace};
use rain_core::{Generator, GeneratorContext, GeneratorRegistry, LoadProfile, Track};
use rand::SeedableRng;
use rand::rngs::SmallRng;

/// Operation sequences executed per worker id.
#[derive(Clone, Debug, Default)]
pub struct Recorder {
    sequences: Arc<Mutex<BTreeMap<usize, Vec<String>>>>,
}

impl Recorder {
    fn push(&self, worker: usize, operation: &str) {
        self.sequences
            .lock()
            .entry(worker)
            .or_default()
            .push(operation.to_owned());
    }

    /// A snapshot of all sequences recorded so far.
    pub fn sequences(&self) -> BTreeMap<usize, Vec<String>> {
        self.sequences.lock().clone()
    }

    /// Total number of executed operations.
    pub fn total(&self) -> usize {
        self.sequences.lock().values().map(Vec::len).sum()
    }
}

/// A workload that picks operations from the track's mix matrices and does nothing else.
///
/// Operation `i` of a mix is named after the `i`-th configured name. Every execution is recorded
/// in the workload's [`Recorder`]. Think and cycle times are drawn from negative-exponential
/// distributions around the configured means.
#[derive(Clone, Debug)]
pub struct Workload {
    operations: Arc<[String]>,
    think_time: Duration,
    cycle_time: Duration,
    fail: Option<String>,
    recorder: Recorder,
}

impl Workload {
    /// Creates a workload with the given operation names.
    pub fn new<I, S>(operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operations: operations.into_iter().map(Into::into).collect(),
            think_time: Duration::from_millis(10),
            cycle_time: Duration::from_millis(10),
            fail: None,
            recorder: Recorder::default(),
        }
    }

    /// Mean pause after every synchronous operation.
    pub fn think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }

    /// Mean interval between asynchronous operations.
    pub fn cycle_time(mut self, cycle_time: Duration) -> Self {
        self.cycle_time = cycle_time;
        self
    }

    /// Makes every execution of `operation` fail.
    pub fn failing(mut self, operation: impl Into<String>) -> Self {
        self.fail = Some(operation.into());
        self
    }

    /// The recorder shared by all generators of this workload.
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// A registry that builds this workload's generator under `name`.
    pub fn registry(&self, name: &str) -> GeneratorRegistry {
        let workload = self.clone();
        let mut registry = GeneratorRegistry::new();
        registry.register(name, move |context: &GeneratorContext| {
            let generator = ScriptedGenerator {
                workload: workload.clone(),
                worker: context.id,
                track: Arc::clone(&context.track),
                rng: SmallRng::seed_from_u64(context.seed),
            };
            Ok(Box::new(generator) as Box<dyn Generator>)
        });
        registry
    }

    fn operation_name(&self, index: usize) -> String {
        match self.operations.get(index) {
            Some(name) => name.clone(),
            None => format!("op-{index}"),
        }
    }
}

struct ScriptedGenerator {
    workload: Workload,
    worker: usize,
    track: Arc<Track>,
    rng: SmallRng,
}

impl Generator for ScriptedGenerator {
    fn next_request(
        &mut self,
        last_operation: Option<usize>,
        profile: &LoadProfile,
    ) -> Option<Box<dyn Operation>> {
        let mix = self.track.mix_for(profile)?;
        let index = mix.next_operation(last_operation, &mut self.rng);
        let name = self.workload.operation_name(index);

        Some(Box::new(ScriptedOperation {
            fail: self.workload.fail.as_deref() == Some(name.as_str()),
            name,
            index,
            worker: self.worker,
            recorder: self.workload.recorder.clone(),
        }))
    }

    fn think_time(&mut self) -> Duration {
        exponential_delay(self.workload.think_time, &mut self.rng)
    }

    fn cycle_time(&mut self) -> Duration {
        exponential_delay(self.workload.cycle_time, &mut self.rng)
    }
}

struct ScriptedOperation {
    name: String,
    index: usize,
    worker: usize,
    fail: bool,
    recorder: Recorder,
}

impl Operation for ScriptedOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> usize {
        self.index
    }

    fn execute(&mut self, trace: &mut OperationTrace) -> anyhow::Result<()> {
        self.recorder.push(self.worker, &self.name);
        trace.record(format!("worker {} ran {}", self.worker, self.name));
        if self.fail {
            anyhow::bail!("{} failed", self.name);
        }
        Ok(())
    }
}
