use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::params::{AcquisitionParams, DataType, DownsamplingMode};
use crate::source::{ActualRates, Batch, Result, SampleSource, SourceError, TriggerInfo};

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedCall {
    Configure(AcquisitionParams),
    Start,
    Stop,
    Poll,
    RegisterBuffers(usize, DataType, DownsamplingMode),
    ClearBuffers,
    TriggerInfo,
    ReadRaw(u64, usize),
}

#[derive(Default)]
struct Script {
    polls: VecDeque<Result<Batch>>,
    calls: Vec<ScriptedCall>,
    rejected: Vec<AcquisitionParams>,
    interval_scale: Option<f64>,
    trigger_info: Option<TriggerInfo>,
    fail_trigger_info: bool,
    raw: Option<Vec<i16>>,
    max_memory: Option<u64>,
    running: bool,
}

/// Source that replays a queue of poll results, then keeps returning empty batches.
///
/// Clones share the same script, so a test can keep one clone to feed batches and inspect the
/// recorded calls while the session owns the other.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSource {
    pub fn new() -> ScriptedSource {
        ScriptedSource::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, batch: Batch) -> &Self {
        self.script().polls.push_back(Ok(batch));
        self
    }

    pub fn push_samples(&self, start_offset: u64, samples: Vec<i16>) -> &Self {
        self.push(Batch::with_samples(start_offset, samples))
    }

    pub fn push_error(&self, error: SourceError) -> &Self {
        self.script().polls.push_back(Err(error));
        self
    }

    pub fn pending(&self) -> usize {
        self.script().polls.len()
    }

    /// Makes `configure` fail for exactly these parameters.
    pub fn reject(&self, params: AcquisitionParams) {
        self.script().rejected.push(params);
    }

    /// Read-back interval = requested interval × `scale`.
    pub fn set_interval_scale(&self, scale: f64) {
        self.script().interval_scale = Some(scale);
    }

    pub fn set_trigger_info(&self, info: Option<TriggerInfo>) {
        self.script().trigger_info = info;
    }

    pub fn fail_trigger_info(&self, fail: bool) {
        self.script().fail_trigger_info = fail;
    }

    /// Raw device memory served by `read_raw`, indexed from raw sample 0.
    pub fn set_raw(&self, raw: Vec<i16>) {
        self.script().raw = Some(raw);
    }

    pub fn set_max_memory(&self, max_memory: Option<u64>) {
        self.script().max_memory = max_memory;
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.script().calls.clone()
    }

    pub fn count(&self, call: &ScriptedCall) -> usize {
        self.script().calls.iter().filter(|c| *c == call).count()
    }

    pub fn is_running(&self) -> bool {
        self.script().running
    }
}

impl SampleSource for ScriptedSource {
    fn configure(&mut self, params: &AcquisitionParams) -> Result<ActualRates> {
        let mut script = self.script();
        script.calls.push(ScriptedCall::Configure(params.clone()));

        if script.rejected.contains(params) {
            return Err(SourceError::Rejected("scripted rejection".into()));
        }

        Ok(ActualRates {
            interval: params.sample_interval * script.interval_scale.unwrap_or(1.0),
            unit: params.time_unit,
        })
    }

    fn start(&mut self) -> Result<()> {
        let mut script = self.script();
        script.calls.push(ScriptedCall::Start);
        script.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut script = self.script();
        script.calls.push(ScriptedCall::Stop);
        script.running = false;
        Ok(())
    }

    fn poll(&mut self) -> Result<Batch> {
        let mut script = self.script();
        script.calls.push(ScriptedCall::Poll);
        script.polls.pop_front().unwrap_or_else(|| Ok(Batch::empty()))
    }

    fn register_buffers(
        &mut self,
        samples_per_buffer: usize,
        data_type: DataType,
        mode: DownsamplingMode,
    ) -> Result<()> {
        self.script()
            .calls
            .push(ScriptedCall::RegisterBuffers(samples_per_buffer, data_type, mode));
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.script().calls.push(ScriptedCall::ClearBuffers);
        Ok(())
    }

    fn trigger_info(&mut self) -> Result<Option<TriggerInfo>> {
        let mut script = self.script();
        script.calls.push(ScriptedCall::TriggerInfo);

        if script.fail_trigger_info {
            return Err(SourceError::Unsupported("trigger info"));
        }
        Ok(script.trigger_info)
    }

    fn read_raw(&mut self, start_raw: u64, count: usize) -> Result<Vec<i16>> {
        let mut script = self.script();
        script.calls.push(ScriptedCall::ReadRaw(start_raw, count));

        let raw = match &script.raw {
            Some(raw) => raw,
            None => return Err(SourceError::Unsupported("raw sample read")),
        };
        let start = (start_raw as usize).min(raw.len());
        let end = start.saturating_add(count).min(raw.len());
        Ok(raw[start..end].to_vec())
    }

    fn max_available_memory(&self) -> Option<u64> {
        self.script().max_memory
    }
}
