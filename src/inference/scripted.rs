//! Scripted backend for tests and benchmarks.
//!
//! Replays a fixed sequence of steps for every completion and records each
//! primitive call in a shared [`CallLog`], so orchestration code can be
//! checked without a model file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::inference::backend::{
    BackendError, GenerationParams, ModelBackend, ModelLoader, Role, Step,
};

/// A primitive call observed by the scripted backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Load(PathBuf),
    AddMessage(Role, String),
    StartCompletion(String),
    Step,
    Stop,
    Cancel,
    Close,
}

/// Shared, append-only record of backend calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<BackendCall>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: BackendCall) {
        if let Ok(mut calls) = self.0.lock() {
            calls.push(call);
        }
    }

    /// Snapshot of every call so far.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.0.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages added to the backend, in call order.
    pub fn messages(&self) -> Vec<(Role, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::AddMessage(role, text) => Some((role, text)),
                _ => None,
            })
            .collect()
    }

    /// Position of the first call matching `call`.
    pub fn position(&self, call: &BackendCall) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn count(&self, call: &BackendCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }
}

/// One scripted outcome of the step primitive.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Piece(String),
    /// Block the calling thread, then yield the piece.
    Delayed(Duration, String),
    Fail(BackendError),
    End,
}

impl ScriptedStep {
    /// Script `pieces` followed by the end marker.
    pub fn pieces(pieces: &[&str]) -> Vec<ScriptedStep> {
        pieces
            .iter()
            .map(|p| ScriptedStep::Piece(p.to_string()))
            .chain(std::iter::once(ScriptedStep::End))
            .collect()
    }
}

/// Loader producing [`ScriptedBackend`] instances.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLoader {
    log: CallLog,
    script: Vec<ScriptedStep>,
    load_error: Option<BackendError>,
    load_delay: Option<Duration>,
    fail_cleanup: bool,
    loads: Arc<Mutex<Vec<GenerationParams>>>,
}

impl ScriptedLoader {
    pub fn new(script: Vec<ScriptedStep>) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    /// Fail every load with `error`.
    pub fn failing(error: BackendError) -> Self {
        Self {
            load_error: Some(error),
            ..Default::default()
        }
    }

    /// Make `stop_completion` and `cancel_completion` fail.
    pub fn with_failing_cleanup(mut self) -> Self {
        self.fail_cleanup = true;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Parameters passed to each load, in call order.
    pub fn loaded_params(&self) -> Vec<GenerationParams> {
        self.loads.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl ModelLoader for ScriptedLoader {
    fn load(
        &self,
        path: &Path,
        params: &GenerationParams,
    ) -> Result<Box<dyn ModelBackend>, BackendError> {
        self.log.record(BackendCall::Load(path.to_path_buf()));
        if let Ok(mut loads) = self.loads.lock() {
            loads.push(*params);
        }
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        if let Some(err) = &self.load_error {
            return Err(err.clone());
        }
        Ok(Box::new(ScriptedBackend {
            log: self.log.clone(),
            script: self.script.clone(),
            cursor: 0,
            fail_cleanup: self.fail_cleanup,
        }))
    }
}

/// Backend that replays its script for every completion.
pub struct ScriptedBackend {
    log: CallLog,
    script: Vec<ScriptedStep>,
    cursor: usize,
    fail_cleanup: bool,
}

impl ScriptedBackend {
    fn cleanup_result(&self, what: &str) -> Result<(), BackendError> {
        if self.fail_cleanup {
            Err(BackendError::DecodeFailed(format!("scripted {what} failure")))
        } else {
            Ok(())
        }
    }
}

impl ModelBackend for ScriptedBackend {
    fn add_message(&mut self, role: Role, text: &str) -> Result<(), BackendError> {
        self.log.record(BackendCall::AddMessage(role, text.to_string()));
        Ok(())
    }

    fn start_completion(&mut self, prompt: &str) -> Result<(), BackendError> {
        self.log.record(BackendCall::StartCompletion(prompt.to_string()));
        self.cursor = 0;
        Ok(())
    }

    fn step(&mut self) -> Result<Step, BackendError> {
        self.log.record(BackendCall::Step);
        let next = self.script.get(self.cursor).cloned();
        self.cursor += 1;
        match next {
            Some(ScriptedStep::Piece(piece)) => Ok(Step::Piece(piece)),
            Some(ScriptedStep::Delayed(delay, piece)) => {
                std::thread::sleep(delay);
                Ok(Step::Piece(piece))
            }
            Some(ScriptedStep::Fail(err)) => Err(err),
            Some(ScriptedStep::End) | None => Ok(Step::EndOfGeneration),
        }
    }

    fn stop_completion(&mut self) -> Result<(), BackendError> {
        self.log.record(BackendCall::Stop);
        self.cleanup_result("stop")
    }

    fn cancel_completion(&mut self) -> Result<(), BackendError> {
        self.log.record(BackendCall::Cancel);
        self.cleanup_result("cancel")
    }
}

impl Drop for ScriptedBackend {
    fn drop(&mut self) {
        self.log.record(BackendCall::Close);
    }
}
