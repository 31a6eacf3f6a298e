//! Test doubles for the external collaborators.

use crate::recorder::common::PipelineError;
use crate::recorder::frame::Frame;
use crate::recorder::sink::{Fourcc, SinkFactory, VideoSink};
use crate::recorder::videosource::{FrameSource, SourceConnector};
use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Sink factory that touches the chunk file on disk and counts frames per
/// opened chunk, in open order.
#[derive(Default)]
pub struct MemorySinks {
    pub opened: Mutex<Vec<PathBuf>>,
    pub written: Arc<Mutex<Vec<usize>>>,
    pub closed: Arc<AtomicUsize>,
    pub fail: AtomicBool,
}

impl MemorySinks {
    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened.lock().unwrap().clone()
    }

    pub fn written(&self) -> Vec<usize> {
        self.written.lock().unwrap().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl SinkFactory for MemorySinks {
    fn open(
        &self,
        path: &Path,
        _codec: Fourcc,
        _fps: u32,
        _size: (u32, u32),
    ) -> Result<Box<dyn VideoSink>, PipelineError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PipelineError::Encoding("scripted open failure".to_string()));
        }
        File::create(path)?;
        self.opened.lock().unwrap().push(path.to_path_buf());
        let mut written = self.written.lock().unwrap();
        written.push(0);
        Ok(Box::new(MemorySink {
            index: written.len() - 1,
            written: self.written.clone(),
            closed: self.closed.clone(),
        }))
    }
}

pub struct MemorySink {
    index: usize,
    written: Arc<Mutex<Vec<usize>>>,
    closed: Arc<AtomicUsize>,
}

impl VideoSink for MemorySink {
    fn write(&mut self, _frame: &Frame) -> Result<(), PipelineError> {
        self.written.lock().unwrap()[self.index] += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What a scripted source does on its next grab.
#[derive(Clone, Copy, Debug)]
pub enum Grab {
    Frame,
    Nothing,
}

/// Connector whose sources play back a shared script of grab outcomes.
/// An exhausted script yields nothing.
#[derive(Default)]
pub struct ScriptedConnector {
    pub script: Arc<Mutex<VecDeque<Grab>>>,
    pub opens: AtomicUsize,
    pub refuse: AtomicBool,
    pub size: (u32, u32),
}

impl ScriptedConnector {
    pub fn new(size: (u32, u32)) -> ScriptedConnector {
        ScriptedConnector {
            size,
            ..ScriptedConnector::default()
        }
    }

    pub fn push(&self, grabs: &[Grab]) {
        self.script.lock().unwrap().extend(grabs.iter().copied());
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl SourceConnector for ScriptedConnector {
    fn open(&self, _uri: &str) -> Result<Box<dyn FrameSource>, PipelineError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(PipelineError::Source("scripted refusal".to_string()));
        }
        Ok(Box::new(ScriptedSource {
            script: self.script.clone(),
            size: self.size,
        }))
    }
}

pub struct ScriptedSource {
    script: Arc<Mutex<VecDeque<Grab>>>,
    size: (u32, u32),
}

impl FrameSource for ScriptedSource {
    fn is_open(&self) -> bool {
        true
    }

    fn try_grab(&mut self) -> Option<Frame> {
        match self.script.lock().unwrap().pop_front() {
            Some(Grab::Frame) => Some(Frame::filled(self.size.0, self.size.1, [40, 80, 120])),
            Some(Grab::Nothing) | None => None,
        }
    }
}
