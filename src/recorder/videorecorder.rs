//! Output pipeline: per-source frame queue, per-second resampling to the
//! output rate, and chunk file rollover.

use crate::dtos::messages::ChunkInfo;
use crate::recorder::common::PipelineError;
use crate::recorder::frame::{Frame, TimedFrame};
use crate::recorder::imageops::{ImageOps, RasterOps};
use crate::recorder::naming::{time_string, ChunkNamer};
use crate::recorder::sink::{Fourcc, MjpegSinkFactory, SinkFactory, VideoSink};
use crate::utils::config::OutputConfig;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Seconds the update loop will replay one by one after a stall. Longer gaps
/// are jumped in a single flush.
pub const MAX_CATCH_UP_SEC: i64 = 60;

pub trait Recorder: Send + Sync {
    /// Opens the first chunk at `t`. Failing here is fatal for the session.
    fn init(&self, t: i64) -> Result<(), PipelineError>;

    fn push_frame(&self, frame: Frame, t: i64);

    /// Writes exactly `fps` frames for second `t`; returns how many reached a
    /// chunk. No-op for seconds already flushed.
    fn flush(&self, t: i64) -> usize;

    /// Flushes every second since the last flush up to `t`.
    fn update(&self, t: i64);

    /// Closes and finalizes the open chunk.
    fn shutdown(&self);
}

struct Chunk {
    start: i64,
    path: PathBuf,
    nominal_sec: u32,
    sink: Box<dyn VideoSink>,
    written: u32,
}

#[derive(Default)]
struct OutState {
    last_flushed: i64,
    chunk: Option<Chunk>,
    fourcc: Option<Fourcc>,
    open_failures: u32,
    chunks_finalized: u64,
    last_chunk: Option<String>,
}

type ChunkCallback = Box<dyn Fn(&ChunkInfo) + Send + Sync>;

pub struct VideoRecorder {
    name: String,
    config: OutputConfig,
    namer: Arc<ChunkNamer>,
    sinks: Arc<dyn SinkFactory>,
    ops: Arc<dyn ImageOps>,
    queue: Mutex<VecDeque<TimedFrame>>,
    state: Mutex<OutState>,
    on_chunk: Option<ChunkCallback>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stretches or thins `buffer` to exactly `fps` entries. Growing duplicates
/// each entry in place walking front to back; shrinking drops every other
/// entry. Both passes repeat until the length matches.
pub fn resample<T: Clone>(buffer: &mut Vec<T>, fps: usize) {
    if buffer.is_empty() || fps == 0 {
        return;
    }
    while buffer.len() < fps {
        let mut i = 0;
        while i < buffer.len() && buffer.len() < fps {
            let copy = buffer[i].clone();
            buffer.insert(i + 1, copy);
            i += 2;
        }
    }
    while buffer.len() > fps {
        let mut i = 0;
        while i < buffer.len() && buffer.len() > fps {
            buffer.remove(i);
            i += 1;
        }
    }
}

impl Recorder for VideoRecorder {
    fn init(&self, t: i64) -> Result<(), PipelineError> {
        if self.config.fps == 0 {
            return Err(PipelineError::Config(format!("{}: fps must be > 0", self.name)));
        }
        let fourcc: Fourcc = self.config.fourcc.parse()?;
        let mut state = locked(&self.state);
        state.fourcc = Some(fourcc);
        state.last_flushed = t;
        self.begin_chunk(&mut state, t);
        if state.chunk.is_none() {
            return Err(PipelineError::Encoding(format!(
                "{}: unable to open the first chunk",
                self.name
            )));
        }
        Ok(())
    }

    fn push_frame(&self, frame: Frame, t: i64) {
        let (width, height) = (self.config.width, self.config.height);
        let mut frame = if frame.size() != (width, height) {
            match self.ops.resize(frame, width, height) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("{}: frame dropped, resize failed: {e}", self.name);
                    return;
                }
            }
        } else {
            frame
        };
        if self.config.watermark {
            self.watermark(&mut frame, t);
        }
        locked(&self.queue).push_back(TimedFrame { frame, time: t });
    }

    fn flush(&self, t: i64) -> usize {
        let mut state = locked(&self.state);
        if t <= state.last_flushed {
            return 0;
        }

        let mut buffer: Vec<Arc<Frame>> = {
            let mut queue = locked(&self.queue);
            let due = queue.iter().take_while(|f| f.time <= t).count();
            queue.drain(..due).map(|f| Arc::new(f.frame)).collect()
        };

        if buffer.is_empty() {
            let mut blank = Frame::blank(self.config.width, self.config.height);
            if self.config.watermark {
                self.watermark(&mut blank, t);
            }
            buffer.push(Arc::new(blank));
        }

        resample(&mut buffer, self.config.fps as usize);

        if state.chunk.is_none() {
            let start = state.last_flushed;
            self.begin_chunk(&mut state, start);
        }

        let written = match state.chunk.as_mut() {
            Some(chunk) => {
                let mut failed = 0;
                for frame in &buffer {
                    if chunk.sink.write(frame).is_err() {
                        failed += 1;
                    }
                }
                if failed > 0 {
                    warn!("{}: {failed} frame writes failed at {t}", self.name);
                }
                chunk.written += buffer.len() as u32;
                buffer.len()
            }
            None => 0,
        };
        state.last_flushed = t;
        debug!("{}: flushed {written} frames for {t}", self.name);

        let roll = state
            .chunk
            .as_ref()
            .is_some_and(|chunk| self.should_roll(chunk, t));
        if roll {
            self.release_chunk(&mut state);
            self.begin_chunk(&mut state, t);
        }
        written
    }

    fn update(&self, t: i64) {
        let last = self.last_flushed();
        if t - last > MAX_CATCH_UP_SEC {
            warn!(
                "{}: clock jumped {}s ahead, skipping to {t}",
                self.name,
                t - last
            );
            {
                // the gap breaks the chunk's timeline, close it at its real
                // interval and restart just before t
                let mut state = locked(&self.state);
                self.release_chunk(&mut state);
                state.last_flushed = t - 1;
                self.begin_chunk(&mut state, t - 1);
            }
            self.flush(t);
            return;
        }
        for second in last + 1..=t {
            self.flush(second);
        }
    }

    fn shutdown(&self) {
        let mut state = locked(&self.state);
        self.release_chunk(&mut state);
        let dropped = {
            let mut queue = locked(&self.queue);
            let n = queue.len();
            queue.clear();
            n
        };
        if dropped > 0 {
            debug!("{}: {dropped} queued frames discarded at shutdown", self.name);
        }
    }
}

impl VideoRecorder {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_flushed(&self) -> i64 {
        locked(&self.state).last_flushed
    }

    pub fn chunks_finalized(&self) -> u64 {
        locked(&self.state).chunks_finalized
    }

    pub fn last_chunk(&self) -> Option<String> {
        locked(&self.state).last_chunk.clone()
    }

    pub fn has_open_chunk(&self) -> bool {
        locked(&self.state).chunk.is_some()
    }

    pub fn queued(&self) -> usize {
        locked(&self.queue).len()
    }

    fn watermark(&self, frame: &mut Frame, t: i64) {
        let label = format!("{} {}", time_string(t, self.config.use_localtime), self.name);
        if let Err(e) = self.ops.draw_label(frame, &label) {
            debug!("{}: watermark failed: {e}", self.name);
        }
    }

    fn should_roll(&self, chunk: &Chunk, t: i64) -> bool {
        let len = self.config.chunk_length_sec;
        if len == 0 {
            return false;
        }
        if self.config.uniform_chunks {
            t.rem_euclid(i64::from(len)) == 0
        } else {
            chunk.written >= len * self.config.fps
        }
    }

    // uniform chunks only run up to the next wall-clock boundary
    fn nominal_length(&self, t: i64) -> u32 {
        let len = self.config.chunk_length_sec;
        if len == 0 || !self.config.uniform_chunks {
            return len;
        }
        len - t.rem_euclid(i64::from(len)) as u32
    }

    fn begin_chunk(&self, state: &mut OutState, t: i64) {
        self.release_chunk(state);

        let Some(fourcc) = state.fourcc else {
            return;
        };
        let nominal_sec = self.nominal_length(t);
        let path = self
            .namer
            .record_file(&self.name, &self.config.file_extension, t, nominal_sec);
        let opened = match path.parent() {
            Some(dir) => std::fs::create_dir_all(dir).map_err(PipelineError::from),
            None => Ok(()),
        }
        .and_then(|_| {
            self.sinks.open(
                &path,
                fourcc,
                self.config.fps,
                (self.config.width, self.config.height),
            )
        });

        match opened {
            Ok(sink) => {
                if state.open_failures > 0 {
                    info!(
                        "{}: chunk output recovered after {} failed attempts",
                        self.name, state.open_failures
                    );
                    state.open_failures = 0;
                }
                debug!("{}: chunk started: {}", self.name, path.display());
                state.chunk = Some(Chunk {
                    start: t,
                    path,
                    nominal_sec,
                    sink,
                    written: 0,
                });
            }
            Err(e) => {
                if state.open_failures == 0 {
                    error!("video file creation failed: {} ({e})", path.display());
                } else {
                    debug!("video file creation failed again: {} ({e})", path.display());
                }
                state.open_failures += 1;
            }
        }
    }

    fn release_chunk(&self, state: &mut OutState) -> Option<ChunkInfo> {
        let mut chunk = state.chunk.take()?;
        if let Err(e) = chunk.sink.close() {
            warn!("{}: closing {} failed: {e}", self.name, chunk.path.display());
        }

        if chunk.written == 0 {
            match std::fs::remove_file(&chunk.path) {
                Ok(()) => debug!("{}: empty chunk removed: {}", self.name, chunk.path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("{}: removing empty chunk failed: {e}", self.name),
            }
            return None;
        }

        let covered = chunk.written / self.config.fps;
        let mut start = chunk.start;
        if chunk.nominal_sec == 0 || covered < chunk.nominal_sec {
            start = state.last_flushed - i64::from(covered);
            let renamed =
                self.namer
                    .record_file(&self.name, &self.config.file_extension, start, covered);
            if renamed != chunk.path {
                match std::fs::rename(&chunk.path, &renamed) {
                    Ok(()) => chunk.path = renamed,
                    Err(e) => warn!(
                        "{}: renaming {} failed: {e}",
                        self.name,
                        chunk.path.display()
                    ),
                }
            }
        }

        let info = ChunkInfo::new(
            chunk.path.display().to_string(),
            time_string(start, self.config.use_localtime),
            Duration::from_secs(u64::from(covered)),
        );
        info!(
            "Chunk: {}, timestamp: {}, duration: {}",
            info.chunk,
            info.timestamp,
            info.duration.as_secs()
        );
        state.chunks_finalized += 1;
        state.last_chunk = Some(info.chunk.clone());
        if let Some(on_chunk) = &self.on_chunk {
            on_chunk(&info);
        }
        Some(info)
    }
}

impl Drop for VideoRecorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct VideoRecorderBuilder {
    name: String,
    config: OutputConfig,
    namer: Option<Arc<ChunkNamer>>,
    sinks: Option<Arc<dyn SinkFactory>>,
    ops: Option<Arc<dyn ImageOps>>,
    on_chunk: Option<ChunkCallback>,
}

impl VideoRecorderBuilder {
    pub fn new() -> VideoRecorderBuilder {
        VideoRecorderBuilder {
            name: "chunk".to_string(),
            config: OutputConfig::default(),
            namer: None,
            sinks: None,
            ops: None,
            on_chunk: None,
        }
    }

    pub fn with_name(mut self, s: &str) -> VideoRecorderBuilder {
        self.name = s.to_string();
        self
    }

    pub fn with_output(mut self, config: OutputConfig) -> VideoRecorderBuilder {
        self.config = config;
        self
    }

    pub fn with_namer(mut self, namer: Arc<ChunkNamer>) -> VideoRecorderBuilder {
        self.namer = Some(namer);
        self
    }

    pub fn with_sinks(mut self, sinks: Arc<dyn SinkFactory>) -> VideoRecorderBuilder {
        self.sinks = Some(sinks);
        self
    }

    pub fn with_image_ops(mut self, ops: Arc<dyn ImageOps>) -> VideoRecorderBuilder {
        self.ops = Some(ops);
        self
    }

    pub fn with_on_chunk<F>(mut self, f: F) -> VideoRecorderBuilder
    where
        F: Fn(&ChunkInfo) + Send + Sync + 'static,
    {
        self.on_chunk = Some(Box::new(f));
        self
    }

    pub fn build(self) -> VideoRecorder {
        VideoRecorder {
            name: self.name,
            config: self.config,
            namer: self
                .namer
                .unwrap_or_else(|| Arc::new(ChunkNamer::new(".", false))),
            sinks: self.sinks.unwrap_or_else(|| Arc::new(MjpegSinkFactory)),
            ops: self.ops.unwrap_or_else(|| Arc::new(RasterOps)),
            queue: Mutex::new(VecDeque::new()),
            state: Mutex::new(OutState::default()),
            on_chunk: self.on_chunk,
        }
    }
}
