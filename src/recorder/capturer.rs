//! Capture sessions: one worker thread per camera pulling frames, keeping the
//! output pipeline ticking and recreating the connection when it goes stale.

use crate::dtos::messages::{ChunkInfo, SourceStatus, StreamEvent};
use crate::recorder::clock::Clock;
use crate::recorder::common::PipelineError;
use crate::recorder::frame::Frame;
use crate::recorder::imageops::{flip_axis, normalized_kernel, FlipAxis, ImageOps};
use crate::recorder::naming::ChunkNamer;
use crate::recorder::sink::SinkFactory;
use crate::recorder::videorecorder::{Recorder, VideoRecorder, VideoRecorderBuilder};
use crate::recorder::videosource::{FrameSource, SourceConnector};
use crate::utils::config::{SourceConfig, DEFAULT_CAPTURER_TYPE};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Seconds without a frame before the stream counts as down.
pub const HEALTH_WINDOW_SEC: i64 = 1;

pub trait Capturer: Send {
    // Open the first chunk and spawn the worker
    fn init(&mut self) -> Result<(), PipelineError>;

    // Begin feeding frames into the output
    fn start(&self);

    // Stop the worker, wait for it, finalize the open chunk
    fn stop(&mut self);

    fn is_capturing(&self) -> bool;

    fn is_stream_healthy(&self) -> bool;

    fn name(&self) -> &str;

    fn status(&self) -> SourceStatus;
}

/// Services every capture session shares.
#[derive(Clone)]
pub struct CaptureContext {
    pub namer: Arc<ChunkNamer>,
    pub connector: Arc<dyn SourceConnector>,
    pub sinks: Arc<dyn SinkFactory>,
    pub ops: Arc<dyn ImageOps>,
    pub clock: Arc<dyn Clock>,
    pub events: Option<Sender<StreamEvent>>,
    pub chunks: Option<Sender<ChunkInfo>>,
    pub idle_sleep: Duration,
}

pub type CapturerCtor = fn(SourceConfig, CaptureContext) -> Box<dyn Capturer>;

/// Maps capturer type names from the config to constructors.
pub struct CapturerRegistry {
    ctors: HashMap<String, CapturerCtor>,
}

impl CapturerRegistry {
    pub fn new() -> CapturerRegistry {
        let mut registry = CapturerRegistry {
            ctors: HashMap::new(),
        };
        registry.register(DEFAULT_CAPTURER_TYPE, |config, ctx| {
            Box::new(StreamCapturer::new(config, ctx))
        });
        registry
    }

    pub fn register(&mut self, kind: &str, ctor: CapturerCtor) {
        self.ctors.insert(kind.to_string(), ctor);
    }

    pub fn create(
        &self,
        config: SourceConfig,
        ctx: CaptureContext,
    ) -> Result<Box<dyn Capturer>, PipelineError> {
        let ctor = self.ctors.get(&config.kind).ok_or_else(|| {
            PipelineError::Config(format!(
                "unknown capturer type {:?} for {}",
                config.kind, config.name
            ))
        })?;
        Ok(ctor(config, ctx))
    }
}

#[derive(Default)]
struct Flags {
    capturing: AtomicBool,
    healthy: AtomicBool,
    exit: AtomicBool,
}

/// The stock capturer: any stream the connector can open.
pub struct StreamCapturer {
    config: SourceConfig,
    ctx: CaptureContext,
    recorder: Arc<VideoRecorder>,
    flags: Arc<Flags>,
    worker: Option<JoinHandle<()>>,
}

impl StreamCapturer {
    pub fn new(config: SourceConfig, ctx: CaptureContext) -> StreamCapturer {
        let mut builder = VideoRecorderBuilder::new()
            .with_name(&config.name)
            .with_output(config.output.clone())
            .with_namer(ctx.namer.clone())
            .with_sinks(ctx.sinks.clone())
            .with_image_ops(ctx.ops.clone());
        if let Some(chunks) = ctx.chunks.clone() {
            builder = builder.with_on_chunk(move |info| {
                let _ = chunks.send(info.clone());
            });
        }
        let recorder = builder.build();
        StreamCapturer {
            config,
            ctx,
            recorder: Arc::new(recorder),
            flags: Arc::new(Flags::default()),
            worker: None,
        }
    }

    fn worker(&self) -> CaptureWorker {
        CaptureWorker {
            config: self.config.clone(),
            connector: self.ctx.connector.clone(),
            ops: self.ctx.ops.clone(),
            events: self.ctx.events.clone(),
            recorder: self.recorder.clone(),
            flags: self.flags.clone(),
            source: None,
            last_grab: 0,
            last_reconnect: i64::MIN,
            blur: normalized_kernel(self.config.filter_k),
            flip: flip_axis(self.config.flip_x, self.config.flip_y),
        }
    }
}

impl Capturer for StreamCapturer {
    fn init(&mut self) -> Result<(), PipelineError> {
        if self.worker.is_some() {
            return Err(PipelineError::Config(format!(
                "{}: capturer already initialised",
                self.config.name
            )));
        }
        // the current second is still being captured, flush it on the next pass
        self.recorder.init(self.ctx.clock.now() - 1)?;

        let worker = self.worker();
        let clock = self.ctx.clock.clone();
        let idle_sleep = self.ctx.idle_sleep;
        let handle = thread::Builder::new()
            .name(format!("capture-{}", self.config.name))
            .spawn(move || worker.run(clock, idle_sleep))?;
        self.worker = Some(handle);
        Ok(())
    }

    fn start(&self) {
        self.flags.capturing.store(true, Ordering::SeqCst);
        info!("capturer started: {}", self.config.name);
    }

    fn stop(&mut self) {
        self.flags.capturing.store(false, Ordering::SeqCst);
        self.flags.exit.store(true, Ordering::SeqCst);
        let Some(handle) = self.worker.take() else {
            return;
        };
        if handle.join().is_err() {
            error!("capture worker panicked: {}", self.config.name);
        }
        self.recorder.shutdown();
        info!("capturer stopped: {}", self.config.name);
    }

    fn is_capturing(&self) -> bool {
        self.flags.capturing.load(Ordering::SeqCst)
    }

    fn is_stream_healthy(&self) -> bool {
        self.flags.healthy.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn status(&self) -> SourceStatus {
        SourceStatus {
            name: self.config.name.clone(),
            capturing: self.is_capturing(),
            healthy: self.is_stream_healthy(),
            chunks_finalized: self.recorder.chunks_finalized(),
            last_chunk: self.recorder.last_chunk(),
            outages: 0,
        }
    }
}

impl Drop for StreamCapturer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureWorker {
    config: SourceConfig,
    connector: Arc<dyn SourceConnector>,
    ops: Arc<dyn ImageOps>,
    events: Option<Sender<StreamEvent>>,
    recorder: Arc<VideoRecorder>,
    flags: Arc<Flags>,
    source: Option<Box<dyn FrameSource>>,
    last_grab: i64,
    last_reconnect: i64,
    blur: Option<u32>,
    flip: Option<FlipAxis>,
}

impl CaptureWorker {
    fn run(mut self, clock: Arc<dyn Clock>, idle_sleep: Duration) {
        let t = clock.now();
        self.last_grab = t;
        self.connect(t);
        while !self.flags.exit.load(Ordering::SeqCst) {
            if !self.step(clock.now()) {
                thread::sleep(idle_sleep);
            }
        }
        debug!("capture worker exiting: {}", self.config.name);
    }

    // drop the old connection before opening its replacement
    fn connect(&mut self, t: i64) {
        self.source = None;
        self.last_reconnect = t;
        self.source = match self.connector.open(&self.config.uri) {
            Ok(source) => Some(source),
            Err(e) => {
                debug!("{}: connect failed: {e}", self.config.name);
                None
            }
        };
    }

    /// One loop iteration at wall-clock second `t`; returns whether a frame
    /// was captured.
    fn step(&mut self, t: i64) -> bool {
        let mut grabbed = false;
        if self.flags.capturing.load(Ordering::SeqCst) {
            if let Some(frame) = self.grab() {
                grabbed = true;
                self.last_grab = t;
                match self.preprocess(frame) {
                    Ok(frame) => self.recorder.push_frame(frame, t),
                    Err(e) => debug!("{}: frame dropped: {e}", self.config.name),
                }
                if !self.flags.healthy.swap(true, Ordering::SeqCst) {
                    info!("capturer in-stream is up: {}", self.config.name);
                    self.emit(StreamEvent::Up {
                        source: self.config.name.clone(),
                        at: t,
                    });
                }
            }
        }

        self.recorder.update(t);

        if t - self.last_grab > HEALTH_WINDOW_SEC {
            // reconnect at most once per wall-clock second
            if t != self.last_reconnect {
                self.connect(t);
            }
            if self.flags.healthy.swap(false, Ordering::SeqCst) {
                warn!("capturer in-stream is down: {}", self.config.name);
                self.emit(StreamEvent::Down {
                    source: self.config.name.clone(),
                    at: t,
                });
            }
        }
        grabbed
    }

    fn grab(&mut self) -> Option<Frame> {
        let source = self.source.as_mut()?;
        if !source.is_open() {
            return None;
        }
        source.try_grab()
    }

    fn preprocess(&self, frame: Frame) -> Result<Frame, PipelineError> {
        let output = &self.config.output;
        let mut frame = self.ops.resize(frame, output.width, output.height)?;
        if let Some(kernel) = self.blur {
            frame = self.ops.blur(frame, kernel)?;
        }
        if let Some(axis) = self.flip {
            frame = self.ops.flip(frame, axis)?;
        }
        Ok(frame)
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(events) = &self.events {
            // the hub may already be gone during shutdown
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::recorder::clock::manual::ManualClock;
    use crate::recorder::imageops::RasterOps;
    use crate::recorder::testing::{Grab, MemorySinks, ScriptedConnector};
    use crate::utils::config::OutputConfig;
    use std::sync::mpsc::{self, Receiver};

    struct Rig {
        connector: Arc<ScriptedConnector>,
        sinks: Arc<MemorySinks>,
        clock: Arc<ManualClock>,
        events: Receiver<StreamEvent>,
        chunks: Receiver<ChunkInfo>,
        ctx: CaptureContext,
        _dir: tempfile::TempDir,
    }

    fn rig(t0: i64) -> Rig {
        let _ = env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(ScriptedConnector::new((8, 6)));
        let sinks = Arc::new(MemorySinks::default());
        let clock = Arc::new(ManualClock::new(t0));
        let (tx, rx) = mpsc::channel();
        let (chunk_tx, chunk_rx) = mpsc::channel();
        let ctx = CaptureContext {
            namer: Arc::new(ChunkNamer::new(dir.path(), false)),
            connector: connector.clone(),
            sinks: sinks.clone(),
            ops: Arc::new(RasterOps),
            clock: clock.clone(),
            events: Some(tx),
            chunks: Some(chunk_tx),
            idle_sleep: Duration::from_millis(1),
        };
        Rig {
            connector,
            sinks,
            clock,
            events: rx,
            chunks: chunk_rx,
            ctx,
            _dir: dir,
        }
    }

    fn source_config() -> SourceConfig {
        SourceConfig::new("porch", "scripted://porch").with_output(OutputConfig {
            fps: 2,
            width: 8,
            height: 6,
            chunk_length_sec: 0,
            watermark: false,
            ..OutputConfig::default()
        })
    }

    #[test]
    fn health_transitions_once_each_way() {
        let rig = rig(100);
        let capturer = StreamCapturer::new(source_config(), rig.ctx.clone());
        capturer.recorder.init(100).unwrap();
        capturer.start();
        let mut worker = capturer.worker();
        worker.last_grab = 100;
        worker.connect(100);
        assert_eq!(rig.connector.opens(), 1);

        rig.connector.push(&[Grab::Frame]);
        assert!(worker.step(100));
        assert!(capturer.is_stream_healthy());

        // two seconds without frames
        assert!(!worker.step(101));
        assert!(capturer.is_stream_healthy());
        assert!(!worker.step(102));
        assert!(!capturer.is_stream_healthy());
        assert!(!worker.step(102));
        assert_eq!(rig.connector.opens(), 2);
        assert!(!worker.step(103));
        assert_eq!(rig.connector.opens(), 3);

        rig.connector.push(&[Grab::Frame]);
        assert!(worker.step(104));
        assert!(capturer.is_stream_healthy());

        let events: Vec<StreamEvent> = rig.events.try_iter().collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::Up { source: "porch".to_string(), at: 100 },
                StreamEvent::Down { source: "porch".to_string(), at: 102 },
                StreamEvent::Up { source: "porch".to_string(), at: 104 },
            ]
        );
    }

    #[test]
    fn paused_capturer_keeps_the_timeline() {
        let rig = rig(10);
        let capturer = StreamCapturer::new(source_config(), rig.ctx.clone());
        capturer.recorder.init(10).unwrap();
        let mut worker = capturer.worker();
        worker.connect(10);
        rig.connector.push(&[Grab::Frame, Grab::Frame]);
        assert!(!worker.step(11));
        assert!(!worker.step(12));
        assert_eq!(rig.sinks.written(), vec![4]);
        assert_eq!(rig.connector.script.lock().unwrap().len(), 2);
    }

    #[test]
    fn refused_connections_are_not_fatal() {
        let rig = rig(50);
        rig.connector.refuse.store(true, Ordering::SeqCst);
        let capturer = StreamCapturer::new(source_config(), rig.ctx.clone());
        capturer.recorder.init(50).unwrap();
        capturer.start();
        let mut worker = capturer.worker();
        worker.last_grab = 50;
        worker.connect(50);
        for t in 51..55 {
            assert!(!worker.step(t));
        }
        assert!(rig.connector.opens() >= 4);
        assert_eq!(rig.sinks.written(), vec![8]);
    }

    #[test]
    fn preprocess_resizes_before_output() {
        let rig = rig(0);
        let config = source_config().with_filter_k(2).with_flip_x(true);
        let capturer = StreamCapturer::new(config, rig.ctx.clone());
        let worker = capturer.worker();
        assert_eq!(worker.blur, Some(3));
        assert_eq!(worker.flip, Some(FlipAxis::X));
        let frame = worker.preprocess(Frame::blank(32, 24)).unwrap();
        assert_eq!(frame.size(), (8, 6));
    }

    #[test]
    fn worker_thread_records_and_stops() {
        let rig = rig(1000);
        let mut capturer = StreamCapturer::new(source_config(), rig.ctx.clone());
        capturer.init().unwrap();
        assert!(capturer.init().is_err());
        capturer.start();
        assert!(capturer.is_capturing());

        rig.connector.push(&[Grab::Frame; 3]);
        thread::sleep(Duration::from_millis(50));
        rig.clock.set(1001);
        thread::sleep(Duration::from_millis(50));
        rig.clock.set(1002);
        thread::sleep(Duration::from_millis(50));
        capturer.stop();

        assert!(!capturer.is_capturing());
        // seconds 1000, 1001 and 1002 each flushed once
        assert_eq!(rig.sinks.written(), vec![6]);
        assert_eq!(capturer.recorder.last_flushed(), 1002);
        let first = rig.sinks.opened()[0].clone();
        let name = first.file_name().unwrap().to_str().unwrap();
        assert_eq!(rig.ctx.namer.parse(name).unwrap().1, 999);
        assert_eq!(capturer.status().chunks_finalized, 1);
        assert!(rig.events.try_iter().any(|e| matches!(e, StreamEvent::Up { .. })));
        let finished: Vec<ChunkInfo> = rig.chunks.try_iter().collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].duration, Duration::from_secs(3));
    }

    #[test]
    fn registry_rejects_unknown_types() {
        let rig = rig(0);
        let registry = CapturerRegistry::new();
        let mut config = source_config();
        assert!(registry.create(config.clone(), rig.ctx.clone()).is_ok());
        config.kind = "thermal".to_string();
        assert!(matches!(
            registry.create(config, rig.ctx.clone()),
            Err(PipelineError::Config(_))
        ));
    }
}
