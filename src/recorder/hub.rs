//! The supervisor: owns every capture session and the retention engine and
//! drives their periodic work.

use crate::api::status::StatusBoard;
use crate::dtos::messages::{ChunkInfo, StreamEvent};
use crate::recorder::capturer::{CaptureContext, Capturer, CapturerRegistry};
use crate::recorder::clock::{Clock, SystemClock};
use crate::recorder::common::PipelineError;
use crate::recorder::imageops::ImageOps;
use crate::recorder::naming::ChunkNamer;
use crate::recorder::sink::SinkFactory;
use crate::recorder::storage::RetentionEngine;
use crate::recorder::videosource::{SourceConnector, UriConnector};
use crate::utils::config::{HubConfig, HubSettings};
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// The external collaborators every session is built from.
#[derive(Clone)]
pub struct Backends {
    pub connector: Arc<dyn SourceConnector>,
    pub sinks: Arc<dyn SinkFactory>,
    pub ops: Arc<dyn ImageOps>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    /// Picks the compiled-in backends, OpenCV when available.
    pub fn detect() -> Result<Backends, PipelineError> {
        #[cfg(feature = "opencv")]
        let (sinks, ops): (Arc<dyn SinkFactory>, Arc<dyn ImageOps>) = (
            Arc::new(crate::recorder::cv::OpenCvSinkFactory),
            Arc::new(crate::recorder::cv::OpenCvOps),
        );
        #[cfg(not(feature = "opencv"))]
        let (sinks, ops): (Arc<dyn SinkFactory>, Arc<dyn ImageOps>) = (
            Arc::new(crate::recorder::sink::MjpegSinkFactory),
            Arc::new(crate::recorder::imageops::RasterOps),
        );
        Ok(Backends {
            connector: Arc::new(UriConnector::new()?),
            sinks,
            ops,
            clock: Arc::new(SystemClock),
        })
    }
}

pub struct Hub {
    settings: HubSettings,
    clock: Arc<dyn Clock>,
    retention: RetentionEngine,
    capturers: Vec<Box<dyn Capturer>>,
    events: Receiver<StreamEvent>,
    chunks: Receiver<ChunkInfo>,
    board: StatusBoard,
}

impl Hub {
    pub fn new(config: &HubConfig) -> Result<Hub, PipelineError> {
        Hub::with_backends(config, Backends::detect()?, &CapturerRegistry::new())
    }

    /// Sets up storage, then creates and starts one session per source.
    /// Sessions whose output cannot be opened are skipped; every other
    /// problem stops startup.
    pub fn with_backends(
        config: &HubConfig,
        backends: Backends,
        registry: &CapturerRegistry,
    ) -> Result<Hub, PipelineError> {
        let storage = &config.storage;
        let retention = RetentionEngine::init(
            &storage.record_dir,
            storage.size_limit_mb,
            storage.check_interval_sec,
        )?;
        let namer = Arc::new(ChunkNamer::new(&storage.record_dir, storage.use_localtime));

        let (tx, events) = mpsc::channel();
        let (chunk_tx, chunks) = mpsc::channel();
        let ctx = CaptureContext {
            namer,
            connector: backends.connector,
            sinks: backends.sinks,
            ops: backends.ops,
            clock: backends.clock.clone(),
            events: Some(tx),
            chunks: Some(chunk_tx),
            idle_sleep: Duration::from_millis(config.hub.idle_sleep_ms),
        };

        let created = config
            .sources
            .iter()
            .map(|source| registry.create(source.clone(), ctx.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let board = StatusBoard::default();
        let mut capturers = Vec::with_capacity(created.len());
        for mut capturer in created {
            if let Err(e) = capturer.init() {
                error!("capturer {} failed to initialise, skipping: {e}", capturer.name());
                continue;
            }
            capturer.start();
            board.update(capturer.status());
            capturers.push(capturer);
        }
        if capturers.is_empty() {
            return Err(PipelineError::Config("no capturer could be started".to_string()));
        }
        info!("hub running {} of {} capturers", capturers.len(), config.sources.len());

        Ok(Hub {
            settings: config.hub.clone(),
            clock: backends.clock,
            retention,
            capturers,
            events,
            chunks,
            board,
        })
    }

    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn capturer_names(&self) -> Vec<&str> {
        self.capturers.iter().map(|c| c.name()).collect()
    }

    /// One supervisor iteration.
    pub fn tick(&self) {
        self.retention.tick(self.clock.now());
        self.refresh_board();
    }

    // statuses first so events keep counting on top of them
    fn refresh_board(&self) {
        for capturer in &self.capturers {
            self.board.update(capturer.status());
        }
        for event in self.events.try_iter() {
            debug!("stream event: {event:?}");
            self.board.apply(&event);
        }
        for chunk in self.chunks.try_iter() {
            self.board.record_chunk(chunk);
        }
    }

    pub fn run(&self, exit: &AtomicBool) {
        let period = Duration::from_millis(self.settings.tick_ms);
        while !exit.load(Ordering::SeqCst) {
            self.tick();
            thread::sleep(period);
        }
        info!("hub loop finished");
    }

    /// Stops every session and waits for an in-flight retention scan.
    pub fn shutdown(&mut self) {
        for capturer in self.capturers.iter_mut() {
            capturer.stop();
        }
        self.refresh_board();
        self.retention.wait();
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.shutdown();
    }
}
