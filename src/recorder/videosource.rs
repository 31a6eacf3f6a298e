use crate::recorder::common::PipelineError;
use crate::recorder::frame::{Frame, CHANNELS};
use log::info;
use std::time::{Duration, Instant};

const TESTSRC_SCHEME: &str = "testsrc://";
const TESTSRC_OFFLINE: &str = "offline";
const DEFAULT_TEST_FPS: u32 = 15;
const DEFAULT_TEST_SIZE: (u32, u32) = (640, 480);
const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [0, 255, 255],
    [255, 255, 0],
    [0, 255, 0],
    [255, 0, 255],
    [0, 0, 255],
    [255, 0, 0],
    [0, 0, 0],
];

/// A single live stream connection. Reconnecting means dropping it and asking
/// the connector for a fresh one.
pub trait FrameSource: Send {
    fn is_open(&self) -> bool;

    // grab and decode one frame, None when nothing could be read
    fn try_grab(&mut self) -> Option<Frame>;
}

/// Opens stream connections from URIs.
pub trait SourceConnector: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, PipelineError>;
}

/// Routes `testsrc://` to the synthetic source and everything else to the
/// first compiled-in decoding backend.
pub struct UriConnector {
    #[cfg(feature = "gstreamer")]
    gst: gst_backend::GstConnector,
}

impl UriConnector {
    pub fn new() -> Result<UriConnector, PipelineError> {
        Ok(UriConnector {
            #[cfg(feature = "gstreamer")]
            gst: gst_backend::GstConnector::new()?,
        })
    }
}

impl SourceConnector for UriConnector {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, PipelineError> {
        if let Some(target) = uri.strip_prefix(TESTSRC_SCHEME) {
            return Ok(Box::new(SyntheticSource::from_target(target)?));
        }
        #[cfg(feature = "opencv")]
        {
            return Ok(Box::new(crate::recorder::cv::OpenCvSource::open(uri)?));
        }
        #[cfg(all(feature = "gstreamer", not(feature = "opencv")))]
        {
            return self.gst.open(uri);
        }
        #[cfg(not(any(feature = "opencv", feature = "gstreamer")))]
        {
            Err(PipelineError::Source(format!(
                "no decoding backend compiled in for {uri}"
            )))
        }
    }
}

/// Moving colour bars paced at a fixed rate, for dry runs without a camera.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    interval: Duration,
    next_due: Instant,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: u32) -> SyntheticSource {
        SyntheticSource {
            width,
            height,
            interval: Duration::from_secs(1) / fps.max(1),
            next_due: Instant::now(),
            frame_count: 0,
        }
    }

    // "<pattern>?fps=15&width=640&height=480"
    fn from_target(target: &str) -> Result<SyntheticSource, PipelineError> {
        let (pattern, query) = target.split_once('?').unwrap_or((target, ""));
        if pattern == TESTSRC_OFFLINE {
            return Err(PipelineError::Source("test source is offline".to_string()));
        }
        let mut fps = DEFAULT_TEST_FPS;
        let (mut width, mut height) = DEFAULT_TEST_SIZE;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| PipelineError::Source(format!("bad test source option: {pair}")))?;
            let value: u32 = value
                .parse()
                .map_err(|_| PipelineError::Source(format!("bad test source value: {pair}")))?;
            match key {
                "fps" => fps = value,
                "width" => width = value,
                "height" => height = value,
                _ => return Err(PipelineError::Source(format!("unknown test source option: {key}"))),
            }
        }
        if width == 0 || height == 0 {
            return Err(PipelineError::Source("test source needs a non-zero size".to_string()));
        }
        info!("synthetic source {pattern} {width}x{height}@{fps}");
        Ok(SyntheticSource::new(width, height, fps))
    }

    fn render(&self) -> Frame {
        let bar_width = (self.width / BARS.len() as u32).max(1);
        let shift = self.frame_count as u32;
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * CHANNELS);
        for _ in 0..self.height {
            for x in 0..self.width {
                let bar = ((x + shift) / bar_width) as usize % BARS.len();
                data.extend_from_slice(&BARS[bar]);
            }
        }
        Frame::new(self.width, self.height, data)
    }
}

impl FrameSource for SyntheticSource {
    fn is_open(&self) -> bool {
        true
    }

    fn try_grab(&mut self) -> Option<Frame> {
        let now = Instant::now();
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }
        self.next_due = self.next_due.max(now) + self.interval;
        let frame = self.render();
        self.frame_count += 1;
        Some(frame)
    }
}

#[cfg(feature = "gstreamer")]
mod gst_backend {
    use super::FrameSource;
    use crate::recorder::common::PipelineError;
    use crate::recorder::frame::{Frame, CHANNELS};
    use futures::StreamExt;
    use gst::prelude::*;
    use gstreamer_app::{gst, AppSink};
    use log::{debug, error, info};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::runtime::Runtime;

    const VIDEO_SINK: &str = "video-sink";
    const PULL_TIMEOUT_MS: u64 = 500;

    pub struct GstConnector {
        runtime: Runtime,
    }

    impl GstConnector {
        pub fn new() -> Result<GstConnector, PipelineError> {
            gst::init().map_err(|e| PipelineError::Source(e.to_string()))?;
            Ok(GstConnector {
                runtime: Runtime::new()?,
            })
        }

        pub fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, PipelineError> {
            let pipeline_str = format!(
                "uridecodebin uri={uri} ! videoconvert ! video/x-raw,format=BGR ! \
                 appsink name={VIDEO_SINK} sync=false max-buffers=1 drop=true"
            );
            info!("Starting source pipeline: {}", pipeline_str);
            let pipeline = gst::parse::launch(&pipeline_str)
                .map_err(|e| PipelineError::Source(e.to_string()))?
                .downcast::<gst::Pipeline>()
                .map_err(|_| PipelineError::Source("source is not a pipeline".to_string()))?;
            let appsink = pipeline
                .by_name(VIDEO_SINK)
                .ok_or_else(|| PipelineError::Source("appsink missing".to_string()))?
                .downcast::<AppSink>()
                .map_err(|_| PipelineError::Source("appsink has unexpected type".to_string()))?;
            let bus = pipeline
                .bus()
                .ok_or_else(|| PipelineError::Source("pipeline without bus".to_string()))?;

            pipeline.set_state(gst::State::Playing).map_err(|e| {
                error!("{e}");
                PipelineError::Source(format!("unable to play {uri}"))
            })?;

            let open = Arc::new(AtomicBool::new(true));
            let watch = open.clone();
            self.runtime.spawn(async move {
                message_loop(bus, watch).await;
            });
            Ok(Box::new(GstSource {
                pipeline,
                appsink,
                open,
            }))
        }
    }

    pub struct GstSource {
        pipeline: gst::Pipeline,
        appsink: AppSink,
        open: Arc<AtomicBool>,
    }

    impl FrameSource for GstSource {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn try_grab(&mut self) -> Option<Frame> {
            let sample = self
                .appsink
                .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))?;
            match sample_to_frame(&sample) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    debug!("dropping sample: {e}");
                    None
                }
            }
        }
    }

    impl Drop for GstSource {
        fn drop(&mut self) {
            self.open.store(false, Ordering::SeqCst);
            if let Err(e) = self.pipeline.set_state(gst::State::Null) {
                error!("{e}");
            }
        }
    }

    fn sample_to_frame(sample: &gst::Sample) -> Result<Frame, PipelineError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| PipelineError::Source("sample without buffer".to_string()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| PipelineError::Source("sample without caps".to_string()))?;
        let info = gstreamer_video::VideoInfo::from_caps(caps)
            .map_err(|e| PipelineError::Source(e.to_string()))?;
        let width = info.width();
        let height = info.height();
        let row_bytes = width as usize * CHANNELS;
        let stride = info.stride()[0] as usize;

        let map = buffer
            .map_readable()
            .map_err(|e| PipelineError::Source(e.to_string()))?;
        let data = map.as_slice();
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let line = data
                .get(start..start + row_bytes)
                .ok_or_else(|| PipelineError::Source("buffer row out of bounds".to_string()))?;
            pixels.extend_from_slice(line);
        }
        Ok(Frame::new(width, height, pixels))
    }

    async fn message_loop(bus: gst::Bus, open: Arc<AtomicBool>) {
        let mut messages = bus.stream();

        while let Some(msg) = messages.next().await {
            use gst::MessageView;

            match msg.view() {
                MessageView::Eos(..) => {
                    info!("EOS");
                    break;
                }
                MessageView::Error(err) => {
                    error!(
                        "Error from {:?}: {} ({:?})",
                        err.src().map(|s| s.path_string()),
                        err.error(),
                        err.debug()
                    );
                    break;
                }
                _ => (),
            };
        }
        open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn synthetic_source_honours_options() {
        let _ = env_logger::try_init();
        let connector = UriConnector::new().unwrap();
        let mut source = connector
            .open("testsrc://bars?fps=1000&width=32&height=8")
            .unwrap();
        assert!(source.is_open());
        let first = source.try_grab().unwrap();
        let second = source.try_grab().unwrap();
        assert_eq!(first.size(), (32, 8));
        assert_ne!(first, second, "bars should move between frames");
    }

    #[test]
    fn offline_and_malformed_test_sources_fail() {
        let connector = UriConnector::new().unwrap();
        assert!(connector.open("testsrc://offline").is_err());
        assert!(connector.open("testsrc://bars?fps=fast").is_err());
        assert!(connector.open("testsrc://bars?colour=1").is_err());
    }

    #[cfg(not(any(feature = "opencv", feature = "gstreamer")))]
    #[test]
    fn network_uri_needs_a_backend() {
        let connector = UriConnector::new().unwrap();
        let res = connector.open("rtsp://127.0.0.1:554/stream");
        assert!(matches!(res, Err(PipelineError::Source(_))));
    }
}
