use crate::recorder::common::PipelineError;
use crate::recorder::frame::Frame;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use log::debug;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

const JPEG_QUALITY: u8 = 85;

/// Four character codec identifier, e.g. `MJPG`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fourcc(pub [u8; 4]);

impl Fourcc {
    pub fn eq_ignore_case(&self, other: &str) -> bool {
        other.len() == 4 && self.0.eq_ignore_ascii_case(other.as_bytes())
    }
}

impl FromStr for Fourcc {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !s.is_ascii() {
            return Err(PipelineError::Config(format!("bad fourcc value: {s:?}")));
        }
        Ok(Fourcc([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

/// One open output file.
pub trait VideoSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<(), PipelineError>;

    fn close(&mut self) -> Result<(), PipelineError>;
}

/// Opens encoders for new chunk files.
pub trait SinkFactory: Send + Sync {
    fn open(
        &self,
        path: &Path,
        codec: Fourcc,
        fps: u32,
        size: (u32, u32),
    ) -> Result<Box<dyn VideoSink>, PipelineError>;
}

/// Motion-JPEG written as a plain sequence of JPEG images.
pub struct MjpegSinkFactory;

impl SinkFactory for MjpegSinkFactory {
    fn open(
        &self,
        path: &Path,
        codec: Fourcc,
        fps: u32,
        size: (u32, u32),
    ) -> Result<Box<dyn VideoSink>, PipelineError> {
        if !codec.eq_ignore_case("MJPG") {
            return Err(PipelineError::Encoding(format!(
                "codec {codec} needs the opencv feature"
            )));
        }
        let file = File::create(path)?;
        debug!("mjpeg sink opened: {} ({fps} fps)", path.display());
        Ok(Box::new(MjpegSink {
            writer: Some(BufWriter::new(file)),
            size,
            rgb: Vec::new(),
        }))
    }
}

pub struct MjpegSink {
    writer: Option<BufWriter<File>>,
    size: (u32, u32),
    rgb: Vec<u8>,
}

impl VideoSink for MjpegSink {
    fn write(&mut self, frame: &Frame) -> Result<(), PipelineError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PipelineError::Encoding("sink already closed".to_string()))?;
        if frame.size() != self.size {
            return Err(PipelineError::Encoding(format!(
                "frame is {:?}, sink expects {:?}",
                frame.size(),
                self.size
            )));
        }
        self.rgb.clear();
        for px in frame.data.chunks_exact(3) {
            self.rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        JpegEncoder::new_with_quality(writer, JPEG_QUALITY)
            .encode(&self.rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
            .map_err(|e| PipelineError::Encoding(e.to_string()))
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_parsing() {
        assert_eq!("mjpg".parse::<Fourcc>().unwrap().to_string(), "mjpg");
        assert!("mjpeg".parse::<Fourcc>().is_err());
        assert!("".parse::<Fourcc>().is_err());
        assert!("MJPG".parse::<Fourcc>().unwrap().eq_ignore_case("mjpg"));
    }

    #[test]
    fn mjpeg_sink_writes_jpeg_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mjpeg");
        let mut sink = MjpegSinkFactory
            .open(&path, "MJPG".parse().unwrap(), 5, (16, 8))
            .unwrap();
        sink.write(&Frame::filled(16, 8, [0, 0, 255])).unwrap();
        sink.write(&Frame::blank(16, 8)).unwrap();
        assert!(sink.write(&Frame::blank(8, 8)).is_err());
        sink.close().unwrap();
        assert!(sink.write(&Frame::blank(16, 8)).is_err());

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let soi = bytes.windows(2).filter(|w| *w == [0xFF, 0xD8]).count();
        assert!(soi >= 2);
    }

    #[test]
    fn mjpeg_factory_rejects_other_codecs() {
        let dir = tempfile::tempdir().unwrap();
        let res = MjpegSinkFactory.open(&dir.path().join("x.avi"), "XVID".parse().unwrap(), 5, (4, 4));
        assert!(matches!(res, Err(PipelineError::Encoding(_))));
    }
}
