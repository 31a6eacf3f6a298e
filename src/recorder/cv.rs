//! OpenCV backed capture, encoding and image ops (feature `opencv`).

use crate::recorder::common::PipelineError;
use crate::recorder::frame::Frame;
use crate::recorder::imageops::{FlipAxis, ImageOps};
use crate::recorder::sink::{Fourcc, SinkFactory, VideoSink};
use crate::recorder::videosource::FrameSource;
use log::{debug, info};
use opencv::core::{self, Mat, Point, Scalar, Size, CV_8UC3};
use opencv::prelude::*;
use opencv::{imgproc, videoio};
use std::path::Path;

fn cv_err(e: opencv::Error) -> PipelineError {
    PipelineError::Encoding(e.to_string())
}

fn frame_to_mat(frame: &Frame) -> Result<Mat, PipelineError> {
    let mut mat = Mat::new_rows_cols_with_default(
        frame.height as i32,
        frame.width as i32,
        CV_8UC3,
        Scalar::all(0.0),
    )
    .map_err(cv_err)?;
    mat.data_bytes_mut()
        .map_err(cv_err)?
        .copy_from_slice(&frame.data);
    Ok(mat)
}

fn mat_to_frame(mat: &Mat) -> Result<Frame, PipelineError> {
    if mat.typ() != CV_8UC3 {
        return Err(PipelineError::Encoding(format!(
            "unexpected mat type {}",
            mat.typ()
        )));
    }
    let owned;
    let mat = if mat.is_continuous() {
        mat
    } else {
        owned = mat.try_clone().map_err(cv_err)?;
        &owned
    };
    Ok(Frame::new(
        mat.cols() as u32,
        mat.rows() as u32,
        mat.data_bytes().map_err(cv_err)?.to_vec(),
    ))
}

pub struct OpenCvSource {
    capture: videoio::VideoCapture,
    mat: Mat,
}

impl OpenCvSource {
    pub fn open(uri: &str) -> Result<OpenCvSource, PipelineError> {
        let capture = videoio::VideoCapture::from_file(uri, videoio::CAP_ANY)
            .map_err(|e| PipelineError::Source(e.to_string()))?;
        if !capture.is_opened().unwrap_or(false) {
            return Err(PipelineError::Source(format!("unable to open {uri}")));
        }
        info!("capture opened: {uri}");
        Ok(OpenCvSource {
            capture,
            mat: Mat::default(),
        })
    }
}

impl FrameSource for OpenCvSource {
    fn is_open(&self) -> bool {
        self.capture.is_opened().unwrap_or(false)
    }

    fn try_grab(&mut self) -> Option<Frame> {
        if !self.capture.grab().unwrap_or(false) {
            return None;
        }
        if !self.capture.retrieve(&mut self.mat, 0).unwrap_or(false) || self.mat.empty() {
            return None;
        }
        match mat_to_frame(&self.mat) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!("dropping frame: {e}");
                None
            }
        }
    }
}

pub struct OpenCvSinkFactory;

impl SinkFactory for OpenCvSinkFactory {
    fn open(
        &self,
        path: &Path,
        codec: Fourcc,
        fps: u32,
        size: (u32, u32),
    ) -> Result<Box<dyn VideoSink>, PipelineError> {
        let [c1, c2, c3, c4] = codec.0.map(char::from);
        let fourcc = videoio::VideoWriter::fourcc(c1, c2, c3, c4).map_err(cv_err)?;
        let path_str = path
            .to_str()
            .ok_or_else(|| PipelineError::Encoding(format!("path is not utf-8: {}", path.display())))?;
        let writer = videoio::VideoWriter::new(
            path_str,
            fourcc,
            f64::from(fps),
            Size::new(size.0 as i32, size.1 as i32),
            true,
        )
        .map_err(cv_err)?;
        if !writer.is_opened().map_err(cv_err)? {
            return Err(PipelineError::Encoding(format!(
                "video file creation failed: {}",
                path.display()
            )));
        }
        Ok(Box::new(OpenCvSink { writer }))
    }
}

pub struct OpenCvSink {
    writer: videoio::VideoWriter,
}

impl VideoSink for OpenCvSink {
    fn write(&mut self, frame: &Frame) -> Result<(), PipelineError> {
        let mat = frame_to_mat(frame)?;
        self.writer.write(&mat).map_err(cv_err)
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        self.writer.release().map_err(cv_err)
    }
}

pub struct OpenCvOps;

impl ImageOps for OpenCvOps {
    fn resize(&self, frame: Frame, width: u32, height: u32) -> Result<Frame, PipelineError> {
        if frame.size() == (width, height) {
            return Ok(frame);
        }
        let src = frame_to_mat(&frame)?;
        let mut dst = Mat::default();
        imgproc::resize(
            &src,
            &mut dst,
            Size::new(width as i32, height as i32),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )
        .map_err(cv_err)?;
        mat_to_frame(&dst)
    }

    fn blur(&self, frame: Frame, kernel: u32) -> Result<Frame, PipelineError> {
        let src = frame_to_mat(&frame)?;
        let mut dst = Mat::default();
        imgproc::median_blur(&src, &mut dst, kernel as i32).map_err(cv_err)?;
        mat_to_frame(&dst)
    }

    fn flip(&self, frame: Frame, axis: FlipAxis) -> Result<Frame, PipelineError> {
        let code = match axis {
            FlipAxis::X => 0,
            FlipAxis::Y => 1,
            FlipAxis::Both => -1,
        };
        let src = frame_to_mat(&frame)?;
        let mut dst = Mat::default();
        core::flip(&src, &mut dst, code).map_err(cv_err)?;
        mat_to_frame(&dst)
    }

    fn draw_label(&self, frame: &mut Frame, label: &str) -> Result<(), PipelineError> {
        let mut mat = frame_to_mat(frame)?;
        for (color, thickness) in [
            (Scalar::new(128.0, 128.0, 128.0, 128.0), 3),
            (Scalar::new(255.0, 255.0, 255.0, 128.0), 1),
        ] {
            imgproc::put_text(
                &mut mat,
                label,
                Point::new(10, 30),
                imgproc::FONT_HERSHEY_PLAIN,
                1.5,
                color,
                thickness,
                imgproc::LINE_8,
                false,
            )
            .map_err(cv_err)?;
        }
        *frame = mat_to_frame(&mat)?;
        Ok(())
    }
}
