pub mod capturer;
pub mod clock;
pub mod common;
#[cfg(feature = "opencv")]
pub mod cv;
pub mod frame;
pub mod glyphs;
pub mod hub;
pub mod imageops;
pub mod naming;
pub mod sink;
pub mod storage;
#[cfg(test)]
pub mod testing;
pub mod videorecorder;
pub mod videosource;
