//! Chunk file naming.
//!
//! Every finished chunk lives at
//! `<record_dir>/<source>/<source>#<start>#<end><extension>` where both
//! timestamps use `YYYY-MM-DD HH:MM:SS`. The retention scan relies on being
//! able to read the start time back out of the name.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::path::{Path, PathBuf};

pub const FILENAME_DELIMITER: char = '#';
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats a unix second for file names and watermarks.
pub fn time_string(t: i64, use_localtime: bool) -> String {
    let Some(utc) = DateTime::from_timestamp(t, 0) else {
        return t.to_string();
    };
    if use_localtime {
        utc.with_timezone(&Local).format(TIME_FORMAT).to_string()
    } else {
        utc.format(TIME_FORMAT).to_string()
    }
}

fn to_timestamp(naive: &NaiveDateTime, use_localtime: bool) -> Option<i64> {
    if use_localtime {
        Local
            .from_local_datetime(naive)
            .earliest()
            .map(|dt| dt.timestamp())
    } else {
        Some(naive.and_utc().timestamp())
    }
}

/// The three parts of a recognized chunk file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkName {
    pub source: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Splits a chunk file name. Anything that is not exactly three
/// `#`-separated parts with readable timestamps is not a chunk.
pub fn parse_chunk_name(file_name: &str) -> Option<ChunkName> {
    let parts: Vec<&str> = file_name.split(FILENAME_DELIMITER).collect();
    if parts.len() != 3 {
        return None;
    }
    let start = NaiveDateTime::parse_from_str(parts[1], TIME_FORMAT).ok()?;
    // the end part still carries the extension
    let (end, _ext) = NaiveDateTime::parse_and_remainder(parts[2], TIME_FORMAT).ok()?;
    Some(ChunkName {
        source: parts[0].to_string(),
        start,
        end,
    })
}

/// Hands out chunk paths under one recording root.
#[derive(Debug, Clone)]
pub struct ChunkNamer {
    record_dir: PathBuf,
    use_localtime: bool,
}

impl ChunkNamer {
    pub fn new(record_dir: impl Into<PathBuf>, use_localtime: bool) -> ChunkNamer {
        ChunkNamer {
            record_dir: record_dir.into(),
            use_localtime,
        }
    }

    pub fn record_dir(&self) -> &Path {
        &self.record_dir
    }

    pub fn source_dir(&self, source: &str) -> PathBuf {
        self.record_dir.join(source)
    }

    pub fn record_file(&self, source: &str, extension: &str, start: i64, length_sec: u32) -> PathBuf {
        let end = start + i64::from(length_sec);
        let file_name = format!(
            "{source}{d}{}{d}{}{extension}",
            time_string(start, self.use_localtime),
            time_string(end, self.use_localtime),
            d = FILENAME_DELIMITER,
        );
        self.source_dir(source).join(file_name)
    }

    /// Reads `(source, start, end)` back out of a chunk file name as unix seconds.
    pub fn parse(&self, file_name: &str) -> Option<(String, i64, i64)> {
        let name = parse_chunk_name(file_name)?;
        let start = to_timestamp(&name.start, self.use_localtime)?;
        let end = to_timestamp(&name.end, self.use_localtime)?;
        Some((name.source, start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_file_layout() {
        let namer = ChunkNamer::new("/rec", false);
        let path = namer.record_file("front", ".avi", 0, 60);
        assert_eq!(
            path,
            PathBuf::from("/rec/front/front#1970-01-01 00:00:00#1970-01-01 00:01:00.avi")
        );
    }

    #[test]
    fn parse_back_utc() {
        let namer = ChunkNamer::new("/rec", false);
        let path = namer.record_file("yard", ".mkv", 1_700_000_125, 55);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(
            namer.parse(name),
            Some(("yard".to_string(), 1_700_000_125, 1_700_000_180))
        );
    }

    #[test]
    fn parse_back_localtime() {
        let namer = ChunkNamer::new("/rec", true);
        let path = namer.record_file("door", ".avi", 1_700_000_000, 30);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(
            namer.parse(name),
            Some(("door".to_string(), 1_700_000_000, 1_700_000_030))
        );
    }

    #[test]
    fn non_chunk_names() {
        assert!(parse_chunk_name("notes.txt").is_none());
        assert!(parse_chunk_name("a#b.avi").is_none());
        assert!(parse_chunk_name("a#b#c#d.avi").is_none());
        assert!(parse_chunk_name("cam#yesterday#today.avi").is_none());
    }

    #[test]
    fn chunk_name_without_extension() {
        let name = parse_chunk_name("cam#2024-03-01 10:00:00#2024-03-01 10:01:00").unwrap();
        assert_eq!(name.source, "cam");
        assert_eq!(name.end.format(TIME_FORMAT).to_string(), "2024-03-01 10:01:00");
    }
}
