use serde::Serialize;
use std::time::Duration;

/// A finalized chunk file.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ChunkInfo {
    pub chunk: String,
    pub timestamp: String,
    pub duration: Duration,
}

impl ChunkInfo {
    pub fn new(chunk: String, timestamp: String, duration: Duration) -> ChunkInfo {
        ChunkInfo { chunk, timestamp, duration }
    }
}

/// Health transitions reported by capture sessions, once per transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Up { source: String, at: i64 },
    Down { source: String, at: i64 },
}

impl StreamEvent {
    pub fn source(&self) -> &str {
        match self {
            StreamEvent::Up { source, .. } | StreamEvent::Down { source, .. } => source,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct SourceStatus {
    pub name: String,
    pub capturing: bool,
    pub healthy: bool,
    pub chunks_finalized: u64,
    pub last_chunk: Option<String>,
    /// Down transitions seen by the hub since startup.
    pub outages: u64,
}
