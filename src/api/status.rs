//! Read-only HTTP status: `GET /status` lists every capture session.

use crate::dtos::messages::{ChunkInfo, SourceStatus, StreamEvent};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use log::{error, info};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;

/// Finalized chunks kept for the report.
pub const RECENT_CHUNKS: usize = 32;

#[derive(Default)]
struct Board {
    sources: BTreeMap<String, SourceStatus>,
    recent: VecDeque<ChunkInfo>,
}

/// Latest known state of every source, shared between the hub and the server.
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<Board>>,
}

impl StatusBoard {
    fn write(&self) -> RwLockWriteGuard<'_, Board> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, Board> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces a source's state; the outage count is owned by the board.
    pub fn update(&self, status: SourceStatus) {
        let mut board = self.write();
        let outages = board.sources.get(&status.name).map_or(0, |s| s.outages);
        board
            .sources
            .insert(status.name.clone(), SourceStatus { outages, ..status });
    }

    pub fn apply(&self, event: &StreamEvent) {
        let mut board = self.write();
        let entry = board
            .sources
            .entry(event.source().to_string())
            .or_insert_with(|| SourceStatus {
                name: event.source().to_string(),
                ..SourceStatus::default()
            });
        match event {
            StreamEvent::Up { .. } => entry.healthy = true,
            StreamEvent::Down { .. } => {
                entry.healthy = false;
                entry.outages += 1;
            }
        }
    }

    pub fn record_chunk(&self, info: ChunkInfo) {
        let mut board = self.write();
        if board.recent.len() == RECENT_CHUNKS {
            board.recent.pop_front();
        }
        board.recent.push_back(info);
    }

    pub fn snapshot(&self) -> Vec<SourceStatus> {
        self.read().sources.values().cloned().collect()
    }

    pub fn recent_chunks(&self) -> Vec<ChunkInfo> {
        self.read().recent.iter().cloned().collect()
    }
}

#[derive(Serialize, Debug, PartialEq)]
pub struct StatusReport {
    pub sources: Vec<SourceStatus>,
    pub recent_chunks: Vec<ChunkInfo>,
}

pub fn router(board: StatusBoard) -> Router {
    Router::new()
        .route("/status", get(status))
        .with_state(board)
}

async fn status(State(board): State<StatusBoard>) -> Json<StatusReport> {
    Json(StatusReport {
        sources: board.snapshot(),
        recent_chunks: board.recent_chunks(),
    })
}

/// The endpoint's own runtime thread.
pub struct StatusServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl StatusServer {
    pub fn start(listen: &str, board: StatusBoard) -> Result<StatusServer> {
        // bind up front so address errors surface at startup
        let listener = std::net::TcpListener::bind(listen)
            .with_context(|| format!("binding status endpoint to {listen}"))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .context("building status runtime")?;
        let (tx, rx) = oneshot::channel::<()>();

        let worker = thread::Builder::new()
            .name("status-http".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            error!("status endpoint: {e}");
                            return;
                        }
                    };
                    let shutdown = async {
                        let _ = rx.await;
                    };
                    if let Err(e) = axum::serve(listener, router(board))
                        .with_graceful_shutdown(shutdown)
                        .await
                    {
                        error!("status endpoint stopped: {e}");
                    }
                });
            })?;

        info!("status endpoint listening on http://{addr}/status");
        Ok(StatusServer {
            addr,
            shutdown: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("status endpoint thread panicked");
            }
        }
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        self.stop();
    }
}
