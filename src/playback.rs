//! Serial playback queue.
//!
//! A single worker thread drains an unbounded FIFO of file paths and plays
//! them one at a time: Idle → Loading → Playing → Idle, with Draining when
//! shutdown arrives mid-playback. Errors on one item never stop the worker.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PlaybackError;

/// How long the worker waits for an item before re-checking shutdown.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How often a playing item is checked for completion.
const PLAYBACK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Audio output used by the worker. Only ever touched from the worker thread.
pub trait PlaybackBackend {
    fn is_initialized(&self) -> bool;
    fn init(&mut self) -> Result<(), PlaybackError>;
    /// Start playing `path`; returns once playback has begun.
    fn play(&mut self, path: &Path) -> Result<(), PlaybackError>;
    fn is_busy(&self) -> bool;
    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Loading,
    Playing,
    Draining,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Loading => write!(f, "LOADING"),
            Self::Playing => write!(f, "PLAYING"),
            Self::Draining => write!(f, "DRAINING"),
        }
    }
}

/// Producer handle for the playback FIFO. Cheap to clone.
#[derive(Clone)]
pub struct PlaybackQueue {
    tx: Sender<PathBuf>,
}

impl PlaybackQueue {
    /// Create a queue and the receiver to hand to [`PlaybackWorker::spawn`].
    pub fn channel() -> (Self, Receiver<PathBuf>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    /// Append a file for playback. Never blocks.
    pub fn enqueue(&self, path: PathBuf) {
        info!("Queued for playback: {}", path.display());
        if self.tx.send(path).is_err() {
            warn!("Playback worker is gone, dropping item");
        }
    }
}

pub struct PlaybackWorker {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl PlaybackWorker {
    /// Start the worker thread.
    ///
    /// `make_backend` runs on the worker thread, so the backend itself does
    /// not need to be `Send`.
    pub fn spawn<B, F>(
        rx: Receiver<PathBuf>,
        make_backend: F,
        shutdown: CancellationToken,
    ) -> io::Result<Self>
    where
        B: PlaybackBackend,
        F: FnOnce() -> B + Send + 'static,
    {
        let token = shutdown.clone();
        let handle = thread::Builder::new()
            .name("playback".into())
            .spawn(move || {
                let mut backend = make_backend();
                run_worker(&rx, &mut backend, &token);
            })?;
        Ok(Self { handle, shutdown })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal shutdown and wait for the thread to exit. Queued items are dropped.
    pub fn shutdown(self) {
        self.shutdown.cancel();
        if self.handle.join().is_err() {
            error!("Playback worker panicked");
        }
    }
}

fn set_state(state: &mut WorkerState, next: WorkerState) {
    if *state != next {
        debug!("Playback: {state} → {next}");
        *state = next;
    }
}

fn run_worker<B: PlaybackBackend>(
    rx: &Receiver<PathBuf>,
    backend: &mut B,
    shutdown: &CancellationToken,
) {
    info!("Playback worker started");
    let mut state = WorkerState::Idle;

    while !shutdown.is_cancelled() {
        let path = match rx.recv_timeout(QUEUE_POLL_INTERVAL) {
            Ok(path) => path,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                info!("Playback queue closed");
                break;
            }
        };

        if let Err(e) = play_one(backend, &path, shutdown, &mut state) {
            error!("Playback error: {e}");
        }
        set_state(&mut state, WorkerState::Idle);
    }

    if backend.is_busy() {
        backend.stop();
    }
    info!("Playback worker stopped");
}

fn play_one<B: PlaybackBackend>(
    backend: &mut B,
    path: &Path,
    shutdown: &CancellationToken,
    state: &mut WorkerState,
) -> Result<(), PlaybackError> {
    if !path.is_file() {
        return Err(PlaybackError::MissingFile(path.to_path_buf()));
    }

    set_state(state, WorkerState::Loading);
    if !backend.is_initialized() {
        backend.init()?;
        info!("Audio output initialized by worker");
    }

    info!("Playing: {}", path.display());
    backend.play(path)?;
    set_state(state, WorkerState::Playing);

    while backend.is_busy() {
        if shutdown.is_cancelled() {
            set_state(state, WorkerState::Draining);
            backend.stop();
            info!("Playback stopped by shutdown signal");
            return Ok(());
        }
        thread::sleep(PLAYBACK_POLL_INTERVAL);
    }

    info!("Finished playing: {}", path.display());
    Ok(())
}

/// Default output device via rodio. The stream is opened on first use.
#[derive(Default)]
pub struct RodioBackend {
    stream: Option<OutputStream>,
    sink: Option<Sink>,
}

impl PlaybackBackend for RodioBackend {
    fn is_initialized(&self) -> bool {
        self.stream.is_some()
    }

    fn init(&mut self) -> Result<(), PlaybackError> {
        let stream = OutputStreamBuilder::open_default_stream()
            .map_err(|e| PlaybackError::Init(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn play(&mut self, path: &Path) -> Result<(), PlaybackError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| PlaybackError::Init("audio output not initialized".into()))?;

        let play_err = |reason: String| PlaybackError::Play {
            path: path.to_path_buf(),
            reason,
        };
        let file = File::open(path).map_err(|e| play_err(e.to_string()))?;
        let source = Decoder::new(BufReader::new(file)).map_err(|e| play_err(e.to_string()))?;

        // rodio 0.21: Sink::connect_new takes &Mixer
        let sink = Sink::connect_new(stream.mixer());
        sink.append(source);
        self.sink = Some(sink);
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.sink.as_ref().is_some_and(|s| !s.empty())
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }
}
