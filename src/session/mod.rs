//! Live narration session
//!
//! [`SessionManager`] owns one connection to the narration service together
//! with the microphone, the output timeline and the frame cadence. All of it
//! is driven from [`SessionManager::next_event`], which merges the inbound
//! transport events, playback completions, capture blocks and frame ticks on
//! a single task so state changes happen in delivery order. Snapshots are
//! taken on the blocking pool and come back through the same loop.
//!
//! ```text
//! microphone ─▶ capture blocks ─▶ PCM16 ──────────┐
//! frame source ─▶ JPEG every interval ────────────┤
//!                                                 ▼
//!                                            Transport ◀──▶ narration service
//!                                                 │
//!            ┌──────────── Interrupted ───────────┤
//!            ▼                                    ▼ AudioReceived
//!    InterruptionHandler ──▶ PlaybackScheduler ◀── Decoder
//!                                  │
//!                                  ▼
//!                            output timeline
//! ```

pub mod decoder;
pub mod interruption;
pub mod live;
pub mod protocol;
pub mod scheduler;
pub mod transport;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Interval, MissedTickBehavior};

pub use decoder::decode;
pub use interruption::InterruptionHandler;
pub use live::LiveTransport;
pub use scheduler::{PlaybackScheduler, ScheduledUnit};
pub use transport::{MediaInput, Transport, TransportEvent};

use crate::audio::{AudioBackend, AudioChunk, AudioInput, DeviceState, OutputDevice, UnitId};
use crate::config::{AudioConfig, Config, SessionConfig};
use crate::frame::FrameSource;
use crate::{Error, Result};

/// Lifecycle of the narration session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No connection
    Closed,
    /// Connection requested, waiting for the service to accept the setup
    Opening,
    /// Streaming in both directions
    Open,
    /// Ended by a fatal error; a fresh `connect()` is required
    Failed(String),
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Opening => write!(f, "opening"),
            Self::Open => write!(f, "open"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Notification for whoever drives the session
#[derive(Debug, Clone, PartialEq)]
pub enum NarratorEvent {
    /// The service accepted the session; capture and frames are flowing
    Opened,
    /// Text the narrator produced alongside its speech
    Text(String),
    /// A speech fragment was placed on the output timeline
    Speech {
        /// Start time in the output device's clock
        start_time: f64,
        /// Length in seconds
        duration: f64,
    },
    /// The narrator cut itself off; queued speech was discarded
    Interrupted {
        /// Fragments that were stopped
        stopped: usize,
    },
    /// The narrator finished its turn
    TurnComplete,
    /// The service closed the session
    Closed(Option<String>),
    /// The session failed and has been torn down
    Error(String),
}

/// What woke the session loop
enum Wakeup {
    Inbound(Option<TransportEvent>),
    Finished(Option<UnitId>),
    Captured(Option<AudioChunk>),
    FrameDue,
    FrameReady(std::result::Result<Snapshot, JoinError>),
}

/// A frame source handed back with the snapshot it took
type Snapshot = (Box<dyn FrameSource>, Result<Option<String>>);

/// Resources held while connected
#[derive(Default)]
struct Session {
    input: Option<Box<dyn AudioInput>>,
    output: Option<Box<dyn OutputDevice>>,
    inbound: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    finished: Option<mpsc::UnboundedReceiver<UnitId>>,
    captured: Option<mpsc::UnboundedReceiver<AudioChunk>>,
    frame_timer: Option<Interval>,
    /// Snapshot being taken on the blocking pool
    snapshot: Option<JoinHandle<Snapshot>>,
    scheduler: PlaybackScheduler,
    interruptions: InterruptionHandler,
}

impl Session {
    /// Wait for the next thing to happen, inbound events first
    async fn wait(&mut self) -> Wakeup {
        tokio::select! {
            biased;
            event = recv(self.inbound.as_mut()) => Wakeup::Inbound(event),
            id = recv(self.finished.as_mut()) => Wakeup::Finished(id),
            chunk = recv(self.captured.as_mut()) => Wakeup::Captured(chunk),
            taken = join(self.snapshot.as_mut()) => Wakeup::FrameReady(taken),
            () = tick(self.frame_timer.as_mut()) => Wakeup::FrameDue,
        }
    }
}

async fn recv<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn join<T>(task: Option<&mut JoinHandle<T>>) -> std::result::Result<T, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Owns and drives one narration session
pub struct SessionManager<B, T> {
    backend: B,
    transport: T,
    frames: Option<Box<dyn FrameSource>>,
    session_config: SessionConfig,
    audio: AudioConfig,
    frame_interval: Duration,
    state: SessionState,
    session: Session,
}

impl<B: AudioBackend, T: Transport> SessionManager<B, T> {
    /// Create a manager; nothing is acquired until [`Self::connect`]
    #[must_use]
    pub fn new(config: &Config, backend: B, transport: T) -> Self {
        Self {
            backend,
            transport,
            frames: None,
            session_config: config.session.clone(),
            audio: config.audio,
            frame_interval: config.frames.interval,
            state: SessionState::Closed,
            session: Session::default(),
        }
    }

    /// Send snapshots from `source` on the frame cadence while open
    #[must_use]
    pub fn with_frame_source(mut self, source: impl FrameSource + 'static) -> Self {
        self.frames = Some(Box::new(source));
        self
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    /// Check if the session is streaming
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Playback timeline of the current session
    #[must_use]
    pub const fn scheduler(&self) -> &PlaybackScheduler {
        &self.session.scheduler
    }

    /// Interruptions handled in the current session
    #[must_use]
    pub const fn interruptions(&self) -> u64 {
        self.session.interruptions.count()
    }

    /// The transport in use
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Acquire devices and open the connection
    ///
    /// Returns once the connection is established; capture and frames start
    /// when the service confirms the session (see [`NarratorEvent::Opened`]).
    /// Calling this while already opening or open does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Acquisition`] if the microphone or output device is
    /// unavailable, or [`Error::Connection`] if the service is unreachable.
    /// Everything acquired so far is released and the state becomes
    /// [`SessionState::Failed`].
    #[allow(clippy::future_not_send)]
    pub async fn connect(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Opening | SessionState::Open) {
            tracing::debug!(state = %self.state, "session already active");
            return Ok(());
        }

        self.release().await;
        self.state = SessionState::Opening;

        if let Err(e) = self.acquire().await {
            tracing::error!(error = %e, "failed to start narration session");
            self.release().await;
            self.state = SessionState::Failed(e.to_string());
            return Err(e);
        }

        Ok(())
    }

    #[allow(clippy::future_not_send)]
    async fn acquire(&mut self) -> Result<()> {
        let input = self
            .backend
            .open_input(self.audio.input_sample_rate, self.audio.block_size)
            .map_err(acquisition)?;
        self.session.input = Some(input);

        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let output = self
            .backend
            .open_output(self.audio.output_sample_rate, finished_tx)
            .map_err(acquisition)?;
        self.session.finished = Some(finished_rx);
        let output = self.session.output.insert(output);

        if output.state() == DeviceState::Suspended {
            output.resume().await.map_err(acquisition)?;
        }

        let inbound = self
            .transport
            .open(&self.session_config)
            .await
            .map_err(connection)?;
        self.session.inbound = Some(inbound);

        tracing::debug!("waiting for narration service to accept session");
        Ok(())
    }

    /// Process session activity until something worth reporting happens
    ///
    /// Returns `None` once the session is no longer opening or open. Dropping
    /// the future between events is safe; dropping it mid-decode loses that
    /// audio fragment.
    #[allow(clippy::future_not_send)]
    pub async fn next_event(&mut self) -> Option<NarratorEvent> {
        loop {
            if !matches!(self.state, SessionState::Opening | SessionState::Open) {
                return None;
            }

            let wakeup = self.session.wait().await;
            if let Some(event) = self.dispatch(wakeup).await {
                return Some(event);
            }
        }
    }

    #[allow(clippy::future_not_send)]
    async fn dispatch(&mut self, wakeup: Wakeup) -> Option<NarratorEvent> {
        match wakeup {
            Wakeup::Inbound(Some(event)) => self.handle_transport_event(event).await,
            Wakeup::Inbound(None) => {
                self.handle_transport_event(TransportEvent::Closed(None))
                    .await
            }
            Wakeup::Finished(Some(id)) => {
                if self.session.scheduler.complete(id) {
                    tracing::trace!(unit = %id, "playback unit finished");
                }
                None
            }
            Wakeup::Finished(None) => {
                self.session.finished = None;
                None
            }
            Wakeup::Captured(Some(chunk)) => {
                self.send_realtime_audio(&chunk);
                None
            }
            Wakeup::Captured(None) => {
                tracing::warn!("audio capture stopped delivering blocks");
                self.session.captured = None;
                None
            }
            Wakeup::FrameDue => {
                self.take_snapshot();
                None
            }
            Wakeup::FrameReady(taken) => {
                self.session.snapshot = None;
                self.on_snapshot(taken).await
            }
        }
    }

    /// Apply one event from the transport
    ///
    /// Events must be applied in the order the service sent them; the
    /// playback timeline depends on it.
    #[allow(clippy::future_not_send)]
    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Option<NarratorEvent> {
        match event {
            TransportEvent::Opened => self.on_opened().await,
            TransportEvent::AudioReceived { data, sample_rate } => {
                self.on_audio(&data, sample_rate).await
            }
            TransportEvent::Text(text) => Some(NarratorEvent::Text(text)),
            TransportEvent::Interrupted => self.on_interrupted(),
            TransportEvent::TurnComplete => {
                tracing::debug!("narrator turn complete");
                Some(NarratorEvent::TurnComplete)
            }
            TransportEvent::Closed(reason) => {
                tracing::info!(reason = ?reason, "narration session closed by service");
                self.release().await;
                self.state = SessionState::Closed;
                Some(NarratorEvent::Closed(reason))
            }
            TransportEvent::ErrorOccurred(message) => {
                Some(self.fail(Error::Connection(message)).await)
            }
        }
    }

    #[allow(clippy::future_not_send)]
    async fn on_opened(&mut self) -> Option<NarratorEvent> {
        if self.state != SessionState::Opening {
            tracing::debug!(state = %self.state, "ignoring unexpected session open");
            return None;
        }

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let started = self
            .session
            .input
            .as_mut()
            .ok_or_else(|| Error::Acquisition("microphone was released".to_string()))
            .and_then(|input| input.start(chunk_tx).map_err(acquisition));
        if let Err(e) = started {
            return Some(self.fail(e).await);
        }
        self.session.captured = Some(chunk_rx);

        if self.frames.is_some() {
            // First tick fires immediately, so a frame goes out on open
            let mut timer = tokio::time::interval(self.frame_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.session.frame_timer = Some(timer);
        }

        self.state = SessionState::Open;
        tracing::info!(
            model = %self.session_config.model,
            voice = %self.session_config.voice,
            "narration session open"
        );
        Some(NarratorEvent::Opened)
    }

    #[allow(clippy::future_not_send)]
    async fn on_audio(&mut self, data: &str, sample_rate: Option<u32>) -> Option<NarratorEvent> {
        if self.state != SessionState::Open {
            tracing::debug!(state = %self.state, "ignoring audio outside an open session");
            return None;
        }

        let sample_rate = sample_rate.unwrap_or(self.audio.output_sample_rate);
        let output = self.session.output.as_deref_mut()?;

        let scheduled = decode(data, sample_rate, &mut *output)
            .await
            .and_then(|buffer| self.session.scheduler.enqueue(&buffer, output));

        match scheduled {
            Ok(unit) => Some(NarratorEvent::Speech {
                start_time: unit.start_time,
                duration: unit.duration,
            }),
            Err(e) => self.recover(e, "audio chunk").await,
        }
    }

    /// Drop the offending chunk or snapshot, or end the session if the error
    /// is fatal
    #[allow(clippy::future_not_send)]
    async fn recover(&mut self, error: Error, dropped: &str) -> Option<NarratorEvent> {
        if error.is_fatal() {
            return Some(self.fail(error).await);
        }
        tracing::warn!(error = %error, "dropping {dropped}");
        None
    }

    fn on_interrupted(&mut self) -> Option<NarratorEvent> {
        let output = self.session.output.as_deref_mut()?;
        let stopped = self
            .session
            .interruptions
            .flush(&mut self.session.scheduler, output);
        Some(NarratorEvent::Interrupted { stopped })
    }

    #[allow(clippy::future_not_send)]
    async fn fail(&mut self, error: Error) -> NarratorEvent {
        tracing::error!(error = %error, "narration session failed");
        self.release().await;
        let message = error.to_string();
        self.state = SessionState::Failed(message.clone());
        NarratorEvent::Error(message)
    }

    /// Send one JPEG snapshot if the session is open
    ///
    /// Does nothing in any other state.
    pub fn send_video_frame(&self, jpeg_base64: String) {
        if self.state != SessionState::Open {
            tracing::trace!(state = %self.state, "not open, dropping video frame");
            return;
        }

        if let Err(e) = self.transport.send_media(MediaInput::jpeg(jpeg_base64)) {
            tracing::warn!(error = %e, "failed to send video frame");
        }
    }

    fn send_realtime_audio(&self, chunk: &AudioChunk) {
        if self.state != SessionState::Open {
            return;
        }

        let media = MediaInput::audio(&chunk.samples, chunk.sample_rate);
        if let Err(e) = self.transport.send_media(media) {
            tracing::debug!(error = %e, "failed to send audio chunk");
        }
    }

    /// Start a snapshot on the blocking pool
    ///
    /// A tick that lands while the previous snapshot is still running is
    /// skipped.
    fn take_snapshot(&mut self) {
        if self.session.snapshot.is_some() {
            tracing::debug!("previous frame still encoding, skipping tick");
            return;
        }
        let Some(mut source) = self.frames.take() else {
            return;
        };

        self.session.snapshot = Some(tokio::task::spawn_blocking(move || {
            let frame = source.snapshot();
            (source, frame)
        }));
    }

    #[allow(clippy::future_not_send)]
    async fn on_snapshot(
        &mut self,
        taken: std::result::Result<Snapshot, JoinError>,
    ) -> Option<NarratorEvent> {
        let (source, frame) = match taken {
            Ok(taken) => taken,
            Err(e) => {
                tracing::error!(error = %e, "frame source panicked, no more frames");
                self.session.frame_timer = None;
                return None;
            }
        };
        self.frames = Some(source);

        match frame {
            Ok(Some(jpeg)) => {
                self.send_video_frame(jpeg);
                None
            }
            Ok(None) => None,
            Err(e) => self.recover(e, "video frame").await,
        }
    }

    /// Tear down the session
    ///
    /// Stops capture and playback, closes the output device and the
    /// connection. Safe to call repeatedly and from any state.
    #[allow(clippy::future_not_send)]
    pub async fn disconnect(&mut self) {
        let was = std::mem::replace(&mut self.state, SessionState::Closed);
        self.release().await;

        if was != SessionState::Closed {
            tracing::info!(from = %was, "narration session disconnected");
        }
    }

    /// Release everything a session may hold
    #[allow(clippy::future_not_send)]
    async fn release(&mut self) {
        let mut session = std::mem::take(&mut self.session);
        session.frame_timer = None;

        // Take the frame source back from an unfinished snapshot
        if let Some(task) = session.snapshot.take()
            && let Ok((source, _)) = task.await
        {
            self.frames = Some(source);
        }

        if let Some(mut input) = session.input.take() {
            input.stop();
        }

        if let Some(mut output) = session.output.take() {
            let stopped = session.scheduler.reset(output.as_mut());
            if stopped > 0 {
                tracing::debug!(stopped, "stopped queued playback");
            }
            if let Err(e) = output.close().await {
                tracing::warn!(error = %e, "failed to close output device");
            }
        }

        self.transport.close().await;
    }
}

fn acquisition(error: Error) -> Error {
    match error {
        Error::Acquisition(_) => error,
        other => Error::Acquisition(other.to_string()),
    }
}

fn connection(error: Error) -> Error {
    match error {
        Error::Connection(_) => error,
        other => Error::Connection(other.to_string()),
    }
}
