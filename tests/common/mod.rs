//! Shared test utilities
//!
//! A fake audio backend with a hand-driven clock and a scripted transport,
//! so sessions can run without hardware or network.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use live_narrator::audio::{
    AudioBackend, AudioBuffer, AudioChunk, AudioInput, DeviceState, OutputDevice, UnitId,
};
use live_narrator::config::SessionConfig;
use live_narrator::session::MediaInput;
use live_narrator::{Config, Error, NarratorEvent, Result, SessionManager, Transport, TransportEvent};

/// Everything the fake devices observed
#[derive(Default)]
pub struct Devices {
    /// Output clock in seconds
    pub now: f64,
    /// Output device reports suspended until resumed
    pub suspended: bool,
    pub resumed: u32,
    /// Refuse to open the microphone
    pub deny_microphone: bool,
    pub input_opened: bool,
    pub input_running: bool,
    pub input_stopped: bool,
    pub output_opened: bool,
    pub output_closed: bool,
    /// Fail every unit start as a broken output stream would
    pub refuse_units: bool,
    /// `(id, start, duration)` for every started unit
    pub started: Vec<(UnitId, f64, f64)>,
    pub stopped: Vec<UnitId>,
    chunks: Option<mpsc::UnboundedSender<AudioChunk>>,
    finished: Option<mpsc::UnboundedSender<UnitId>>,
}

/// Audio backend backed by shared, inspectable state
#[derive(Clone, Default)]
pub struct FakeBackend {
    devices: Arc<Mutex<Devices>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn devices(&self) -> MutexGuard<'_, Devices> {
        self.devices.lock().unwrap()
    }

    /// Move the output clock
    pub fn set_time(&self, now: f64) {
        self.devices().now = now;
    }

    /// Deliver a capture block as if the microphone produced it
    pub fn capture(&self, samples: Vec<f32>) {
        let devices = self.devices();
        let chunks = devices.chunks.as_ref().expect("microphone not started");
        chunks
            .send(AudioChunk {
                samples,
                sample_rate: 16_000,
            })
            .unwrap();
    }

    /// Report a unit as played to the end
    pub fn finish(&self, id: UnitId) {
        let devices = self.devices();
        devices.finished.as_ref().unwrap().send(id).unwrap();
    }
}

impl AudioBackend for FakeBackend {
    fn open_input(&self, sample_rate: u32, _block_size: usize) -> Result<Box<dyn AudioInput>> {
        let mut devices = self.devices();
        if devices.deny_microphone {
            return Err(Error::Acquisition("microphone permission denied".to_string()));
        }
        devices.input_opened = true;
        Ok(Box::new(FakeInput {
            devices: Arc::clone(&self.devices),
            sample_rate,
        }))
    }

    fn open_output(
        &self,
        _sample_rate: u32,
        finished: mpsc::UnboundedSender<UnitId>,
    ) -> Result<Box<dyn OutputDevice>> {
        let mut devices = self.devices();
        devices.output_opened = true;
        devices.finished = Some(finished);
        Ok(Box::new(FakeOutput {
            devices: Arc::clone(&self.devices),
            closed: false,
        }))
    }
}

struct FakeInput {
    devices: Arc<Mutex<Devices>>,
    sample_rate: u32,
}

impl AudioInput for FakeInput {
    fn start(&mut self, chunks: mpsc::UnboundedSender<AudioChunk>) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        devices.chunks = Some(chunks);
        devices.input_running = true;
        Ok(())
    }

    fn stop(&mut self) {
        let mut devices = self.devices.lock().unwrap();
        devices.chunks = None;
        devices.input_running = false;
        devices.input_stopped = true;
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

struct FakeOutput {
    devices: Arc<Mutex<Devices>>,
    closed: bool,
}

#[async_trait(?Send)]
impl OutputDevice for FakeOutput {
    fn state(&self) -> DeviceState {
        if self.closed {
            DeviceState::Closed
        } else if self.devices.lock().unwrap().suspended {
            DeviceState::Suspended
        } else {
            DeviceState::Running
        }
    }

    async fn resume(&mut self) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        devices.suspended = false;
        devices.resumed += 1;
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.devices.lock().unwrap().now
    }

    #[allow(clippy::cast_precision_loss)]
    async fn create_buffer(&mut self, samples: Vec<f32>, sample_rate: u32) -> Result<AudioBuffer> {
        Ok(AudioBuffer {
            duration: samples.len() as f64 / f64::from(sample_rate),
            frames: samples.into(),
        })
    }

    fn start(&mut self, id: UnitId, buffer: &AudioBuffer, when: f64) -> Result<()> {
        if self.closed {
            return Err(Error::Audio("output device closed".to_string()));
        }
        let mut devices = self.devices.lock().unwrap();
        if devices.refuse_units {
            return Err(Error::Audio("output stream broken".to_string()));
        }
        devices.started.push((id, when, buffer.duration));
        Ok(())
    }

    fn stop(&mut self, id: UnitId) {
        self.devices.lock().unwrap().stopped.push(id);
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.devices.lock().unwrap().output_closed = true;
        Ok(())
    }
}

/// What the scripted transport observed
#[derive(Default)]
pub struct Wire {
    /// Fail the next open with a connection error
    pub refuse: bool,
    pub opened: u32,
    pub closed: u32,
    pub setup: Option<SessionConfig>,
    pub sent: Vec<MediaInput>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

/// Transport whose inbound events are pushed by the test
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    wire: Arc<Mutex<Wire>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wire(&self) -> MutexGuard<'_, Wire> {
        self.wire.lock().unwrap()
    }

    /// Deliver an event as if the service sent it
    pub fn emit(&self, event: TransportEvent) {
        let wire = self.wire();
        wire.events
            .as_ref()
            .expect("transport not open")
            .send(event)
            .unwrap();
    }

    /// Deliver a PCM16 audio fragment at 24 kHz
    pub fn speak(&self, samples: &[f32]) {
        self.emit(TransportEvent::AudioReceived {
            data: MediaInput::audio(samples, 24_000).data,
            sample_rate: Some(24_000),
        });
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&mut self, config: &SessionConfig) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        let mut wire = self.wire.lock().unwrap();
        if wire.refuse {
            return Err(Error::Connection("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        wire.events = Some(tx);
        wire.opened += 1;
        wire.setup = Some(config.clone());
        Ok(rx)
    }

    fn send_media(&self, media: MediaInput) -> Result<()> {
        let mut wire = self.wire.lock().unwrap();
        if wire.events.is_none() {
            return Err(Error::Connection("not connected".to_string()));
        }
        wire.sent.push(media);
        Ok(())
    }

    async fn close(&mut self) {
        let mut wire = self.wire.lock().unwrap();
        if wire.events.take().is_some() {
            wire.closed += 1;
        }
    }
}

/// Silence lasting `seconds` at 24 kHz
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn speech(seconds: f64) -> Vec<f32> {
    vec![0.0; (seconds * 24_000.0).round() as usize]
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

pub type TestSession = SessionManager<FakeBackend, ScriptedTransport>;

/// A manager wired to fresh fakes
pub fn session() -> (TestSession, FakeBackend, ScriptedTransport) {
    let backend = FakeBackend::new();
    let transport = ScriptedTransport::new();
    let manager = SessionManager::new(&Config::default(), backend.clone(), transport.clone());
    (manager, backend, transport)
}

/// Connect and confirm the session so it is open
pub async fn open(manager: &mut TestSession, transport: &ScriptedTransport) {
    manager.connect().await.unwrap();
    transport.emit(TransportEvent::Opened);
    assert_eq!(manager.next_event().await, Some(NarratorEvent::Opened));
}

/// Let the session loop run briefly when nothing reportable is expected
pub async fn pump(manager: &mut TestSession) -> Option<NarratorEvent> {
    run_for(manager, 50).await
}

/// Run the session loop for `ms` milliseconds or until it reports something
pub async fn run_for(manager: &mut TestSession, ms: u64) -> Option<NarratorEvent> {
    tokio::time::timeout(Duration::from_millis(ms), manager.next_event())
        .await
        .ok()
        .flatten()
}
