//! Host-facing stream surface
//!
//! `BluetoothStream` is what an audio framework plugs into: it tracks the
//! application pointer, runs the prepare/start/stop lifecycle, moves PCM
//! through the pipeline, and reports the synthesized hardware pointer and
//! delay. Closing parks the session in the registry for a short grace
//! period instead of tearing the negotiated stream down.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::clock::{AudioClock, ClockEvent, ClockParams, ClockShared};
use crate::codec::sbc::SbcCodec;
use crate::config::StreamConfig;
use crate::constants::TICK_CHANNEL_CAPACITY;
use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::ipc::ControlChannel;
use crate::pipeline::Pipeline;
use crate::registry::SessionRegistry;
use crate::session::{HardwareLimits, Session, StreamState};
use crate::transport::{Direction, TransportKind, TransportPreference};

/// Hardware parameters the host framework settled on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwParams {
    pub rate: u32,
    pub channels: usize,
    /// Period size in frames
    pub period_size: u64,
    pub periods: u32,
    /// Frames queued before a prepared playback stream starts on its own;
    /// zero starts on the first write
    pub start_threshold: u64,
}

impl HwParams {
    pub fn buffer_size(&self) -> u64 {
        self.period_size * self.periods as u64
    }
}

/// Stream lifecycle state as the host framework sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmState {
    /// Opened, parameters not applied yet
    Open,
    /// Parameters applied, waiting for prepare
    Setup,
    Prepared,
    Running,
    /// Underrun or negative delay; prepare recovers
    XRun,
    /// Data channel died; only close is useful now
    Disconnected,
}

pub struct BluetoothStream {
    config: StreamConfig,
    direction: Direction,
    registry: Option<SessionRegistry>,
    /// Held until the first negotiation builds the pipeline
    codec: Option<Box<dyn SbcCodec>>,
    session: Option<Session>,
    pipeline: Option<Pipeline>,
    hw: Option<HwParams>,
    shared: Arc<ClockShared>,
    clock: Option<AudioClock>,
    tick_tx: Sender<ClockEvent>,
    tick_rx: Receiver<ClockEvent>,
    state: PcmState,
    appl_ptr: u64,
    frame_bytes: usize,
}

impl BluetoothStream {
    /// Open a stream towards the configured remote, reclaiming a parked
    /// session when one matches.
    pub fn open(
        config: StreamConfig,
        direction: Direction,
        registry: Option<SessionRegistry>,
        codec: Option<Box<dyn SbcCodec>>,
    ) -> Result<Self> {
        let session = match reclaim(registry.as_ref(), &config) {
            Some(session) => session,
            None => Session::connect(config.clone(), direction)?,
        };
        Ok(Self::assemble(config, direction, registry, codec, session))
    }

    /// Open over a caller-supplied control channel (tests, alternate
    /// service transports).
    pub fn open_with_channel(
        config: StreamConfig,
        direction: Direction,
        channel: Box<dyn ControlChannel>,
        registry: Option<SessionRegistry>,
        codec: Option<Box<dyn SbcCodec>>,
    ) -> Result<Self> {
        let session = match reclaim(registry.as_ref(), &config) {
            Some(session) => session,
            None => Session::with_channel(channel, config.clone(), direction)?,
        };
        Ok(Self::assemble(config, direction, registry, codec, session))
    }

    fn assemble(
        config: StreamConfig,
        direction: Direction,
        registry: Option<SessionRegistry>,
        codec: Option<Box<dyn SbcCodec>>,
        session: Session,
    ) -> Self {
        let (tick_tx, tick_rx) = crossbeam_channel::bounded(TICK_CHANNEL_CAPACITY);
        Self {
            config,
            direction,
            registry,
            codec,
            session: Some(session),
            pipeline: None,
            hw: None,
            shared: ClockShared::new(),
            clock: None,
            tick_tx,
            tick_rx,
            state: PcmState::Open,
            appl_ptr: 0,
            frame_bytes: 0,
        }
    }

    pub fn state(&self) -> PcmState {
        self.state
    }

    pub fn transport(&self) -> TransportKind {
        self.session
            .as_ref()
            .map(Session::transport)
            .unwrap_or(TransportKind::Voice)
    }

    /// Parameter ranges to advertise to the host framework.
    pub fn hardware_limits(&self) -> Option<HardwareLimits> {
        self.session.as_ref().map(Session::hardware_limits)
    }

    /// Negotiate the stream for the given parameters and size the
    /// pipeline. Idempotent for unchanged parameters.
    pub fn hw_params(&mut self, hw: HwParams) -> Result<()> {
        if hw.rate == 0 || hw.channels == 0 || hw.period_size == 0 || hw.periods == 0 {
            return Err(Error::Config(crate::error::ConfigError::InvalidValue {
                key: "hw_params",
                reason: "rate, channels, period_size and periods must be non-zero".into(),
            }));
        }
        let session = self.session.as_mut().ok_or_else(session_gone)?;
        let negotiated = session.negotiate(hw.rate, hw.channels)?;

        // Pull the codec back out of a previous pipeline on renegotiation.
        let codec = self
            .codec
            .take()
            .or_else(|| self.pipeline.take().and_then(Pipeline::into_codec));
        self.pipeline = Some(Pipeline::new(
            &negotiated,
            self.direction,
            codec,
            self.config.overrun,
        )?);
        self.frame_bytes = hw.channels * 2;
        self.hw = Some(hw);
        self.state = PcmState::Setup;
        Ok(())
    }

    /// Bring the stream to the prepared state: pointers reset, data
    /// channel live, clock parked until start.
    pub fn prepare(&mut self) -> Result<()> {
        // The clock polls the control socket; it must be gone before any
        // request/response traffic below.
        self.stop_clock();

        let hw = self.hw.ok_or_else(params_missing)?;
        let session = self.session.as_mut().ok_or_else(session_gone)?;

        if let Err(e) = session.start(hw.periods) {
            if !matches!(&e, Error::Protocol(p) if p.is_endpoint_closed()) {
                return Err(e);
            }
            // The remote dropped the endpoint; the session fell back to
            // Closed, so this renegotiation redoes the whole OPEN path.
            session.negotiate(hw.rate, hw.channels)?;
            session.start(hw.periods)?;
        }

        self.appl_ptr = 0;
        // Some frameworks refuse to start capture from a zero pointer;
        // priming it by one period sidesteps that.
        let initial = match self.direction {
            Direction::Playback => 0,
            Direction::Capture => hw.period_size,
        };
        self.shared.set_hw_ptr(initial);
        self.shared.set_stopped(true);
        self.shared.set_sink_delay(
            self.session
                .as_ref()
                .map(|s| s.sink_delay() as u32)
                .unwrap_or(0),
        );

        if self.direction == Direction::Playback {
            self.spawn_clock(&hw)?;
        }

        self.state = PcmState::Prepared;
        // Already-started sessions skip the control exchange entirely, but
        // the framework still expects a readiness edge after prepare.
        let _ = self.tick_tx.try_send(ClockEvent::Tick);
        Ok(())
    }

    fn spawn_clock(&mut self, hw: &HwParams) -> Result<()> {
        let session = self.session.as_ref().ok_or_else(session_gone)?;
        let data = session
            .data()
            .ok_or(Error::Transport(TransportError::Disconnected))?
            .try_clone()?;
        let poller = session.delay_poller()?;
        let negotiated_rate = session
            .negotiated()
            .map(|n| n.rate)
            .unwrap_or(hw.rate);
        self.clock = Some(AudioClock::spawn(
            ClockParams {
                period_size: hw.period_size,
                rate: negotiated_rate,
            },
            Arc::clone(&self.shared),
            data,
            poller,
            self.tick_tx.clone(),
        )?);
        Ok(())
    }

    fn stop_clock(&mut self) {
        if let Some(mut clock) = self.clock.take() {
            clock.stop();
        }
    }

    /// Let the pointer run.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            PcmState::Prepared => {
                // Time spent prepared must not count as elapsed audio.
                self.shared.request_reset();
                self.shared.set_stopped(false);
                self.state = PcmState::Running;
                Ok(())
            }
            PcmState::Running => Ok(()),
            other => Err(bad_state("start", other)),
        }
    }

    /// Freeze the pointer; the stream stays prepared.
    pub fn stop(&mut self) -> Result<()> {
        self.shared.set_stopped(true);
        if self.state == PcmState::Running {
            self.state = PcmState::Prepared;
        }
        Ok(())
    }

    /// Synthesized hardware pointer in frames since prepare.
    pub fn pointer(&mut self) -> Result<u64> {
        self.check_disconnect()?;
        if self.state == PcmState::XRun {
            return Err(Error::Transport(TransportError::Underrun));
        }
        let hw = self.shared.hw_ptr();
        if self.direction == Direction::Playback
            && self.state == PcmState::Running
            && hw > self.appl_ptr
        {
            self.xrun();
            return Err(Error::Transport(TransportError::Underrun));
        }
        Ok(hw)
    }

    /// Frames between the application and the remote sink, including the
    /// reported sink latency.
    pub fn delay(&mut self) -> Result<i64> {
        self.check_disconnect()?;
        let hw = self.shared.hw_ptr() as i64;
        let appl = self.appl_ptr as i64;
        let rate = self.hw.map(|h| h.rate).unwrap_or(0) as i64;
        // Sink delay arrives in 0.1 ms units.
        let sink = self.shared.sink_delay() as i64 * rate / 10_000;
        let queued = match self.direction {
            Direction::Playback => appl - hw,
            Direction::Capture => hw - appl,
        };
        let total = queued + sink;
        if self.state == PcmState::Running && total < 0 {
            self.xrun();
            return Ok(0);
        }
        Ok(total)
    }

    /// Write interleaved PCM frames; returns frames accepted.
    pub fn writei(&mut self, pcm: &[u8]) -> Result<u64> {
        if self.direction != Direction::Playback {
            return Err(bad_state("writei", self.state));
        }
        self.check_disconnect()?;
        match self.state {
            PcmState::Prepared | PcmState::Running => {}
            other => return Err(bad_state("writei", other)),
        }
        if self.state == PcmState::Running && self.shared.hw_ptr() > self.appl_ptr {
            self.xrun();
            return Err(Error::Transport(TransportError::Underrun));
        }

        let sock = self
            .session
            .as_ref()
            .and_then(Session::data)
            .ok_or(Error::Transport(TransportError::Disconnected))?;
        let pipeline = self.pipeline.as_mut().ok_or_else(params_missing)?;

        let consumed = pipeline.write(pcm, sock)?;
        let frames = (consumed / self.frame_bytes.max(1)) as u64;
        self.appl_ptr += frames;

        if self.state == PcmState::Prepared {
            let threshold = self.hw.map(|h| h.start_threshold).unwrap_or(0);
            if self.appl_ptr >= threshold {
                self.start()?;
            }
        }
        Ok(frames)
    }

    /// Read interleaved PCM frames; returns frames delivered.
    pub fn readi(&mut self, out: &mut [u8], nonblocking: bool) -> Result<u64> {
        if self.direction != Direction::Capture {
            return Err(bad_state("readi", self.state));
        }
        self.check_disconnect()?;
        match self.state {
            PcmState::Prepared => self.start()?,
            PcmState::Running => {}
            other => return Err(bad_state("readi", other)),
        }

        let link_mtu = self
            .session
            .as_ref()
            .and_then(Session::negotiated)
            .map(|n| n.link_mtu)
            .unwrap_or(0);
        let sock = self
            .session
            .as_mut()
            .and_then(Session::data_mut)
            .ok_or(Error::Transport(TransportError::Disconnected))?;
        let pipeline = self.pipeline.as_mut().ok_or_else(params_missing)?;

        let (copied, fresh) = pipeline.read(out, sock, nonblocking)?;
        if fresh {
            self.shared
                .advance_hw_ptr((link_mtu / self.frame_bytes.max(1)) as u64);
        }
        let frames = (copied / self.frame_bytes.max(1)) as u64;
        self.appl_ptr += frames;
        Ok(frames)
    }

    /// Channel the host framework polls for period ticks.
    pub fn readiness(&self) -> &Receiver<ClockEvent> {
        &self.tick_rx
    }

    /// Drain pending clock events; true when at least one period elapsed.
    pub fn poll_events(&mut self) -> Result<bool> {
        let mut ready = false;
        for event in self.tick_rx.try_iter() {
            match event {
                ClockEvent::Tick => ready = true,
                ClockEvent::Failed => {
                    self.state = PcmState::Disconnected;
                    return Err(Error::Transport(TransportError::Disconnected));
                }
            }
        }
        Ok(ready)
    }

    /// Stop the clock and hand the session to the registry; without a
    /// registry, or with nothing negotiated, tear down immediately.
    pub fn close(mut self) {
        self.stop_clock();
        let Some(session) = self.session.take() else {
            return;
        };
        match &self.registry {
            Some(registry) if session.state() >= StreamState::Configured => {
                registry.park(session)
            }
            _ => session.teardown(),
        }
    }

    fn check_disconnect(&mut self) -> Result<()> {
        if self.state == PcmState::Disconnected || self.shared.disconnected() {
            self.state = PcmState::Disconnected;
            return Err(Error::Transport(TransportError::Disconnected));
        }
        Ok(())
    }

    fn xrun(&mut self) {
        tracing::warn!(appl_ptr = self.appl_ptr, "underrun, stream stopped");
        self.shared.set_stopped(true);
        self.shared.request_reset();
        self.state = PcmState::XRun;
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ClockShared> {
        &self.shared
    }

    #[cfg(test)]
    pub(crate) fn appl_ptr(&self) -> u64 {
        self.appl_ptr
    }
}

impl Drop for BluetoothStream {
    fn drop(&mut self) {
        self.stop_clock();
        if let Some(session) = self.session.take() {
            session.teardown();
        }
    }
}

fn reclaim(registry: Option<&SessionRegistry>, config: &StreamConfig) -> Option<Session> {
    let registry = registry?;
    let kinds: &[TransportKind] = match config.profile {
        TransportPreference::Auto => &[TransportKind::Encoded, TransportKind::Voice],
        TransportPreference::Voice => &[TransportKind::Voice],
        TransportPreference::Encoded => &[TransportKind::Encoded],
    };
    kinds
        .iter()
        .find_map(|&kind| registry.claim(&config.device, kind))
}

fn session_gone() -> Error {
    Error::Protocol(ProtocolError::Socket("session already closed".into()))
}

fn params_missing() -> Error {
    Error::Config(crate::error::ConfigError::InvalidValue {
        key: "hw_params",
        reason: "parameters not applied".into(),
    })
}

fn bad_state(op: &str, state: PcmState) -> Error {
    Error::Protocol(ProtocolError::Socket(format!(
        "{op} invalid in state {state:?}"
    )))
}
