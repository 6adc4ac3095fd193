//! Stream session and transport negotiation
//!
//! A `Session` owns the control channel for one remote endpoint and walks
//! it through OPEN, SET_CONFIGURATION and START_STREAM. States only move
//! forward; the single backward edge is the drop to `Closed` when the
//! remote reports the endpoint gone during start, which forces the next
//! attempt to redo OPEN from scratch.

use std::time::Duration;

use crate::codec::sbc::{
    blocks_to_bit, default_bitpool, rate_to_bit, subbands_to_bit, Allocation, ChannelMode,
    SbcParams,
};
use crate::config::StreamConfig;
use crate::constants::{MAX_BITPOOL, MIN_BITPOOL};
use crate::error::{ConfigError, Error, ProtocolError, Result};
use crate::ipc::message::{
    caps, CapabilityBlock, CodecCapabilities, CodecConfig, PcmCapabilities, SbcCapabilities,
    LOCK_READ, LOCK_WRITE,
};
use crate::ipc::{ControlChannel, DelayPoller, Indication, MessageName, Request, Response,
    ServiceClient};
use crate::transport::{DataSocket, Direction, TransportKind};

/// Negotiation progress for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    Closed,
    Opened,
    Configured,
    Started,
}

/// Everything the pipeline needs from a successful negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedConfig {
    pub kind: TransportKind,
    pub rate: u32,
    pub channels: usize,
    /// Transfer unit / packet ceiling in bytes
    pub link_mtu: usize,
    /// Present for the encoded transport only
    pub sbc: Option<SbcParams>,
}

/// Parameter ranges the remote endpoint can accept, for the host layer's
/// own constraint reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareLimits {
    pub rates: Vec<u32>,
    pub channels_min: usize,
    pub channels_max: usize,
}

pub struct Session {
    channel: Box<dyn ControlChannel>,
    config: StreamConfig,
    direction: Direction,
    transport: TransportKind,
    endpoint: CapabilityBlock,
    state: StreamState,
    /// Configuration last sent, for idempotence checks and reconfiguration
    chosen: Option<CodecConfig>,
    negotiated: Option<NegotiatedConfig>,
    data: Option<DataSocket>,
    /// Sink delay from the post-configuration report, 0.1 ms units
    sink_delay: u16,
}

impl Session {
    /// Connect to the audio service and fetch capabilities for the remote.
    pub fn connect(config: StreamConfig, direction: Direction) -> Result<Self> {
        let client = ServiceClient::connect()?;
        Self::with_channel(Box::new(client), config, direction)
    }

    /// Build a session over an already-connected control channel.
    pub fn with_channel(
        mut channel: Box<dyn ControlChannel>,
        config: StreamConfig,
        direction: Direction,
    ) -> Result<Self> {
        config.validate()?;
        let rsp = channel.request(Request::GetCapabilities {
            destination: config.device.clone(),
            preference: config.profile,
            autoconnect: config.autoconnect,
        })?;
        let Response::GetCapabilities { transport, blocks } = rsp else {
            return Err(malformed("capability response carried wrong payload"));
        };
        if !config.profile.accepts(transport) {
            return Err(Error::Config(ConfigError::InvalidValue {
                key: "profile",
                reason: format!("service selected the {transport:?} transport"),
            }));
        }
        let endpoint = select_endpoint(transport, &blocks)?;
        tracing::info!(
            device = %config.device,
            ?transport,
            seid = endpoint.seid,
            "session established"
        );
        Ok(Self {
            channel,
            config,
            direction,
            transport,
            endpoint,
            state: StreamState::Closed,
            chosen: None,
            negotiated: None,
            data: None,
            sink_delay: 0,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn address(&self) -> &str {
        &self.config.device
    }

    pub fn negotiated(&self) -> Option<&NegotiatedConfig> {
        self.negotiated.as_ref()
    }

    pub fn sink_delay(&self) -> u16 {
        self.sink_delay
    }

    pub fn data(&self) -> Option<&DataSocket> {
        self.data.as_ref()
    }

    pub fn data_mut(&mut self) -> Option<&mut DataSocket> {
        self.data.as_mut()
    }

    pub fn delay_poller(&self) -> Result<Box<dyn DelayPoller>> {
        Ok(self.channel.delay_poller()?)
    }

    /// Parameter ranges the endpoint advertises, before negotiation pins
    /// single values.
    pub fn hardware_limits(&self) -> HardwareLimits {
        match &self.endpoint.codec {
            CodecCapabilities::Pcm(pcm) => HardwareLimits {
                rates: vec![pcm.sample_rate],
                channels_min: 1,
                channels_max: 1,
            },
            CodecCapabilities::Sbc(remote) => {
                let rates = match self.config.rate {
                    Some(rate) => vec![rate],
                    None => [16_000, 32_000, 44_100, 48_000]
                        .into_iter()
                        .filter(|&r| {
                            rate_to_bit(r).is_some_and(|bit| remote.frequency & bit != 0)
                        })
                        .collect(),
                };
                let mono = remote.channel_mode & caps::CHANNEL_MODE_MONO != 0;
                let multi = remote.channel_mode & !caps::CHANNEL_MODE_MONO != 0;
                HardwareLimits {
                    rates,
                    channels_min: if mono { 1 } else { 2 },
                    channels_max: if multi { 2 } else { 1 },
                }
            }
        }
    }

    /// Acquire the endpoint for this direction.
    pub fn open(&mut self) -> Result<()> {
        let lock = match self.direction {
            Direction::Playback => LOCK_WRITE,
            Direction::Capture => LOCK_READ,
        };
        let rsp = self.channel.request(Request::Open {
            destination: self.config.device.clone(),
            seid: self.endpoint.seid,
            lock,
        })?;
        if rsp != Response::Open {
            return Err(malformed("open response carried wrong payload"));
        }
        self.state = StreamState::Opened;
        Ok(())
    }

    /// Configure the endpoint for `rate`/`channels`, or confirm the
    /// existing configuration already matches.
    ///
    /// A matching request in `Configured` or `Started` returns without any
    /// control-channel traffic, so a redundant reconfiguration never tears
    /// down a running stream.
    pub fn negotiate(&mut self, rate: u32, channels: usize) -> Result<NegotiatedConfig> {
        let wanted = match self.transport {
            TransportKind::Encoded => {
                CodecConfig::Sbc(self.select_sbc(rate, channels)?)
            }
            TransportKind::Voice => CodecConfig::Pcm(PcmCapabilities { sample_rate: rate }),
        };

        if self.state >= StreamState::Configured && self.chosen.as_ref() == Some(&wanted) {
            tracing::debug!("configuration unchanged, skipping exchange");
            if let Some(negotiated) = &self.negotiated {
                return Ok(negotiated.clone());
            }
        }

        if self.state == StreamState::Closed {
            self.open()?;
        }

        let rsp = self.channel.request(Request::SetConfiguration {
            seid: self.endpoint.seid,
            config: wanted.clone(),
        })?;
        let Response::SetConfiguration { link_mtu } = rsp else {
            return Err(malformed("configuration response carried wrong payload"));
        };

        // The service follows every accepted configuration with the
        // sink's initial delay report.
        let delay = match self.channel.expect_indication(MessageName::DelayReport)? {
            Indication::DelayReport { delay } => delay,
            other => {
                return Err(Error::Protocol(ProtocolError::UnexpectedMessage {
                    expected: MessageName::DelayReport,
                    got: other.name(),
                }))
            }
        };

        let sbc = match &wanted {
            CodecConfig::Sbc(chosen) => Some(
                SbcParams::from_negotiated(chosen).map_err(Error::Codec)?,
            ),
            CodecConfig::Pcm(_) => None,
        };
        let negotiated = NegotiatedConfig {
            kind: self.transport,
            rate,
            channels,
            link_mtu: link_mtu as usize,
            sbc,
        };
        tracing::info!(
            rate,
            channels,
            link_mtu,
            delay_tenths_ms = delay,
            "stream configured"
        );
        self.chosen = Some(wanted);
        self.negotiated = Some(negotiated.clone());
        self.sink_delay = delay;
        self.state = StreamState::Configured;
        Ok(negotiated)
    }

    /// Start the stream and take over the data channel.
    ///
    /// Already-started sessions return immediately; the caller still owes
    /// the host framework a readiness signal. A remote-closed-endpoint
    /// error drops the session to `Closed` so the caller can redo the
    /// whole OPEN path.
    pub fn start(&mut self, period_count: u32) -> Result<()> {
        if self.state == StreamState::Started {
            return Ok(());
        }
        if self.state != StreamState::Configured {
            return Err(malformed("start before configuration"));
        }

        match self.channel.request(Request::StartStream) {
            Ok(Response::StartStream) => {}
            Ok(_) => return Err(malformed("start response carried wrong payload")),
            Err(e) if e.is_endpoint_closed() => {
                tracing::warn!("remote closed the endpoint, next attempt reopens");
                self.state = StreamState::Closed;
                self.chosen = None;
                self.negotiated = None;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }

        match self.channel.expect_indication(MessageName::NewStream)? {
            Indication::NewStream => {}
            other => {
                return Err(Error::Protocol(ProtocolError::UnexpectedMessage {
                    expected: MessageName::NewStream,
                    got: other.name(),
                }))
            }
        }

        let data = self.channel.take_data_socket()?;
        self.apply_data_socket_options(&data, period_count)?;
        self.data = Some(data);
        self.state = StreamState::Started;
        tracing::info!("stream started");
        Ok(())
    }

    fn apply_data_socket_options(&self, data: &DataSocket, period_count: u32) -> Result<()> {
        let link_mtu = self
            .negotiated
            .as_ref()
            .map(|n| n.link_mtu)
            .unwrap_or_default();
        match self.transport {
            TransportKind::Encoded => {
                let timeout = Duration::from_micros(period_count as u64).max(
                    Duration::from_micros(1),
                );
                match self.direction {
                    Direction::Playback => data.set_send_timeout(timeout)?,
                    Direction::Capture => data.set_recv_timeout(timeout)?,
                }
            }
            TransportKind::Voice => {
                data.set_buffer_size(self.direction, link_mtu * period_count as usize)?;
            }
        }
        Ok(())
    }

    /// Intersect the remote's advertised bitmasks with the configuration
    /// overrides and library bounds, narrowing each field to one bit.
    fn select_sbc(&self, rate: u32, channels: usize) -> Result<SbcCapabilities> {
        let CodecCapabilities::Sbc(remote) = &self.endpoint.codec else {
            return Err(malformed("encoded endpoint without SBC capabilities"));
        };

        let rate = self.config.rate.unwrap_or(rate);
        let frequency = rate_to_bit(rate)
            .filter(|bit| remote.frequency & bit != 0)
            .ok_or_else(|| unsupported("rate", &format!("{rate} Hz")))?;

        let mode = match self.config.mode {
            Some(mode) if remote.channel_mode & mode.bit() != 0 => mode,
            Some(mode) => return Err(unsupported("mode", &format!("{mode:?}"))),
            None => preferred_mode(channels, remote.channel_mode)
                .ok_or_else(|| unsupported("mode", &format!("{channels} channels")))?,
        };

        let blocks = match self.config.blocks {
            Some(blocks) => blocks_to_bit(blocks)
                .filter(|bit| remote.block_length & bit != 0)
                .map(|_| blocks)
                .ok_or_else(|| unsupported("blocks", &blocks.to_string()))?,
            None => [16u8, 12, 8, 4]
                .into_iter()
                .find(|&b| {
                    blocks_to_bit(b).is_some_and(|bit| remote.block_length & bit != 0)
                })
                .ok_or_else(|| unsupported("blocks", "any"))?,
        };

        let subbands = match self.config.subbands {
            Some(subbands) => subbands_to_bit(subbands)
                .filter(|bit| remote.subbands & bit != 0)
                .map(|_| subbands)
                .ok_or_else(|| unsupported("subbands", &subbands.to_string()))?,
            None => [8u8, 4]
                .into_iter()
                .find(|&s| subbands_to_bit(s).is_some_and(|bit| remote.subbands & bit != 0))
                .ok_or_else(|| unsupported("subbands", "any"))?,
        };

        let allocation = match self.config.allocation {
            Some(allocation) if remote.allocation & allocation.bit() != 0 => allocation,
            Some(allocation) => {
                return Err(unsupported("allocation", &format!("{allocation:?}")))
            }
            None => [Allocation::Loudness, Allocation::Snr]
                .into_iter()
                .find(|a| remote.allocation & a.bit() != 0)
                .ok_or_else(|| unsupported("allocation", "any"))?,
        };

        let min_bitpool = remote.min_bitpool.max(MIN_BITPOOL);
        let max_bitpool = remote.max_bitpool.min(MAX_BITPOOL);
        if min_bitpool > max_bitpool {
            return Err(unsupported(
                "bitpool",
                &format!("remote range {}..={}", remote.min_bitpool, remote.max_bitpool),
            ));
        }
        let bitpool = match self.config.bitpool {
            Some(bp) if (min_bitpool..=max_bitpool).contains(&bp) => bp,
            Some(bp) => {
                return Err(unsupported(
                    "bitpool",
                    &format!("{bp} outside {min_bitpool}..={max_bitpool}"),
                ))
            }
            None => default_bitpool(rate, mode).clamp(min_bitpool, max_bitpool),
        };

        Ok(SbcCapabilities {
            channel_mode: mode.bit(),
            frequency,
            allocation: allocation.bit(),
            subbands: subbands_to_bit(subbands).unwrap_or(caps::SUBBANDS_8),
            block_length: blocks_to_bit(blocks).unwrap_or(caps::BLOCK_LENGTH_16),
            min_bitpool,
            max_bitpool: bitpool,
        })
    }

    /// Release everything the session holds. Sockets close on drop; the
    /// consumed receiver makes double-teardown unrepresentable.
    pub fn teardown(self) {
        tracing::info!(device = %self.config.device, "session torn down");
    }
}

fn malformed(what: &str) -> Error {
    Error::Protocol(ProtocolError::Malformed(what.into()))
}

fn unsupported(key: &'static str, detail: &str) -> Error {
    Error::Config(ConfigError::InvalidValue {
        key,
        reason: format!("{detail} not accepted by the remote endpoint"),
    })
}

fn preferred_mode(channels: usize, mask: u8) -> Option<ChannelMode> {
    let order: &[ChannelMode] = if channels >= 2 {
        &[ChannelMode::Joint, ChannelMode::Stereo, ChannelMode::Dual]
    } else {
        &[ChannelMode::Mono]
    };
    order.iter().copied().find(|m| mask & m.bit() != 0)
}

fn select_endpoint(
    transport: TransportKind,
    blocks: &[CapabilityBlock],
) -> Result<CapabilityBlock> {
    let found = blocks.iter().find(|block| {
        block.transport == transport
            && match (&block.codec, transport) {
                // Skip sinks already write-locked by another stream.
                (CodecCapabilities::Sbc(_), TransportKind::Encoded) => {
                    block.lock & LOCK_WRITE == 0
                }
                (CodecCapabilities::Pcm(_), TransportKind::Voice) => true,
                _ => false,
            }
    });
    found
        .cloned()
        .ok_or_else(|| malformed("no usable endpoint in capability listing"))
}
