//! Bluetooth audio PCM bridge
//!
//! Bridges a host audio framework's PCM abstraction onto Bluetooth audio
//! streams served by the system audio service. The control channel
//! negotiates the endpoint (capabilities, SBC configuration, stream
//! start); the data channel carries either SBC media packets (A2DP) or
//! raw voice transfer units (SCO). Because the data channel gives no
//! transfer feedback, a per-stream clock thread synthesizes the hardware
//! pointer from wall time.
//!
//! Typical playback flow:
//!
//! ```no_run
//! use bt_audio_bridge::{BluetoothStream, Direction, HwParams, StreamConfig};
//!
//! # fn main() -> bt_audio_bridge::Result<()> {
//! let config = StreamConfig::new("00:11:22:33:44:55");
//! let mut stream = BluetoothStream::open(config, Direction::Playback, None, None)?;
//! stream.hw_params(HwParams {
//!     rate: 8000,
//!     channels: 1,
//!     period_size: 128,
//!     periods: 4,
//!     start_threshold: 128,
//! })?;
//! stream.prepare()?;
//! stream.writei(&[0u8; 256])?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod ipc;
pub mod pipeline;
pub mod registry;
pub mod rtp;
pub mod session;
pub mod stream;
pub mod transport;

/// Protocol and timing constants
pub mod constants {
    use std::time::Duration;

    /// Bound on every control-channel receive
    pub const RECV_TIMEOUT: Duration = Duration::from_secs(6);

    /// Grace period a closed session stays parked for reclaim
    pub const WATCHER_TIMEOUT: Duration = Duration::from_secs(1);

    /// The virtual clock runs this many Hz fast so data is requested a
    /// touch early
    pub const ADJUST_RATE_HZ: u32 = 50;

    /// Floor for the clock thread's poll interval
    pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

    /// SBC bitpool bounds the library will agree to
    pub const MIN_BITPOOL: u8 = 2;
    pub const MAX_BITPOOL: u8 = 64;

    /// Capacity of the period-tick channel towards the host framework
    pub const TICK_CHANNEL_CAPACITY: usize = 32;
}

pub use config::{OverrunPolicy, StreamConfig};
pub use error::{Error, Result};
pub use registry::SessionRegistry;
pub use session::{HardwareLimits, NegotiatedConfig, Session, StreamState};
pub use stream::{BluetoothStream, HwParams, PcmState};
pub use transport::{Direction, TransportKind, TransportPreference};
