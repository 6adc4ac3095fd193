//! Stream probe: negotiates a voice stream to a remote device and plays
//! silence for a couple of seconds. Useful for checking that the audio
//! service, the remote and the negotiation path all line up.
//!
//! Usage: btprobe <device-address> [seconds]

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use bt_audio_bridge::{
    BluetoothStream, Direction, HwParams, StreamConfig, TransportPreference,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let Some(device) = args.next() else {
        bail!("usage: btprobe <device-address> [seconds]");
    };
    let seconds: u64 = match args.next() {
        Some(s) => s.parse().context("seconds must be a number")?,
        None => 2,
    };

    let mut config = StreamConfig::new(device);
    config.profile = TransportPreference::Voice;

    let mut stream = BluetoothStream::open(config, Direction::Playback, None, None)
        .context("opening stream")?;
    if let Some(limits) = stream.hardware_limits() {
        tracing::info!(?limits.rates, "endpoint limits");
    }

    let hw = HwParams {
        rate: 8000,
        channels: 1,
        period_size: 128,
        periods: 4,
        start_threshold: 128,
    };
    stream.hw_params(hw).context("applying parameters")?;
    stream.prepare().context("preparing stream")?;

    let silence = vec![0u8; (hw.period_size * 2) as usize];
    let total_frames = hw.rate as u64 * seconds;
    let mut written = 0u64;
    while written < total_frames {
        // Pace against the synthesized pointer: keep at most one buffer
        // of silence queued.
        let pointer = stream.pointer().context("reading pointer")?;
        if written >= pointer + hw.buffer_size() {
            std::thread::sleep(std::time::Duration::from_millis(4));
            stream.poll_events().context("polling events")?;
            continue;
        }
        written += stream.writei(&silence).context("writing silence")?;
    }

    tracing::info!(frames = written, "probe finished");
    stream.close();
    Ok(())
}
