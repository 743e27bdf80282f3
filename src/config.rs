/// Microphone sample rate on the wire (Hz). Protocol contract, not a knob.
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;
/// Sample rate of audio received from the remote side (Hz).
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;
/// Samples per capture block; one block becomes one wire frame.
pub const CAPTURE_BLOCK_SAMPLES: usize = 4096;

#[derive(Debug, Clone)]
pub struct Config {
    // 网络配置
    pub ws_url: &'static str,

    // ALSA 设备名
    pub capture_device: &'static str,
    pub playback_device: &'static str,

    // 会话开场白
    pub greeting_text: &'static str,
}

impl Config {
    /// Build the configuration from env vars baked in at compile time
    /// by build.rs from config.toml.
    pub fn new() -> Self {
        Self {
            ws_url: env!("WS_URL"),
            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            greeting_text: env!("GREETING_TEXT"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
