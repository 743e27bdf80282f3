use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    network: Network,
    audio: Audio,
    session: Session,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
}

#[derive(Deserialize)]
struct Session {
    greeting_text: String,
}

// Read config.toml at compile time and export the values as env vars.
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);

    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);

    println!("cargo:rustc-env=GREETING_TEXT={}", config.session.greeting_text);
}
