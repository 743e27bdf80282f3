mod audio;
mod config;
mod net_link;
mod protocol;
mod session;

use audio::AlsaBackend;
use audio::clock::StreamClock;
use config::Config;
use net_link::WsLink;
use session::{Flow, Session};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    let config = Config::new();

    let transport = WsLink::new(config.ws_url);
    let backend = AlsaBackend::new(config.capture_device, config.playback_device);
    let clock = StreamClock::new();

    let mut session = Session::new(config, Box::new(transport), Box::new(backend), clock);
    session.start().await?;
    log::info!("Streaming. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            event = session.next_event() => {
                match event {
                    Some(event) => {
                        if session.handle_net_event(event) == Flow::Terminated {
                            log::warn!("Session ended");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    session.stop();
    Ok(())
}
