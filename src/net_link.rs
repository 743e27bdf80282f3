//! WebSocket link to the speech backend.
//!
//! The session only depends on the `Transport` contract: an ordered,
//! message-framed channel that distinguishes text from binary and
//! reports open/close. A dropped connection is terminal; there is no
//! reconnect loop here, the session decides what a disconnect means.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

#[derive(Debug)]
pub enum NetEvent {
    Text(String),
    Binary(Vec<u8>),
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub enum NetCommand {
    SendText(String),
    SendBinary(Vec<u8>),
}

/// Message channel to the remote endpoint.
#[async_trait]
pub trait Transport: Send {
    /// Establish the connection and return the command/event pair.
    /// `NetEvent::Connected` is delivered once the link is open.
    async fn connect(&mut self) -> Result<(mpsc::Sender<NetCommand>, mpsc::Receiver<NetEvent>)>;
}

pub struct WsLink {
    ws_url: String,
}

impl WsLink {
    pub fn new(ws_url: &str) -> Self {
        Self {
            ws_url: ws_url.to_string(),
        }
    }
}

#[async_trait]
impl Transport for WsLink {
    async fn connect(&mut self) -> Result<(mpsc::Sender<NetCommand>, mpsc::Receiver<NetEvent>)> {
        let url = Url::parse(&self.ws_url)?;
        log::info!("Connecting to {}...", url);

        let (ws_stream, _) = connect_async(self.ws_url.as_str()).await?;
        log::info!("Connected!");

        let (tx_event, rx_event) = mpsc::channel::<NetEvent>(100);
        let (tx_cmd, rx_cmd) = mpsc::channel::<NetCommand>(100);

        tokio::spawn(async move {
            socket_loop(ws_stream, tx_event, rx_cmd).await;
        });

        Ok((tx_cmd, rx_event))
    }
}

async fn socket_loop(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    tx: mpsc::Sender<NetEvent>,
    mut rx_cmd: mpsc::Receiver<NetCommand>,
) {
    let (mut write, mut read) = ws_stream.split();

    if tx.send(NetEvent::Connected).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if tx.send(NetEvent::Text(text.to_string())).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if tx.send(NetEvent::Binary(data.to_vec())).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        let _ = tx.send(NetEvent::Disconnected).await;
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {}", e);
                        let _ = tx.send(NetEvent::Disconnected).await;
                        return;
                    }
                    None => {
                        let _ = tx.send(NetEvent::Disconnected).await;
                        return;
                    }
                }
            }
            cmd = rx_cmd.recv() => {
                match cmd {
                    Some(NetCommand::SendText(text)) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            log::warn!("WebSocket send error: {}", e);
                            let _ = tx.send(NetEvent::Disconnected).await;
                            return;
                        }
                    }
                    Some(NetCommand::SendBinary(data)) => {
                        if let Err(e) = write.send(Message::Binary(data.into())).await {
                            log::warn!("WebSocket send error: {}", e);
                            let _ = tx.send(NetEvent::Disconnected).await;
                            return;
                        }
                    }
                    // Session dropped the command sender: clean shutdown.
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
        }
    }
}
