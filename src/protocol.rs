//! Control message shapes exchanged as text frames.
//!
//! One JSON object per text message. Unrecognized fields and shapes are
//! ignored, not errors; binary frames never carry control data and text
//! frames never carry audio.

use serde::{Deserialize, Serialize};

/// Outbound command, currently only the opening greeting.
#[derive(Serialize, Debug)]
pub struct ClientCommand {
    pub cmd: &'static str,
    pub text: String,
}

impl ClientCommand {
    pub fn greeting(text: &str) -> Self {
        Self {
            cmd: "text",
            text: text.to_string(),
        }
    }
}

/// Inbound control message. Only the barge-in signal matters to us.
#[derive(Deserialize, Debug, Clone)]
pub struct ServerMessage {
    pub interrupted: Option<bool>,
}
