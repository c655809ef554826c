//! Chat messages and the line-delimited JSON wire protocol: one tagged
//! JSON object per line, one response per request.

use std::io;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Sender id used for relay-generated notices such as join announcements.
pub const SYSTEM_SENDER: &str = "system";

/// A single chat message, as stored in history and delivered to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub from: String,
    pub text: String,
    pub time: DateTime<Utc>,
}

impl Message {
    pub fn user(from: &str, text: &str) -> Self {
        Self {
            from: from.to_string(),
            text: text.to_string(),
            time: Utc::now(),
        }
    }

    /// The notice broadcast when `client_id` joins.
    pub fn join_notice(client_id: &str) -> Self {
        Self {
            from: SYSTEM_SENDER.to_string(),
            text: format!("User {client_id} joined"),
            time: Utc::now(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.from == SYSTEM_SENDER
    }
}

/// Requests a client can issue against the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Register { client_id: String },
    Send { from: String, text: String },
    Poll { client_id: String },
    Unregister { client_id: String },
}

/// Replies the relay sends back, one per request. `History` answers
/// `Register`, `Message` answers `Poll`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    History { messages: Vec<Message> },
    Sent,
    Message { message: Message },
    Unregistered { was_present: bool },
    Error { kind: ErrorKind, message: String },
}

/// Stable failure categories carried in [`Response::Error`] so clients can
/// match on behavior instead of parsing the human-readable message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidClientId,
    InvalidSender,
    NotRegistered,
    ClientGone,
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // Returns Ok(None) on a cleanly closed connection; blank lines are skipped.
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        let frame = line.trim();
        if frame.is_empty() {
            continue;
        }
        return serde_json::from_str(frame).map(Some).map_err(invalid_data);
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut frame = serde_json::to_string(message).map_err(invalid_data)?;
    frame.push('\n');
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await
}

fn invalid_data(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
