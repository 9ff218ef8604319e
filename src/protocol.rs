//! Wire protocol between the supervisor and the monitor.
//!
//! Every message is a single-line JSON object with exactly one key, the tag.
//! Inbound lines are translated into [`Event`]s; [`Command`]s go out the same way.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::domain::WatchConfig;
use crate::process::OutputLine;

/// Tags the translator understands. Anything else is ignored.
const EVENT_TAGS: &[&str] = &[
    "Info",
    "Error",
    "Connected",
    "Exited",
    "WatchEvent",
    "WatchStarted",
    "WatchStopped",
];

/// Idle transitions reported by the monitor.
///
/// Each field is independent; an absent field leaves that state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdleUpdate {
    #[serde(rename = "StatusIdle", default, skip_serializing_if = "Option::is_none")]
    pub status_idle: Option<bool>,

    #[serde(rename = "NotifsIdle", default, skip_serializing_if = "Option::is_none")]
    pub notifs_idle: Option<bool>,
}

/// Event delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Informational text (monitor stdout or an `Info` message).
    Info(String),
    /// Error text (monitor stderr, socket errors or an `Error` message).
    Error(String),
    /// The channel to the monitor is open.
    Connected,
    /// The monitor process exited. `None` when it was killed by a signal.
    Exited(Option<i32>),
    /// Idle state changed.
    WatchEvent(IdleUpdate),
    /// A watch is running with the given timeouts in minutes.
    WatchStarted {
        status_timeout: u32,
        notifs_timeout: u32,
    },
    /// The watch was stopped.
    WatchStopped,
}

impl Event {
    /// Serialize the event in its wire envelope.
    pub fn to_json(&self) -> String {
        let wire = WireEvent::from(self.clone());
        // Serializing a plain enum of strings, numbers and bools cannot fail.
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

/// Command sent to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start (or restart) idle detection with the given timeouts.
    StartWatch(WatchConfig),
    /// Stop idle detection, keep running.
    StopWatch,
    /// Release the socket and exit.
    Quit,
}

impl Command {
    /// Serialize to a newline-terminated JSON line.
    pub fn to_line(&self) -> String {
        let wire = match *self {
            Self::StartWatch(watch) => WireCommand::StartWatch(
                watch.status_timeout_minutes(),
                watch.notifs_timeout_minutes(),
            ),
            Self::StopWatch => WireCommand::StopWatch(()),
            Self::Quit => WireCommand::Quit(()),
        };

        let mut line = serde_json::to_string(&wire).unwrap_or_default();
        line.push('\n');
        line
    }

    /// Tag name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartWatch(_) => "StartWatch",
            Self::StopWatch => "StopWatch",
            Self::Quit => "Quit",
        }
    }
}

/// Errors for inbound lines that cannot be translated.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("Message has {0} tags, expected exactly one")]
    AmbiguousTag(usize),

    #[error("Invalid payload for {tag}: {reason}")]
    InvalidPayload { tag: String, reason: String },

    #[error("WatchEvent carries neither StatusIdle nor NotifsIdle")]
    EmptyWatchEvent,
}

/// Translate one inbound channel line.
///
/// Returns `Ok(None)` for well-formed messages with a tag we don't know, so
/// newer monitors can add messages without breaking older supervisors.
pub fn translate(line: &str) -> Result<Option<Event>, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(line.trim())?;

    let Some(object) = value.as_object() else {
        return Err(ProtocolError::NotAnObject);
    };

    if object.len() != 1 {
        return Err(ProtocolError::AmbiguousTag(object.len()));
    }

    let Some(tag) = object.keys().next().cloned() else {
        return Err(ProtocolError::AmbiguousTag(0));
    };

    if !EVENT_TAGS.contains(&tag.as_str()) {
        return Ok(None);
    }

    let wire: WireEvent =
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            tag,
            reason: e.to_string(),
        })?;

    if let WireEvent::WatchEvent(update) = &wire
        && update.status_idle.is_none()
        && update.notifs_idle.is_none()
    {
        return Err(ProtocolError::EmptyWatchEvent);
    }

    Ok(Some(wire.into()))
}

/// Translate a line from the monitor's standard streams.
pub fn translate_output(line: OutputLine) -> Event {
    match line {
        OutputLine::Stdout(text) => Event::Info(text.trim().to_string()),
        OutputLine::Stderr(text) => Event::Error(text.trim().to_string()),
    }
}

/// Inbound envelope. Unit tags carry `null`, hence the `()` payloads.
#[derive(Debug, Serialize, Deserialize)]
enum WireEvent {
    Info(String),
    Error(String),
    Connected(()),
    Exited(Option<i32>),
    WatchEvent(IdleUpdate),
    WatchStarted(u32, u32),
    WatchStopped(()),
}

impl From<WireEvent> for Event {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::Info(text) => Self::Info(text),
            WireEvent::Error(text) => Self::Error(text),
            WireEvent::Connected(()) => Self::Connected,
            WireEvent::Exited(code) => Self::Exited(code),
            WireEvent::WatchEvent(update) => Self::WatchEvent(update),
            WireEvent::WatchStarted(status_timeout, notifs_timeout) => Self::WatchStarted {
                status_timeout,
                notifs_timeout,
            },
            WireEvent::WatchStopped(()) => Self::WatchStopped,
        }
    }
}

impl From<Event> for WireEvent {
    fn from(event: Event) -> Self {
        match event {
            Event::Info(text) => Self::Info(text),
            Event::Error(text) => Self::Error(text),
            Event::Connected => Self::Connected(()),
            Event::Exited(code) => Self::Exited(code),
            Event::WatchEvent(update) => Self::WatchEvent(update),
            Event::WatchStarted {
                status_timeout,
                notifs_timeout,
            } => Self::WatchStarted(status_timeout, notifs_timeout),
            Event::WatchStopped => Self::WatchStopped(()),
        }
    }
}

/// Outbound envelope.
#[derive(Debug, Serialize)]
enum WireCommand {
    StartWatch(u32, u32),
    StopWatch(()),
    Quit(()),
}
