//! Domain types shared by the supervisor and its consumers.

use std::fmt;

/// Timeouts for an idle watch, in minutes.
///
/// A notification timeout of zero mirrors the status timeout. The folding
/// happens here, once, so the monitor only ever sees concrete values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    status_timeout_minutes: u32,
    notifs_timeout_minutes: u32,
}

impl WatchConfig {
    /// Create a watch configuration, folding a zero notification timeout.
    pub fn new(status_timeout_minutes: u32, notifs_timeout_minutes: u32) -> Self {
        let notifs_timeout_minutes = if notifs_timeout_minutes == 0 {
            status_timeout_minutes
        } else {
            notifs_timeout_minutes
        };

        Self {
            status_timeout_minutes,
            notifs_timeout_minutes,
        }
    }

    /// Status idle timeout in minutes.
    pub fn status_timeout_minutes(self) -> u32 {
        self.status_timeout_minutes
    }

    /// Notification idle timeout in minutes.
    pub fn notifs_timeout_minutes(self) -> u32 {
        self.notifs_timeout_minutes
    }
}

/// Lifecycle phase of a [`Supervisor`](crate::supervisor::Supervisor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// No monitor process.
    #[default]
    Idle,
    /// Ensuring the monitor executable is present and verified.
    Acquiring,
    /// Launching the monitor process.
    Spawning,
    /// Waiting for the monitor's socket.
    Connecting,
    /// Process running and channel open.
    Active,
    /// Tearing down.
    Stopping,
    /// Last start attempt failed in a way retrying will not fix.
    Error,
}

impl SupervisorState {
    /// Get the state as a lowercase string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Acquiring => "acquiring",
            Self::Spawning => "spawning",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }

    /// Whether `start()` may begin a new attempt from this state.
    pub fn accepts_start(self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
