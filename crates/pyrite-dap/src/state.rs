use std::fmt;

/// Lifecycle of one debug session.
///
/// `Running` and `Stopped` alternate as the debuggee hits breakpoints and
/// resumes. Any state can move to `Terminating`; `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Configuring,
    Running,
    Stopped,
    Terminating,
    Terminated,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Configuring => "configuring",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::Terminating => "terminating",
            SessionState::Terminated => "terminated",
        }
    }

    /// States in which the server may legitimately report a stop.
    pub fn accepts_stop(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Stopped)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Terminating | SessionState::Terminated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
