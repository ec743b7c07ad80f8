use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Thread as reported by the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
}

/// Which stream a log or output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Normal,
    Error,
}

impl OutputStream {
    pub fn from_stderr(stderr: bool) -> Self {
        if stderr {
            OutputStream::Error
        } else {
            OutputStream::Normal
        }
    }
}

/// Notification as produced by the target connection, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RawTargetEvent {
    TargetReady,
    TargetStarted,
    TargetStopped {
        thread: Option<ThreadInfo>,
    },
    TargetInterrupted {
        thread: Option<ThreadInfo>,
    },
    TargetSignaled {
        thread: Option<ThreadInfo>,
        signal: Option<String>,
    },
    TargetExited {
        exit_code: Option<i64>,
        reason: Option<String>,
    },
    ThreadStarted {
        thread: ThreadInfo,
    },
    ThreadStopped {
        thread: ThreadInfo,
    },
    BreakpointHit {
        thread: Option<ThreadInfo>,
        location: Option<String>,
    },
    ExceptionThrown {
        thread: Option<ThreadInfo>,
        message: String,
    },
    UnhandledException {
        thread: Option<ThreadInfo>,
        message: String,
    },
    Log {
        stderr: bool,
        text: String,
    },
    Output {
        stderr: bool,
        text: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TargetReady,
    TargetStarted,
    TargetStopped,
    TargetInterrupted,
    TargetSignaled,
    TargetExited,
    ThreadStarted,
    ThreadStopped,
    BreakpointHit,
    ExceptionThrown,
    UnhandledException,
    Log,
    Output,
}

impl EventKind {
    /// Kinds after which the target is suspended.
    pub fn stops_target(&self) -> bool {
        matches!(
            self,
            EventKind::TargetStopped
                | EventKind::TargetInterrupted
                | EventKind::TargetSignaled
                | EventKind::BreakpointHit
                | EventKind::ExceptionThrown
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::TargetReady => "TargetReady",
            EventKind::TargetStarted => "TargetStarted",
            EventKind::TargetStopped => "TargetStopped",
            EventKind::TargetInterrupted => "TargetInterrupted",
            EventKind::TargetSignaled => "TargetSignaled",
            EventKind::TargetExited => "TargetExited",
            EventKind::ThreadStarted => "TargetThreadStarted",
            EventKind::ThreadStopped => "TargetThreadStopped",
            EventKind::BreakpointHit => "TargetHitBreakpoint",
            EventKind::ExceptionThrown => "TargetExceptionThrown",
            EventKind::UnhandledException => "TargetUnhandledException",
            EventKind::Log => "LogWriter",
            EventKind::Output => "OutputWriter",
        };
        write!(f, "{name}")
    }
}

impl RawTargetEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RawTargetEvent::TargetReady => EventKind::TargetReady,
            RawTargetEvent::TargetStarted => EventKind::TargetStarted,
            RawTargetEvent::TargetStopped { .. } => EventKind::TargetStopped,
            RawTargetEvent::TargetInterrupted { .. } => EventKind::TargetInterrupted,
            RawTargetEvent::TargetSignaled { .. } => EventKind::TargetSignaled,
            RawTargetEvent::TargetExited { .. } => EventKind::TargetExited,
            RawTargetEvent::ThreadStarted { .. } => EventKind::ThreadStarted,
            RawTargetEvent::ThreadStopped { .. } => EventKind::ThreadStopped,
            RawTargetEvent::BreakpointHit { .. } => EventKind::BreakpointHit,
            RawTargetEvent::ExceptionThrown { .. } => EventKind::ExceptionThrown,
            RawTargetEvent::UnhandledException { .. } => EventKind::UnhandledException,
            RawTargetEvent::Log { .. } => EventKind::Log,
            RawTargetEvent::Output { .. } => EventKind::Output,
        }
    }
}

/// Single event shape consumed by the host bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub kind: EventKind,
    pub thread: Option<ThreadInfo>,
    pub payload: Option<String>,
    pub stream: Option<OutputStream>,
    pub exit_code: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl NormalizedEvent {
    pub fn normalize(raw: RawTargetEvent) -> Self {
        Self::normalize_at(raw, Utc::now())
    }

    pub fn normalize_at(raw: RawTargetEvent, timestamp: DateTime<Utc>) -> Self {
        let kind = raw.kind();
        let mut event = Self {
            kind,
            thread: None,
            payload: None,
            stream: None,
            exit_code: None,
            timestamp,
        };

        match raw {
            RawTargetEvent::TargetReady | RawTargetEvent::TargetStarted => {}
            RawTargetEvent::TargetStopped { thread } | RawTargetEvent::TargetInterrupted { thread } => {
                event.thread = thread;
            }
            RawTargetEvent::TargetSignaled { thread, signal } => {
                event.thread = thread;
                event.payload = signal;
            }
            RawTargetEvent::TargetExited { exit_code, reason } => {
                event.exit_code = exit_code;
                event.payload = reason;
            }
            RawTargetEvent::ThreadStarted { thread } | RawTargetEvent::ThreadStopped { thread } => {
                event.thread = Some(thread);
            }
            RawTargetEvent::BreakpointHit { thread, location } => {
                event.thread = thread;
                event.payload = location;
            }
            RawTargetEvent::ExceptionThrown { thread, message }
            | RawTargetEvent::UnhandledException { thread, message } => {
                event.thread = thread;
                event.payload = Some(message);
            }
            RawTargetEvent::Log { stderr, text } | RawTargetEvent::Output { stderr, text } => {
                event.stream = Some(OutputStream::from_stderr(stderr));
                event.payload = Some(text);
            }
        }

        event
    }

    pub fn thread_id(&self) -> Option<i64> {
        self.thread.as_ref().map(|thread| thread.id)
    }
}
