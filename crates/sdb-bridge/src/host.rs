//! Types exchanged with the debugger host.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Status;
use crate::protocol::{EventKind, NormalizedEvent, ThreadInfo};

/// Identifier this bridge reports to the host.
pub const ENGINE_ID: &str = "a6f2e4f1-6ad4-4c2b-9b7e-0c5d1e8f2a31";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineId(pub String);

impl EngineId {
    pub fn bridge() -> Self {
        Self(ENGINE_ID.to_string())
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Program as known to the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramRef {
    pub id: u64,
    pub name: String,
}

/// Process as known to the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessRef {
    pub pid: u32,
}

/// A target thread the host has been told about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: i64,
    pub name: String,
    pub location: String,
    /// Set on the record carried by the thread-creation event.
    pub first_seen: bool,
}

impl From<&ThreadInfo> for ThreadRecord {
    fn from(info: &ThreadInfo) -> Self {
        Self {
            id: info.id,
            name: info.name.clone(),
            location: info.location.clone(),
            first_seen: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostEvent {
    ThreadCreate,
    Target(NormalizedEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEventType {
    ThreadCreate,
    ThreadDestroy,
    LoadComplete,
    Resumed,
    Break,
    BreakpointHit,
    Exception,
    Output,
    ProgramDestroy,
}

impl HostEventType {
    pub fn of(event: &HostEvent) -> Self {
        match event {
            HostEvent::ThreadCreate => HostEventType::ThreadCreate,
            HostEvent::Target(event) => match event.kind {
                EventKind::ThreadStarted => HostEventType::ThreadCreate,
                EventKind::ThreadStopped => HostEventType::ThreadDestroy,
                EventKind::TargetReady => HostEventType::LoadComplete,
                EventKind::TargetStarted => HostEventType::Resumed,
                EventKind::TargetStopped
                | EventKind::TargetInterrupted
                | EventKind::TargetSignaled => HostEventType::Break,
                EventKind::BreakpointHit => HostEventType::BreakpointHit,
                EventKind::ExceptionThrown | EventKind::UnhandledException => {
                    HostEventType::Exception
                }
                EventKind::Log | EventKind::Output => HostEventType::Output,
                EventKind::TargetExited => HostEventType::ProgramDestroy,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventAttributes {
    pub synchronous: bool,
    pub stopping: bool,
}

impl EventAttributes {
    pub fn of(event: &HostEvent) -> Self {
        match event {
            HostEvent::ThreadCreate => Self {
                synchronous: true,
                stopping: false,
            },
            HostEvent::Target(event) => Self {
                synchronous: event.kind.stops_target() || event.kind == EventKind::TargetExited,
                stopping: event.kind.stops_target(),
            },
        }
    }
}

/// One delivery to the host callback sink.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub engine: EngineId,
    pub process: Option<ProcessRef>,
    pub program: ProgramRef,
    pub thread: Option<ThreadRecord>,
    pub event: HostEvent,
    pub event_type: HostEventType,
    pub attributes: EventAttributes,
}

/// The host's event callback. Anything other than `Status::Ok` means the
/// event was not accepted.
pub trait EventCallback: Send + Sync {
    fn event(&self, envelope: EventEnvelope) -> Status;
}
