//! Orchestration layer between a debugger host and a soft debugger target.
//!
//! [`HostBridge`] is the surface the host drives. It builds a
//! [`TargetConnectionConfig`] from the launch payload, creates a
//! [`SessionHandle`], routes the session's notifications through an
//! [`EventRouter`] and hands the session to the inner engine as a
//! [`TransportToken`] that [`SessionTransport::unpackage`] turns back into a
//! working [`RemoteSession`].
pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod protocol;
pub mod router;
pub mod session;
pub mod transport;

pub use bridge::HostBridge;
pub use config::{BridgeSettings, TargetConnectionConfig};
pub use engine::{
    AttachReason, BreakpointRequest, ExceptionInfo, ExecutionParameters, InnerEngine,
    PendingBreakpoint,
};
pub use error::{BridgeError, Result, Status};
pub use host::{
    EngineId, EventAttributes, EventCallback, EventEnvelope, HostEvent, HostEventType, ProcessRef,
    ProgramRef, ThreadRecord,
};
pub use protocol::{EventKind, NormalizedEvent, OutputStream, RawTargetEvent, ThreadInfo};
pub use router::{EventRouter, NormalizedEventSink};
pub use session::{
    ExceptionPolicy, SessionControl, SessionHandle, SessionId, SessionState, TargetConnection,
    TargetConnector, TargetEventSink, TcpConnector,
};
pub use transport::{RemoteSession, SessionTransport, TransportToken};
