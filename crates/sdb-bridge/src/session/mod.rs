//! Session lifecycle against a single target.
//!
//! `Created → Connecting → Running ⇄ Stopped → Exited`. `Exited` is terminal.

pub mod connector;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::TargetConnectionConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::RawTargetEvent;

pub use connector::{TargetConnection, TargetConnector, TargetEventSink, TcpConnector};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Connecting,
    Running,
    Stopped,
    Exited,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Connecting => write!(f, "connecting"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// What to do when the target reports an exception nobody handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionPolicy {
    /// Keep the session alive.
    #[default]
    Continue,
    /// Tear the session down.
    Abort,
}

impl ExceptionPolicy {
    /// Returns `true` when the session should keep running.
    pub fn on_unhandled(&self, session: SessionId, message: &str) -> bool {
        warn!(
            method = "ExceptionHandler",
            sender = %session,
            policy = ?self,
            message = %message,
            "Unhandled exception in target"
        );
        matches!(self, ExceptionPolicy::Continue)
    }
}

/// Operations available on a live session, locally or through a proxy.
pub trait SessionControl: Send + Sync {
    fn state(&self) -> Result<SessionState>;
    fn run(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
    fn interrupt(&self) -> Result<()>;
    fn terminate(&self) -> Result<()>;
}

/// One live connection to a target. Cloning yields another reference to the
/// same session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    config: TargetConnectionConfig,
    connector: Arc<dyn TargetConnector>,
    exception_policy: ExceptionPolicy,
    state: Mutex<SessionState>,
    state_changed: Condvar,
    attempts: AtomicU32,
    connection: Mutex<Option<Box<dyn TargetConnection>>>,
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
    events: Sender<RawTargetEvent>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.lock_state())
            .field("target", &self.inner.config.socket_addr())
            .finish()
    }
}

impl SessionHandle {
    /// Create a session in `Created`. Notifications are pushed into `events`
    /// in the order the target produced them.
    pub fn new(
        config: TargetConnectionConfig,
        connector: Arc<dyn TargetConnector>,
        exception_policy: ExceptionPolicy,
        events: Sender<RawTargetEvent>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(1);
        let id = SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        debug!(session = %id, target = %config.socket_addr(), "Created session");

        Self {
            inner: Arc::new(SessionInner {
                id,
                config,
                connector,
                exception_policy,
                state: Mutex::new(SessionState::Created),
                state_changed: Condvar::new(),
                attempts: AtomicU32::new(0),
                connection: Mutex::new(None),
                cancel_tx: Mutex::new(Some(cancel_tx)),
                cancel_rx,
                events,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn config(&self) -> &TargetConnectionConfig {
        &self.inner.config
    }

    pub fn current_state(&self) -> SessionState {
        *self.inner.lock_state()
    }

    /// Number of connection attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Sink that feeds notifications into this session as if the target
    /// connection had produced them.
    pub fn event_sink(&self) -> TargetEventSink {
        SessionInner::sink(&self.inner)
    }

    /// Block until the session reaches `state` or `timeout` elapses.
    pub fn wait_for_state(&self, state: SessionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self.inner.lock_state();
        while *current != state {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            current = match self.inner.state_changed.wait_timeout(current, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Start connecting with the configuration captured at construction.
    ///
    /// Returns once the session is `Connecting`; attempts run on a
    /// background thread and failures surface as a `TargetExited` event.
    pub fn run(&self) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            if *state != SessionState::Created {
                return Err(BridgeError::ProtocolMisuse(Cow::Owned(format!(
                    "run called on {} in state {}",
                    self.inner.id, *state
                ))));
            }
            *state = SessionState::Connecting;
            self.inner.state_changed.notify_all();
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("sdb-connect-{}", self.inner.id.0))
            .spawn(move || inner.connect_loop());

        if let Err(e) = spawned {
            error!(session = %self.inner.id, error = %e, "Failed to spawn connection thread");
            self.inner.exit_with(None, Some(format!("failed to start connecting: {e}")));
            return Err(e.into());
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.inner.with_connection("resume", |connection| connection.resume())?;
        self.inner
            .transition(&[SessionState::Stopped], SessionState::Running);
        Ok(())
    }

    pub fn interrupt(&self) -> Result<()> {
        self.inner
            .with_connection("interrupt", |connection| connection.interrupt())
    }

    /// Idempotent: terminating an exited session is a no-op.
    pub fn terminate(&self) -> Result<()> {
        if !self.inner.mark_exited() {
            debug!(session = %self.inner.id, "Terminate on exited session ignored");
            return Ok(());
        }

        let connection = lock(&self.inner.connection).take();
        if let Some(mut connection) = connection
            && let Err(e) = connection.terminate()
        {
            warn!(session = %self.inner.id, error = %e, "Failed to terminate target connection");
        }

        info!(session = %self.inner.id, "Session terminated");
        self.inner.forward(RawTargetEvent::TargetExited {
            exit_code: None,
            reason: Some("terminated by request".to_string()),
        });
        Ok(())
    }
}

impl SessionControl for SessionHandle {
    fn state(&self) -> Result<SessionState> {
        Ok(self.current_state())
    }

    fn run(&self) -> Result<()> {
        SessionHandle::run(self)
    }

    fn resume(&self) -> Result<()> {
        SessionHandle::resume(self)
    }

    fn interrupt(&self) -> Result<()> {
        SessionHandle::interrupt(self)
    }

    fn terminate(&self) -> Result<()> {
        SessionHandle::terminate(self)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    fn sink(this: &Arc<Self>) -> TargetEventSink {
        let weak: Weak<SessionInner> = Arc::downgrade(this);
        TargetEventSink::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.observe(event);
            }
        })
    }

    fn is_exited(&self) -> bool {
        *self.lock_state() == SessionState::Exited
    }

    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        let mut state = self.lock_state();
        if from.contains(&state) {
            debug!(session = %self.id, from = %*state, to = %to, "Session state changed");
            *state = to;
            self.state_changed.notify_all();
            true
        } else {
            false
        }
    }

    /// Moves to `Exited` and cancels pending connection attempts. Returns
    /// `false` if the session had already exited.
    fn mark_exited(&self) -> bool {
        {
            let mut state = self.lock_state();
            if *state == SessionState::Exited {
                return false;
            }
            debug!(session = %self.id, from = %*state, "Session exited");
            *state = SessionState::Exited;
            self.state_changed.notify_all();
        }
        lock(&self.cancel_tx).take();
        true
    }

    fn exit_with(&self, exit_code: Option<i64>, reason: Option<String>) {
        if self.mark_exited() {
            lock(&self.connection).take();
            self.forward(RawTargetEvent::TargetExited { exit_code, reason });
        }
    }

    fn forward(&self, event: RawTargetEvent) {
        if self.events.send(event).is_err() {
            debug!(session = %self.id, "Event router is gone, notification dropped");
        }
    }

    fn with_connection(
        &self,
        method: &'static str,
        f: impl FnOnce(&mut Box<dyn TargetConnection>) -> Result<()>,
    ) -> Result<()> {
        let mut connection = lock(&self.connection);
        match connection.as_mut() {
            Some(connection) => f(connection),
            None => Err(BridgeError::ProtocolMisuse(Cow::Owned(format!(
                "{method} requires a connected session, {} is {}",
                self.id,
                *self.lock_state()
            )))),
        }
    }

    /// Applies a target notification to the lifecycle and forwards it.
    /// Runs on the target's notification thread and never blocks on the host.
    fn observe(&self, event: RawTargetEvent) {
        match &event {
            RawTargetEvent::Log { .. } | RawTargetEvent::Output { .. } => {}
            _ if self.is_exited() => {
                debug!(session = %self.id, event = %event.kind(), "Dropping notification after exit");
                return;
            }
            RawTargetEvent::TargetExited { exit_code, reason } => {
                self.exit_with(*exit_code, reason.clone());
                return;
            }
            RawTargetEvent::UnhandledException { message, .. } => {
                if !self.exception_policy.on_unhandled(self.id, message) {
                    self.forward(event);
                    self.abort();
                    return;
                }
            }
            RawTargetEvent::TargetStarted => {
                self.transition(&[SessionState::Stopped], SessionState::Running);
            }
            other if other.kind().stops_target() => {
                self.transition(&[SessionState::Running], SessionState::Stopped);
            }
            _ => {}
        }
        self.forward(event);
    }

    /// Tears the session down after an unhandled exception. A concurrent
    /// `terminate` that got there first already reported the exit.
    fn abort(&self) {
        if !self.mark_exited() {
            debug!(session = %self.id, "Abort on exited session ignored");
            return;
        }
        if let Some(mut connection) = lock(&self.connection).take()
            && let Err(e) = connection.terminate()
        {
            warn!(session = %self.id, error = %e, "Failed to terminate target connection");
        }
        self.forward(RawTargetEvent::TargetExited {
            exit_code: None,
            reason: Some("aborted on unhandled exception".to_string()),
        });
    }

    fn connect_loop(self: Arc<Self>) {
        let max_attempts = self.config.max_connection_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if self.is_exited() {
                debug!(session = %self.id, "Connection attempts cancelled");
                return;
            }

            self.attempts.store(attempt, Ordering::SeqCst);
            info!(
                session = %self.id,
                attempt,
                max_attempts,
                target = %self.config.socket_addr(),
                "Connecting to target"
            );

            match self
                .connector
                .connect(&self.config, self.config.connection_timeout())
            {
                Ok(connection) => {
                    self.attach_connection(connection);
                    return;
                }
                Err(e) => {
                    warn!(session = %self.id, attempt, error = %e, "Connection attempt failed");
                    last_error = e.to_string();
                }
            }

            if attempt < max_attempts {
                match self
                    .cancel_rx
                    .recv_timeout(self.config.time_between_attempts())
                {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => {
                        debug!(session = %self.id, "Connection attempts cancelled");
                        return;
                    }
                }
            }
        }

        let err = BridgeError::ConnectionFailed {
            attempts: max_attempts,
            reason: last_error,
        };
        error!(session = %self.id, error = %err, "Giving up on target");
        self.exit_with(None, Some(err.to_string()));
    }

    fn attach_connection(self: &Arc<Self>, mut connection: Box<dyn TargetConnection>) {
        let mut slot = lock(&self.connection);
        if !self.transition(&[SessionState::Connecting], SessionState::Running) {
            debug!(session = %self.id, "Session left connecting mid-attempt, dropping connection");
            let _ = connection.terminate();
            return;
        }

        info!(session = %self.id, target = %self.config.socket_addr(), "Connected to target");
        self.forward(RawTargetEvent::TargetReady);

        if let Err(e) = connection.start(Self::sink(self)) {
            error!(session = %self.id, error = %e, "Failed to start target notifications");
            drop(slot);
            self.exit_with(None, Some(format!("failed to start notifications: {e}")));
            return;
        }
        *slot = Some(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ThreadInfo;
    use std::io;
    use std::sync::atomic::AtomicBool;

    struct RefusingConnector;

    impl TargetConnector for RefusingConnector {
        fn connect(
            &self,
            _config: &TargetConnectionConfig,
            _timeout: Duration,
        ) -> Result<Box<dyn TargetConnection>> {
            Err(io::Error::from(io::ErrorKind::ConnectionRefused).into())
        }
    }

    #[derive(Default)]
    struct NullConnection {
        terminated: Arc<AtomicBool>,
    }

    impl TargetConnection for NullConnection {
        fn start(&mut self, _events: TargetEventSink) -> Result<()> {
            Ok(())
        }

        fn resume(&mut self) -> Result<()> {
            Ok(())
        }

        fn interrupt(&mut self) -> Result<()> {
            Ok(())
        }

        fn terminate(&mut self) -> Result<()> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct AcceptingConnector {
        terminated: Arc<AtomicBool>,
    }

    impl TargetConnector for AcceptingConnector {
        fn connect(
            &self,
            _config: &TargetConnectionConfig,
            _timeout: Duration,
        ) -> Result<Box<dyn TargetConnection>> {
            Ok(Box::new(NullConnection {
                terminated: Arc::clone(&self.terminated),
            }))
        }
    }

    fn config(max_attempts: u32, delay_ms: u64) -> TargetConnectionConfig {
        TargetConnectionConfig::from_options(&format!(
            r#"{{"exe": "App.exe", "host": "127.0.0.1", "port": 55000, "maxAttempts": {max_attempts}, "delayMs": {delay_ms}}}"#
        ))
        .unwrap()
    }

    fn session(
        connector: Arc<dyn TargetConnector>,
        policy: ExceptionPolicy,
    ) -> (SessionHandle, Receiver<RawTargetEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (SessionHandle::new(config(2, 10), connector, policy, tx), rx)
    }

    fn connected(policy: ExceptionPolicy) -> (SessionHandle, Receiver<RawTargetEvent>) {
        let (session, rx) = session(Arc::new(AcceptingConnector::default()), policy);
        session.run().unwrap();
        assert!(session.wait_for_state(SessionState::Running, Duration::from_secs(2)));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            RawTargetEvent::TargetReady
        );
        (session, rx)
    }

    #[test]
    fn test_new_session_is_created() {
        let (session, _rx) = session(Arc::new(RefusingConnector), ExceptionPolicy::Continue);
        assert_eq!(session.current_state(), SessionState::Created);
        assert_eq!(session.attempts(), 0);
    }

    #[test]
    fn test_run_twice_is_protocol_misuse() {
        let (session, _rx) = connected(ExceptionPolicy::Continue);
        let result = session.run();
        assert!(matches!(result, Err(BridgeError::ProtocolMisuse(_))));
    }

    #[test]
    fn test_connection_failure_exits_after_max_attempts() {
        let (session, rx) = session(Arc::new(RefusingConnector), ExceptionPolicy::Continue);
        session.run().unwrap();
        assert!(session.wait_for_state(SessionState::Exited, Duration::from_secs(2)));
        assert_eq!(session.attempts(), 2);
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            RawTargetEvent::TargetExited { exit_code: None, reason: Some(_) }
        ));
    }

    #[test]
    fn test_stop_and_resume_cycle() {
        let (session, rx) = connected(ExceptionPolicy::Continue);
        let sink = session.event_sink();

        sink.emit(RawTargetEvent::BreakpointHit {
            thread: Some(ThreadInfo {
                id: 1,
                name: "main".to_string(),
                location: "Program.Main".to_string(),
            }),
            location: None,
        });
        assert_eq!(session.current_state(), SessionState::Stopped);
        assert!(matches!(rx.recv().unwrap(), RawTargetEvent::BreakpointHit { .. }));

        session.resume().unwrap();
        assert_eq!(session.current_state(), SessionState::Running);

        sink.emit(RawTargetEvent::TargetInterrupted { thread: None });
        assert_eq!(session.current_state(), SessionState::Stopped);
        sink.emit(RawTargetEvent::TargetStarted);
        assert_eq!(session.current_state(), SessionState::Running);
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let connector = AcceptingConnector::default();
        let terminated = Arc::clone(&connector.terminated);
        let (session, rx) = session(Arc::new(connector), ExceptionPolicy::Continue);
        session.run().unwrap();
        assert!(session.wait_for_state(SessionState::Running, Duration::from_secs(2)));
        let _ = rx.recv_timeout(Duration::from_secs(1));

        session.terminate().unwrap();
        session.terminate().unwrap();
        assert_eq!(session.current_state(), SessionState::Exited);
        assert!(terminated.load(Ordering::SeqCst));

        let exits: Vec<_> = rx
            .try_iter()
            .filter(|event| matches!(event, RawTargetEvent::TargetExited { .. }))
            .collect();
        assert_eq!(exits.len(), 1);
    }

    #[test]
    fn test_terminate_before_run_blocks_run() {
        let (session, _rx) = session(Arc::new(RefusingConnector), ExceptionPolicy::Continue);
        session.terminate().unwrap();
        assert!(matches!(session.run(), Err(BridgeError::ProtocolMisuse(_))));
    }

    #[test]
    fn test_resume_without_connection_is_misuse() {
        let (session, _rx) = session(Arc::new(RefusingConnector), ExceptionPolicy::Continue);
        assert!(matches!(session.resume(), Err(BridgeError::ProtocolMisuse(_))));
        assert!(matches!(session.interrupt(), Err(BridgeError::ProtocolMisuse(_))));
    }

    #[test]
    fn test_unhandled_exception_continue_policy_keeps_running() {
        let (session, rx) = connected(ExceptionPolicy::Continue);
        session.event_sink().emit(RawTargetEvent::UnhandledException {
            thread: None,
            message: "NullReferenceException".to_string(),
        });
        assert_eq!(session.current_state(), SessionState::Running);
        assert!(matches!(
            rx.recv().unwrap(),
            RawTargetEvent::UnhandledException { .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unhandled_exception_abort_policy_exits() {
        let (session, rx) = connected(ExceptionPolicy::Abort);
        session.event_sink().emit(RawTargetEvent::UnhandledException {
            thread: None,
            message: "NullReferenceException".to_string(),
        });
        assert_eq!(session.current_state(), SessionState::Exited);
        assert!(matches!(
            rx.recv().unwrap(),
            RawTargetEvent::UnhandledException { .. }
        ));
        assert!(matches!(
            rx.recv().unwrap(),
            RawTargetEvent::TargetExited { .. }
        ));
    }

    #[test]
    fn test_abort_after_terminate_reports_one_exit() {
        let (session, rx) = connected(ExceptionPolicy::Abort);
        session.terminate().unwrap();
        session.inner.abort();

        assert_eq!(session.current_state(), SessionState::Exited);
        let exits = rx
            .try_iter()
            .filter(|event| matches!(event, RawTargetEvent::TargetExited { .. }))
            .count();
        assert_eq!(exits, 1);
    }

    #[test]
    fn test_notifications_after_exit_are_dropped_except_output() {
        let (session, rx) = connected(ExceptionPolicy::Continue);
        session.terminate().unwrap();
        let _ = rx.try_iter().count();

        let sink = session.event_sink();
        sink.emit(RawTargetEvent::TargetStarted);
        sink.emit(RawTargetEvent::TargetExited {
            exit_code: Some(0),
            reason: None,
        });
        sink.emit(RawTargetEvent::Output {
            stderr: false,
            text: "bye".to_string(),
        });

        let remaining: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            remaining,
            vec![RawTargetEvent::Output {
                stderr: false,
                text: "bye".to_string(),
            }]
        );
    }
}
