//! Host-facing command surface.
//!
//! The bridge owns at most one launch at a time. A launch carries the session,
//! its event router and the delivery state that decides where normalized
//! events go: buffered until the first attach, dispatched to the bound
//! callback while a program is attached, and dropped after the program is
//! destroyed.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::{BridgeSettings, TargetConnectionConfig};
use crate::engine::{
    AttachReason, BreakpointRequest, ExceptionInfo, ExecutionParameters, InnerEngine,
    PendingBreakpoint,
};
use crate::error::{BridgeError, Result, Status};
use crate::host::{
    EngineId, EventAttributes, EventCallback, EventEnvelope, HostEvent, HostEventType, ProcessRef,
    ProgramRef, ThreadRecord,
};
use crate::protocol::{EventKind, NormalizedEvent, ThreadInfo};
use crate::router::{EventRouter, NormalizedEventSink};
use crate::session::{SessionHandle, SessionState, TargetConnector};
use crate::transport::SessionTransport;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
struct Binding {
    program: ProgramRef,
    callback: Arc<dyn EventCallback>,
}

#[derive(Default)]
struct DeliveryState {
    binding: Option<Binding>,
    destroyed: bool,
    pending: VecDeque<NormalizedEvent>,
    threads: BTreeMap<i64, ThreadRecord>,
    rejected: HashSet<i64>,
    process: Option<ProcessRef>,
}

/// Where the router's events end up. Binding, buffering and the thread
/// registry share one lock so attach, destroy and delivery are atomic with
/// respect to each other. The callback runs under that lock and must not
/// call back into the bridge.
struct Delivery {
    engine: EngineId,
    state: Mutex<DeliveryState>,
}

impl Delivery {
    fn new() -> Self {
        Self {
            engine: EngineId::bridge(),
            state: Mutex::default(),
        }
    }

    fn set_process(&self, process: ProcessRef) {
        lock(&self.state).process = Some(process);
    }

    fn bind(&self, program: ProgramRef, callback: Arc<dyn EventCallback>) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(binding) = &state.binding {
            return Err(BridgeError::InvalidAttachRequest(Cow::Owned(format!(
                "program {} is already attached",
                binding.program.name
            ))));
        }

        state.binding = Some(Binding { program, callback });
        state.destroyed = false;

        let pending = mem::take(&mut state.pending);
        if !pending.is_empty() {
            debug!(count = pending.len(), "Flushing events received before attach");
        }
        for event in pending {
            self.dispatch(&mut state, event);
        }
        Ok(())
    }

    fn unbind(&self) -> bool {
        let mut state = lock(&self.state);
        state.destroyed = true;
        state.pending.clear();
        state.threads.clear();
        state.rejected.clear();
        state.binding.take().is_some()
    }

    fn threads(&self) -> Vec<ThreadRecord> {
        lock(&self.state).threads.values().cloned().collect()
    }

    fn register(&self, record: ThreadRecord) -> Result<()> {
        let mut state = lock(&self.state);
        let Some(binding) = state.binding.clone() else {
            return Err(BridgeError::ThreadRegistrationFailed {
                thread_id: record.id,
                reason: "no program is attached".to_string(),
            });
        };
        if state.threads.contains_key(&record.id) {
            return Ok(());
        }
        self.register_locked(&mut state, &binding, record)
    }

    fn register_locked(
        &self,
        state: &mut DeliveryState,
        binding: &Binding,
        mut record: ThreadRecord,
    ) -> Result<()> {
        record.first_seen = true;
        let thread_id = record.id;
        let envelope = EventEnvelope {
            engine: self.engine.clone(),
            process: state.process.clone(),
            program: binding.program.clone(),
            thread: Some(record.clone()),
            event: HostEvent::ThreadCreate,
            event_type: HostEventType::ThreadCreate,
            attributes: EventAttributes::of(&HostEvent::ThreadCreate),
        };

        match binding.callback.event(envelope) {
            Status::Ok => {
                debug!(
                    method = "CreateAndRegisterThread",
                    thread_id,
                    name = %record.name,
                    "Registered thread"
                );
                record.first_seen = false;
                state.threads.insert(thread_id, record);
                state.rejected.remove(&thread_id);
                Ok(())
            }
            status => Err(BridgeError::ThreadRegistrationFailed {
                thread_id,
                reason: format!("callback returned {status}"),
            }),
        }
    }

    /// Resolve the record for `thread`, registering it first if the host has
    /// not seen it. `None` means events for this thread must be dropped.
    fn resolve_thread(
        &self,
        state: &mut DeliveryState,
        binding: &Binding,
        thread: &ThreadInfo,
    ) -> Option<ThreadRecord> {
        if let Some(record) = state.threads.get_mut(&thread.id) {
            if !thread.location.is_empty() {
                record.location.clone_from(&thread.location);
            }
            if !thread.name.is_empty() {
                record.name.clone_from(&thread.name);
            }
            return Some(record.clone());
        }

        if state.rejected.contains(&thread.id) {
            return None;
        }

        match self.register_locked(state, binding, ThreadRecord::from(thread)) {
            Ok(()) => state.threads.get(&thread.id).cloned(),
            Err(e) => {
                error!(method = "CreateAndRegisterThread", thread_id = thread.id, error = %e, "Dropping events for thread");
                state.rejected.insert(thread.id);
                None
            }
        }
    }

    fn dispatch(&self, state: &mut DeliveryState, event: NormalizedEvent) {
        let Some(binding) = state.binding.clone() else {
            return;
        };

        let record = match &event.thread {
            Some(thread) => match self.resolve_thread(state, &binding, thread) {
                // The registration is the host's thread-create event.
                Some(_) if event.kind == EventKind::ThreadStarted => return,
                Some(record) => Some(record),
                None => return,
            },
            None => None,
        };

        let kind = event.kind;
        let event = HostEvent::Target(event);
        let envelope = EventEnvelope {
            engine: self.engine.clone(),
            process: state.process.clone(),
            program: binding.program.clone(),
            thread: record,
            event_type: HostEventType::of(&event),
            attributes: EventAttributes::of(&event),
            event,
        };

        let status = binding.callback.event(envelope);
        if !status.is_ok() {
            warn!(method = "Event", event = %kind, status = %status, "Host did not accept event");
        }
    }
}

impl NormalizedEventSink for Delivery {
    fn deliver(&self, event: NormalizedEvent) {
        let mut state = lock(&self.state);
        if state.binding.is_some() {
            self.dispatch(&mut state, event);
        } else if state.destroyed {
            debug!(event = %event.kind, "Program destroyed, dropping event");
        } else {
            state.pending.push_back(event);
        }
    }
}

struct Launch {
    session: SessionHandle,
    delivery: Arc<Delivery>,
    _router: EventRouter,
}

/// The engine the host talks to. Wraps an inner engine and adds the session
/// lifecycle, event translation and session handoff around it.
pub struct HostBridge<E> {
    engine: E,
    connector: Arc<dyn TargetConnector>,
    settings: BridgeSettings,
    transport: SessionTransport,
    launch: Mutex<Option<Launch>>,
}

impl<E: InnerEngine> HostBridge<E> {
    pub fn new(
        engine: E,
        connector: Arc<dyn TargetConnector>,
        settings: BridgeSettings,
    ) -> Result<Self> {
        Ok(Self {
            engine,
            connector,
            settings,
            transport: SessionTransport::bind()?,
            launch: Mutex::new(None),
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Session of the current launch, if any.
    pub fn session(&self) -> Option<SessionHandle> {
        lock(&self.launch)
            .as_ref()
            .map(|launch| launch.session.clone())
    }

    /// Threads registered with the host, ordered by id.
    pub fn threads(&self) -> Vec<ThreadRecord> {
        lock(&self.launch)
            .as_ref()
            .map(|launch| launch.delivery.threads())
            .unwrap_or_default()
    }

    /// Build the session for `options`, hand it off through a transport token
    /// and let the inner engine start the process with that token.
    pub fn launch_suspended(
        &self,
        options: &str,
        params: &ExecutionParameters,
        callback: Arc<dyn EventCallback>,
    ) -> Result<ProcessRef> {
        debug!(method = "LaunchSuspended", executable = %params.executable);
        let config = TargetConnectionConfig::from_options(options)?;

        let mut launch = lock(&self.launch);
        if let Some(previous) = launch.take() {
            self.transport.revoke(previous.session.id());
            if let Err(e) = previous.session.terminate() {
                warn!(session = %previous.session.id(), error = %e, "Failed to terminate previous session");
            }
        }

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let session = SessionHandle::new(
            config.clone(),
            Arc::clone(&self.connector),
            self.settings.exception_policy,
            events_tx,
        );
        let delivery = Arc::new(Delivery::new());
        let router = EventRouter::spawn(
            events_rx,
            Arc::clone(&delivery) as Arc<dyn NormalizedEventSink>,
            config.verbose_logging(),
        )?;

        let token = self.transport.package(&session, &config)?;
        let process = match self
            .engine
            .launch_suspended(params, token.as_str(), callback)
        {
            Ok(process) => process,
            Err(status) => {
                error!(method = "LaunchSuspended", status = %status, "Inner engine failed to launch");
                self.transport.revoke(session.id());
                return Err(BridgeError::Engine(status));
            }
        };

        info!(
            session = %session.id(),
            pid = process.pid,
            target = %config.socket_addr(),
            "Launched suspended"
        );
        delivery.set_process(process.clone());
        *launch = Some(Launch {
            session,
            delivery,
            _router: router,
        });
        Ok(process)
    }

    /// Bind the single program and callback, then start connecting. A
    /// connection failure is not reported here; it arrives later as an
    /// exited event.
    pub fn attach(
        &self,
        programs: &[ProgramRef],
        callback: Arc<dyn EventCallback>,
        reason: AttachReason,
    ) -> Status {
        debug!(method = "Attach", programs = programs.len(), reason = ?reason);

        let [program] = programs else {
            let err = BridgeError::InvalidAttachRequest(Cow::Borrowed(
                "the engine can only be attached to one program at a time",
            ));
            error!(method = "Attach", error = %err);
            return err.status();
        };

        let session = {
            let launch = lock(&self.launch);
            let Some(launch) = launch.as_ref() else {
                error!(method = "Attach", "No launched session to attach to");
                return Status::False;
            };
            if let Err(e) = launch.delivery.bind(program.clone(), Arc::clone(&callback)) {
                error!(method = "Attach", error = %e);
                return e.status();
            }
            launch.session.clone()
        };

        if session.current_state() == SessionState::Created
            && let Err(e) = session.run()
        {
            error!(method = "Attach", session = %session.id(), error = %e, "Failed to start session");
        }

        self.engine.attach(programs, callback, reason)
    }

    /// Clears the binding whatever the session state. The session itself
    /// keeps running.
    pub fn destroy_program(&self, program: &ProgramRef) -> Status {
        debug!(method = "DestroyProgram", program = %program.name);
        if let Some(launch) = lock(&self.launch).as_ref()
            && !launch.delivery.unbind()
        {
            debug!(method = "DestroyProgram", "No program was attached");
        }
        self.engine.destroy_program(program)
    }

    /// Tell the host about `record`. Registering a known thread is a no-op.
    pub fn create_and_register_thread(&self, record: ThreadRecord) -> Result<()> {
        debug!(method = "CreateAndRegisterThread", thread_id = record.id);
        let delivery = lock(&self.launch)
            .as_ref()
            .map(|launch| Arc::clone(&launch.delivery));
        match delivery {
            Some(delivery) => delivery.register(record),
            None => Err(BridgeError::ThreadRegistrationFailed {
                thread_id: record.id,
                reason: "no launched session".to_string(),
            }),
        }
    }

    pub fn enum_programs(&self) -> std::result::Result<Vec<ProgramRef>, Status> {
        debug!(method = "EnumPrograms");
        self.engine.enum_programs()
    }

    pub fn create_pending_breakpoint(
        &self,
        request: &BreakpointRequest,
    ) -> std::result::Result<PendingBreakpoint, Status> {
        debug!(method = "CreatePendingBreakpoint", file = %request.file, line = request.line);
        self.engine.create_pending_breakpoint(request)
    }

    pub fn set_exception(&self, exceptions: &[ExceptionInfo]) -> Status {
        debug!(method = "SetException", count = exceptions.len());
        self.engine.set_exception(exceptions)
    }

    pub fn remove_set_exception(&self, exceptions: &[ExceptionInfo]) -> Status {
        debug!(method = "RemoveSetException", count = exceptions.len());
        self.engine.remove_set_exception(exceptions)
    }

    pub fn remove_all_set_exceptions(&self, guid_type: &str) -> Status {
        debug!(method = "RemoveAllSetExceptions", guid_type);
        self.engine.remove_all_set_exceptions(guid_type)
    }

    pub fn set_locale(&self, lang_id: u16) -> Status {
        debug!(method = "SetLocale", lang_id);
        self.engine.set_locale(lang_id)
    }

    pub fn set_registry_root(&self, registry_root: &str) -> Status {
        debug!(method = "SetRegistryRoot", registry_root);
        self.engine.set_registry_root(registry_root)
    }

    pub fn set_metric(&self, metric: &str, value: &serde_json::Value) -> Status {
        debug!(method = "SetMetric", metric);
        self.engine.set_metric(metric, value)
    }

    pub fn cause_break(&self) -> Status {
        debug!(method = "CauseBreak");
        self.engine.cause_break()
    }

    pub fn resume_process(&self, process: &ProcessRef) -> Status {
        debug!(method = "ResumeProcess", pid = process.pid);
        self.engine.resume_process(process)
    }

    pub fn can_terminate_process(&self, process: &ProcessRef) -> Status {
        debug!(method = "CanTerminateProcess", pid = process.pid);
        self.engine.can_terminate_process(process)
    }

    pub fn terminate_process(&self, process: &ProcessRef) -> Status {
        debug!(method = "TerminateProcess", pid = process.pid);
        self.engine.terminate_process(process)
    }

    pub fn continue_from_synchronous_event(&self, event: &HostEvent) -> Status {
        debug!(method = "ContinueFromSynchronousEvent");
        self.engine.continue_from_synchronous_event(event)
    }

    /// Always this bridge's id, whatever the inner engine reports.
    pub fn get_engine_id(&self) -> std::result::Result<EngineId, Status> {
        debug!(method = "GetEngineId");
        if let Err(status) = self.engine.get_engine_id() {
            debug!(method = "GetEngineId", status = %status, "Inner engine id unavailable");
        }
        Ok(EngineId::bridge())
    }
}
