//! Inner engine that starts the debuggee and drives the handed-off session.

use sdb_bridge::{
    AttachReason, BreakpointRequest, EngineId, EventCallback, ExceptionInfo, ExecutionParameters,
    HostEvent, InnerEngine, PendingBreakpoint, ProcessRef, ProgramRef, RemoteSession,
    SessionControl, SessionTransport, Status,
};
use std::collections::HashMap;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Environment variable the soft debugger runtime reads its agent options from.
pub const AGENT_OPTIONS_ENV: &str = "MONO_ENV_OPTIONS";

pub const PROCESS_ENGINE_ID: &str = "sdb-process-engine";

#[derive(Default)]
struct ProcessState {
    child: Option<Child>,
    executable: String,
    remote: Option<RemoteSession>,
    next_breakpoint_id: u64,
    breakpoints: Vec<PendingBreakpoint>,
    exceptions: Vec<ExceptionInfo>,
    metrics: HashMap<String, serde_json::Value>,
}

#[derive(Default)]
pub struct ProcessEngine {
    state: Mutex<ProcessState>,
}

fn agent_options(remote: &RemoteSession) -> String {
    format!(
        "--debug --debugger-agent=transport=dt_socket,address={},server=y,suspend=y",
        remote.config().socket_addr()
    )
}

impl ProcessEngine {
    fn lock(&self) -> MutexGuard<'_, ProcessState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Breakpoints created so far, in creation order.
    pub fn breakpoints(&self) -> Vec<PendingBreakpoint> {
        self.lock().breakpoints.clone()
    }

    pub fn exceptions(&self) -> Vec<ExceptionInfo> {
        self.lock().exceptions.clone()
    }

    pub fn metric(&self, name: &str) -> Option<serde_json::Value> {
        self.lock().metrics.get(name).cloned()
    }

    fn with_remote(
        &self,
        method: &'static str,
        f: impl FnOnce(&RemoteSession) -> sdb_bridge::Result<()>,
    ) -> Status {
        let state = self.lock();
        let Some(remote) = state.remote.as_ref() else {
            warn!(method, "No session has been handed to the engine");
            return Status::False;
        };
        match f(remote) {
            Ok(()) => Status::Ok,
            Err(e) => {
                error!(method, error = %e, "Remote session call failed");
                e.status()
            }
        }
    }

    fn owns(&self, process: &ProcessRef) -> bool {
        self.lock()
            .child
            .as_ref()
            .is_some_and(|child| child.id() == process.pid)
    }
}

impl InnerEngine for ProcessEngine {
    fn launch_suspended(
        &self,
        params: &ExecutionParameters,
        options: &str,
        _callback: Arc<dyn EventCallback>,
    ) -> Result<ProcessRef, Status> {
        let remote = SessionTransport::unpackage(options).map_err(|e| {
            error!(error = %e, "Failed to claim session from launch options");
            e.status()
        })?;

        let mut command = Command::new(&params.executable);
        command
            .args(&params.args)
            .envs(params.env.iter().cloned())
            .env(AGENT_OPTIONS_ENV, agent_options(&remote));
        if let Some(dir) = &params.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            error!(executable = %params.executable, error = %e, "Failed to start target process");
            Status::E_FAIL
        })?;
        let process = ProcessRef { pid: child.id() };
        info!(
            executable = %params.executable,
            pid = process.pid,
            session = %remote.session_id(),
            "Started target process"
        );

        let mut state = self.lock();
        if let Some(mut previous) = state.child.take() {
            let _ = previous.kill();
            let _ = previous.wait();
        }
        state.child = Some(child);
        state.executable.clone_from(&params.executable);
        state.remote = Some(remote);
        Ok(process)
    }

    fn attach(
        &self,
        programs: &[ProgramRef],
        _callback: Arc<dyn EventCallback>,
        reason: AttachReason,
    ) -> Status {
        debug!(programs = programs.len(), reason = ?reason, "Engine attached");
        Status::Ok
    }

    fn destroy_program(&self, program: &ProgramRef) -> Status {
        debug!(program = %program.name, "Program destroyed");
        Status::Ok
    }

    fn enum_programs(&self) -> Result<Vec<ProgramRef>, Status> {
        let state = self.lock();
        Ok(state
            .child
            .as_ref()
            .map(|child| ProgramRef {
                id: u64::from(child.id()),
                name: state.executable.clone(),
            })
            .into_iter()
            .collect())
    }

    fn create_pending_breakpoint(
        &self,
        request: &BreakpointRequest,
    ) -> Result<PendingBreakpoint, Status> {
        if request.line == 0 {
            return Err(Status::False);
        }
        let mut state = self.lock();
        state.next_breakpoint_id += 1;
        let breakpoint = PendingBreakpoint {
            id: state.next_breakpoint_id,
            request: request.clone(),
        };
        state.breakpoints.push(breakpoint.clone());
        Ok(breakpoint)
    }

    fn set_exception(&self, exceptions: &[ExceptionInfo]) -> Status {
        let mut state = self.lock();
        for exception in exceptions {
            if !state.exceptions.contains(exception) {
                state.exceptions.push(exception.clone());
            }
        }
        Status::Ok
    }

    fn remove_set_exception(&self, exceptions: &[ExceptionInfo]) -> Status {
        self.lock()
            .exceptions
            .retain(|exception| !exceptions.contains(exception));
        Status::Ok
    }

    fn remove_all_set_exceptions(&self, guid_type: &str) -> Status {
        self.lock()
            .exceptions
            .retain(|exception| exception.guid_type != guid_type);
        Status::Ok
    }

    fn set_locale(&self, lang_id: u16) -> Status {
        debug!(lang_id, "Locale ignored by process engine");
        Status::Ok
    }

    fn set_registry_root(&self, registry_root: &str) -> Status {
        debug!(registry_root, "Registry root ignored by process engine");
        Status::Ok
    }

    fn set_metric(&self, metric: &str, value: &serde_json::Value) -> Status {
        self.lock()
            .metrics
            .insert(metric.to_string(), value.clone());
        Status::Ok
    }

    fn cause_break(&self) -> Status {
        self.with_remote("CauseBreak", |remote| remote.interrupt())
    }

    fn resume_process(&self, process: &ProcessRef) -> Status {
        if !self.owns(process) {
            return Status::False;
        }
        self.with_remote("ResumeProcess", |remote| remote.resume())
    }

    fn can_terminate_process(&self, process: &ProcessRef) -> Status {
        if self.owns(process) {
            Status::Ok
        } else {
            Status::False
        }
    }

    fn terminate_process(&self, process: &ProcessRef) -> Status {
        if !self.owns(process) {
            return Status::False;
        }
        let status = self.with_remote("TerminateProcess", |remote| remote.terminate());

        if let Some(mut child) = self.lock().child.take() {
            if let Err(e) = child.kill() {
                debug!(pid = process.pid, error = %e, "Target process already gone");
            }
            let _ = child.wait();
        }
        status
    }

    fn continue_from_synchronous_event(&self, _event: &HostEvent) -> Status {
        Status::Ok
    }

    fn get_engine_id(&self) -> Result<EngineId, Status> {
        Ok(EngineId(PROCESS_ENGINE_ID.to_string()))
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        if let Some(mut child) = self.lock().child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
