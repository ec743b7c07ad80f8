//! The inner generic engine the bridge delegates to.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Status;
use crate::host::{EngineId, EventCallback, HostEvent, ProcessRef, ProgramRef};

/// Parameters for starting the debuggee, passed through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionParameters {
    pub server: Option<String>,
    pub executable: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub launch_flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachReason {
    #[default]
    Launch,
    User,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointRequest {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBreakpoint {
    pub id: u64,
    pub request: BreakpointRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub name: String,
    pub guid_type: String,
    pub break_first_chance: bool,
}

/// Generic engine behind the bridge. Every method here is reached through a
/// pure delegation on `HostBridge` except `launch_suspended`, which receives
/// the transport token in place of the raw launch options.
pub trait InnerEngine: Send + Sync {
    fn launch_suspended(
        &self,
        params: &ExecutionParameters,
        options: &str,
        callback: Arc<dyn EventCallback>,
    ) -> Result<ProcessRef, Status>;

    fn attach(
        &self,
        programs: &[ProgramRef],
        callback: Arc<dyn EventCallback>,
        reason: AttachReason,
    ) -> Status;

    fn destroy_program(&self, program: &ProgramRef) -> Status;

    fn enum_programs(&self) -> Result<Vec<ProgramRef>, Status>;

    fn create_pending_breakpoint(
        &self,
        request: &BreakpointRequest,
    ) -> Result<PendingBreakpoint, Status>;

    fn set_exception(&self, exceptions: &[ExceptionInfo]) -> Status;

    fn remove_set_exception(&self, exceptions: &[ExceptionInfo]) -> Status;

    fn remove_all_set_exceptions(&self, guid_type: &str) -> Status;

    fn set_locale(&self, lang_id: u16) -> Status;

    fn set_registry_root(&self, registry_root: &str) -> Status;

    fn set_metric(&self, metric: &str, value: &serde_json::Value) -> Status;

    fn cause_break(&self) -> Status;

    fn resume_process(&self, process: &ProcessRef) -> Status;

    fn can_terminate_process(&self, process: &ProcessRef) -> Status;

    fn terminate_process(&self, process: &ProcessRef) -> Status;

    fn continue_from_synchronous_event(&self, event: &HostEvent) -> Status;

    fn get_engine_id(&self) -> Result<EngineId, Status>;
}
