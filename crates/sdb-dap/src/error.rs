use dap::prelude::Command;
use sdb_bridge::{BridgeError, Status};
use std::borrow::Cow;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DapAdapterError {
    #[error("Unhandled command: {0:?}")]
    UnhandledCommand(Command),
    #[error("Protocol error: {0}")]
    ProtocolError(Cow<'static, str>),
    #[error("Failed to deserialize launch arguments: {0}")]
    LaunchArgumentsError(serde_json::Error),
    #[error("Missing launch arguments")]
    MissingLaunchArguments,
    #[error("No program has been launched")]
    NotLaunched,
    #[error("{method} returned {status}")]
    HostCommand { method: &'static str, status: Status },
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl DapAdapterError {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, DapAdapterError::ProtocolError(msg) if msg == "Shutdown")
    }
}
