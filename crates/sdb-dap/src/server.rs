use crossbeam_channel::{Receiver, select};
use dap::prelude::*;
use dap::server::ServerOutput;
use sdb_bridge::{BridgeSettings, EventEnvelope};
use std::borrow::Cow;
use std::io::{self, BufReader, BufWriter, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::adapter::{self, DapAdapter};
use crate::error::DapAdapterError;
use crate::log::DebugConsoleWriter;

type DynResult<T> = miette::Result<T, Box<dyn std::error::Error + Send + Sync>>;

const FALLBACK_LOG_FILTER: &str = "sdb_bridge=info,sdb_dap=info";

/// Runs the adapter over stdin and stdout until the client disconnects.
/// `log_filter` overrides the filter taken from the environment.
pub fn start(log_filter: Option<String>) -> DynResult<()> {
    let settings = BridgeSettings::from_env();
    let (debug_writer, log_rx) = DebugConsoleWriter::new();

    let filter = log_filter.unwrap_or_else(|| settings.log_filter.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new(FALLBACK_LOG_FILTER)),
        )
        .with_ansi(false)
        .with_writer(debug_writer)
        .init();

    info!("Starting sdb-dap debug adapter");

    let mut adapter = DapAdapter::new(settings)?;
    let reader = BufReader::new(io::stdin());
    let writer = BufWriter::new(io::stdout());
    let mut server = Server::new(reader, writer);

    // First, the client sends an initialize request
    let req = match server.poll_request()? {
        Some(req) => req,
        None => {
            return Err(Box::new(DapAdapterError::ProtocolError(Cow::Borrowed(
                "Missing initialize request",
            ))));
        }
    };

    if let Command::Initialize(_) = &req.command {
        let capabilities = types::Capabilities {
            supports_configuration_done_request: Some(true),
            supports_conditional_breakpoints: Some(true),
            supports_terminate_request: Some(true),
            ..Default::default()
        };
        let rsp = req.success(ResponseBody::Initialize(capabilities));
        server.respond(rsp)?;
        server.send_event(Event::Initialized)?;
    } else {
        return Err(Box::new(DapAdapterError::ProtocolError(Cow::Borrowed(
            "Expected initialize request",
        ))));
    }

    let output = Arc::clone(&server.output);
    let host_event_rx = adapter.host_event_rx();
    thread::Builder::new()
        .name("sdb-dap-events".to_string())
        .spawn(move || pump_events(output, host_event_rx, log_rx))?;

    loop {
        match server.poll_request()? {
            Some(req) => {
                debug!(seq = req.seq, "Received request");
                if let Err(e) = adapter.handle_request(req, &mut server) {
                    if e.downcast_ref::<DapAdapterError>()
                        .is_some_and(DapAdapterError::is_shutdown)
                    {
                        info!("Shutting down");
                        break;
                    }
                    error!(error = %e, "Failed to handle DAP request");
                }
            }
            None => {
                info!("Client disconnected or stream ended");
                break;
            }
        }
    }

    Ok(())
}

/// Forwards host events and log lines to the client as they arrive, so
/// stops and exits reach it without waiting for the next request.
fn pump_events<W: Write>(
    output: Arc<Mutex<ServerOutput<W>>>,
    host_event_rx: Receiver<EventEnvelope>,
    log_rx: Receiver<String>,
) {
    loop {
        let events = select! {
            recv(host_event_rx) -> envelope => match envelope {
                Ok(envelope) => adapter::host_events(&envelope),
                Err(_) => break,
            },
            recv(log_rx) -> line => match line {
                Ok(line) => vec![adapter::log_output(&line)],
                Err(_) => break,
            },
        };

        let mut output = output.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for event in events {
            if let Err(e) = output.send_event(event) {
                // Logging here would feed back into this loop.
                eprintln!("Failed to send event: {}", e);
                return;
            }
        }
    }
}
