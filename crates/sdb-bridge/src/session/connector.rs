use serde::Serialize;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::TargetConnectionConfig;
use crate::error::Result;
use crate::protocol::RawTargetEvent;

/// Handshake exchanged right after the socket connects.
pub const HANDSHAKE: &[u8] = b"DWP-Handshake";

/// Receives notifications from a target connection's notification thread.
#[derive(Clone)]
pub struct TargetEventSink {
    inner: Arc<dyn Fn(RawTargetEvent) + Send + Sync>,
}

impl TargetEventSink {
    pub fn new(f: impl Fn(RawTargetEvent) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn emit(&self, event: RawTargetEvent) {
        (self.inner)(event)
    }
}

impl fmt::Debug for TargetEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetEventSink").finish_non_exhaustive()
    }
}

/// Performs a single, bounded connection attempt.
pub trait TargetConnector: Send + Sync {
    fn connect(
        &self,
        config: &TargetConnectionConfig,
        timeout: Duration,
    ) -> Result<Box<dyn TargetConnection>>;
}

/// A live connection to the target runtime.
///
/// A connection must not deliver notifications before `start` is called.
pub trait TargetConnection: Send {
    fn start(&mut self, events: TargetEventSink) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    fn interrupt(&mut self) -> Result<()>;
    fn terminate(&mut self) -> Result<()>;
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
enum TargetCommand {
    Resume,
    Interrupt,
    Terminate,
}

/// Connects over TCP to a debugger agent listening in the target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TargetConnector for TcpConnector {
    fn connect(
        &self,
        config: &TargetConnectionConfig,
        timeout: Duration,
    ) -> Result<Box<dyn TargetConnection>> {
        let mut stream = TcpStream::connect_timeout(&config.socket_addr(), timeout)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(config.socket_timeout()))?;
        stream.set_read_timeout(Some(timeout))?;

        stream.write_all(HANDSHAKE)?;
        let mut reply = [0u8; HANDSHAKE.len()];
        stream.read_exact(&mut reply)?;
        if reply != HANDSHAKE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "unexpected handshake reply '{}'",
                    String::from_utf8_lossy(&reply)
                ),
            )
            .into());
        }

        // Notifications may be arbitrarily far apart.
        stream.set_read_timeout(None)?;
        debug!(addr = %config.socket_addr(), "Handshake with target completed");

        Ok(Box::new(TcpConnection {
            stream,
            reader: None,
        }))
    }
}

pub struct TcpConnection {
    stream: TcpStream,
    reader: Option<JoinHandle<()>>,
}

impl TcpConnection {
    fn send(&mut self, command: TargetCommand) -> Result<()> {
        let mut line = serde_json::to_vec(&command).map_err(io::Error::from)?;
        line.push(b'\n');
        self.stream.write_all(&line)?;
        self.stream.flush()?;
        Ok(())
    }
}

impl TargetConnection for TcpConnection {
    fn start(&mut self, events: TargetEventSink) -> Result<()> {
        let reader = BufReader::new(self.stream.try_clone()?);
        let handle = thread::Builder::new()
            .name("sdb-target-events".to_string())
            .spawn(move || read_notifications(reader, events))?;
        self.reader = Some(handle);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.send(TargetCommand::Resume)
    }

    fn interrupt(&mut self) -> Result<()> {
        self.send(TargetCommand::Interrupt)
    }

    fn terminate(&mut self) -> Result<()> {
        let sent = self.send(TargetCommand::Terminate);
        // The reader thread exits once the socket is shut down. It may be the
        // caller itself when a notification triggers the teardown.
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take()
            && reader.thread().id() != thread::current().id()
        {
            let _ = reader.join();
        }
        sent
    }
}

fn read_notifications(reader: impl BufRead, events: TargetEventSink) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "Target notification stream closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RawTargetEvent>(&line) {
            Ok(event) => events.emit(event),
            Err(e) => warn!(error = %e, line = %line, "Skipping undecodable target notification"),
        }
    }

    events.emit(RawTargetEvent::TargetExited {
        exit_code: None,
        reason: Some("target connection closed".to_string()),
    });
}
