//! Hand a live session to another component.
//!
//! The owner keeps the session. A token carries the loopback endpoint of the
//! owner's RPC listener plus a one-shot registration; whoever claims it gets
//! a [`RemoteSession`] that forwards every call back to the owner.

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TargetConnectionConfig;
use crate::error::{BridgeError, Result};
use crate::session::{SessionControl, SessionHandle, SessionId, SessionState};

const TOKEN_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct TokenPayload {
    version: u32,
    endpoint: SocketAddr,
    registration: String,
    session: SessionId,
    config: TargetConnectionConfig,
}

/// Opaque, base64 encoded handoff token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportToken(String);

impl TransportToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn encode(payload: &TokenPayload) -> Result<Self> {
        let json =
            serde_json::to_vec(payload).map_err(|e| BridgeError::SerializationFailed(e.to_string()))?;
        Ok(Self(BASE64_STANDARD.encode(json)))
    }

    fn decode(token: &str) -> Result<TokenPayload> {
        let bytes = BASE64_STANDARD
            .decode(token.trim())
            .map_err(|e| BridgeError::TransportCorrupt(e.to_string()))?;
        let payload: TokenPayload = serde_json::from_slice(&bytes)
            .map_err(|e| BridgeError::TransportCorrupt(e.to_string()))?;
        if payload.version != TOKEN_VERSION {
            return Err(BridgeError::TransportCorrupt(format!(
                "unsupported token version {}",
                payload.version
            )));
        }
        Ok(payload)
    }
}

impl fmt::Display for TransportToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SessionRequest {
    Claim { registration: String },
    State,
    Run,
    Resume,
    Interrupt,
    Terminate,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SessionResponse {
    Claimed,
    Ok,
    State { state: SessionState },
    Error { code: ErrorCode, message: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum ErrorCode {
    AlreadyClaimed,
    UnknownRegistration,
    NotClaimed,
    Malformed,
    ProtocolMisuse,
    Failed,
}

impl SessionResponse {
    fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        SessionResponse::Error {
            code,
            message: message.into(),
        }
    }

    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => SessionResponse::Ok,
            Err(BridgeError::ProtocolMisuse(message)) => {
                SessionResponse::error(ErrorCode::ProtocolMisuse, message)
            }
            Err(e) => SessionResponse::error(ErrorCode::Failed, e.to_string()),
        }
    }
}

struct Registration {
    session: SessionHandle,
    claimed: bool,
}

type Registry = Arc<Mutex<HashMap<String, Registration>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owner side: registers sessions and serves proxied calls on loopback.
pub struct SessionTransport {
    endpoint: SocketAddr,
    registry: Registry,
    shutdown: Arc<AtomicBool>,
}

impl SessionTransport {
    pub fn bind() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let endpoint = listener.local_addr()?;
        let registry: Registry = Arc::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        {
            let registry = Arc::clone(&registry);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("sdb-transport".to_string())
                .spawn(move || accept_loop(listener, registry, shutdown))?;
        }

        debug!(endpoint = %endpoint, "Session transport listening");
        Ok(Self {
            endpoint,
            registry,
            shutdown,
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Register `session` for remote invocation and produce its token.
    pub fn package(
        &self,
        session: &SessionHandle,
        config: &TargetConnectionConfig,
    ) -> Result<TransportToken> {
        let mut registry = lock(&self.registry);
        if registry
            .values()
            .any(|registration| registration.session.id() == session.id())
        {
            return Err(BridgeError::SerializationFailed(format!(
                "{} is already registered for remote invocation",
                session.id()
            )));
        }

        let registration = registration_nonce(session.id());
        let token = TransportToken::encode(&TokenPayload {
            version: TOKEN_VERSION,
            endpoint: self.endpoint,
            registration: registration.clone(),
            session: session.id(),
            config: config.clone(),
        })?;

        registry.insert(
            registration,
            Registration {
                session: session.clone(),
                claimed: false,
            },
        );
        info!(session = %session.id(), "Packaged session for handoff");
        Ok(token)
    }

    /// Drop the registration of `session`. Existing proxies stop working.
    pub fn revoke(&self, session: SessionId) -> bool {
        let mut registry = lock(&self.registry);
        let before = registry.len();
        registry.retain(|_, registration| registration.session.id() != session);
        before != registry.len()
    }

    /// Claim the session behind `token`.
    pub fn unpackage(token: &str) -> Result<RemoteSession> {
        let payload = TransportToken::decode(token)?;
        RemoteSession::claim(payload)
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the accept loop so it can observe the flag.
        let _ = TcpStream::connect(self.endpoint);
    }
}

fn registration_nonce(session: SessionId) -> String {
    format!("{}-{}", session.0, Uuid::new_v4())
}

fn accept_loop(listener: TcpListener, registry: Registry, shutdown: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let registry = Arc::clone(&registry);
                let spawned = thread::Builder::new()
                    .name("sdb-transport-conn".to_string())
                    .spawn(move || {
                        if let Err(e) = serve(stream, registry) {
                            debug!(error = %e, "Session transport connection closed");
                        }
                    });
                if let Err(e) = spawned {
                    warn!(error = %e, "Failed to spawn session transport handler");
                }
            }
            Err(e) => warn!(error = %e, "Failed to accept session transport connection"),
        }
    }
    debug!("Session transport stopped");
}

fn serve(stream: TcpStream, registry: Registry) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut claimed: Option<(String, SessionHandle)> = None;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<SessionRequest>(line.trim()) {
            Err(e) => SessionResponse::error(ErrorCode::Malformed, e.to_string()),
            Ok(SessionRequest::Claim { registration }) => {
                claim(&registry, registration, &mut claimed)
            }
            Ok(request) => match &claimed {
                // A revoked registration no longer reaches the session.
                Some((registration, session)) if lock(&registry).contains_key(registration) => {
                    invoke(session, request)
                }
                Some(_) => SessionResponse::error(
                    ErrorCode::UnknownRegistration,
                    "registration has been revoked",
                ),
                None => SessionResponse::error(ErrorCode::NotClaimed, "claim a registration first"),
            },
        };

        let mut bytes = serde_json::to_vec(&response).map_err(io::Error::from)?;
        bytes.push(b'\n');
        writer.write_all(&bytes)?;
        writer.flush()?;
    }
}

fn claim(
    registry: &Registry,
    registration: String,
    claimed: &mut Option<(String, SessionHandle)>,
) -> SessionResponse {
    let mut registry = lock(registry);
    match registry.get_mut(&registration) {
        None => SessionResponse::error(ErrorCode::UnknownRegistration, "unknown registration"),
        Some(entry) if entry.claimed => {
            SessionResponse::error(ErrorCode::AlreadyClaimed, "registration already claimed")
        }
        Some(entry) => {
            entry.claimed = true;
            debug!(session = %entry.session.id(), "Session claimed through transport");
            *claimed = Some((registration, entry.session.clone()));
            SessionResponse::Claimed
        }
    }
}

fn invoke(session: &SessionHandle, request: SessionRequest) -> SessionResponse {
    debug!(session = %session.id(), request = ?request, "Proxied session call");
    match request {
        SessionRequest::State => SessionResponse::State {
            state: session.current_state(),
        },
        SessionRequest::Run => SessionResponse::from_result(session.run()),
        SessionRequest::Resume => SessionResponse::from_result(session.resume()),
        SessionRequest::Interrupt => SessionResponse::from_result(session.interrupt()),
        SessionRequest::Terminate => SessionResponse::from_result(session.terminate()),
        SessionRequest::Claim { .. } => {
            SessionResponse::error(ErrorCode::ProtocolMisuse, "session already claimed")
        }
    }
}

struct RpcChannel {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl RpcChannel {
    fn call(&mut self, request: &SessionRequest) -> Result<SessionResponse> {
        let mut bytes = serde_json::to_vec(request).map_err(io::Error::from)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;

        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(BridgeError::Remote(
                "session owner closed the connection".to_string(),
            ));
        }
        serde_json::from_str(line.trim()).map_err(|e| BridgeError::Remote(e.to_string()))
    }
}

/// Proxy to a session owned by another component.
pub struct RemoteSession {
    session: SessionId,
    config: TargetConnectionConfig,
    channel: Mutex<RpcChannel>,
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl RemoteSession {
    fn claim(payload: TokenPayload) -> Result<Self> {
        let timeout = payload.config.socket_timeout();
        let stream = TcpStream::connect_timeout(&payload.endpoint, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut channel = RpcChannel {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        };

        match channel.call(&SessionRequest::Claim {
            registration: payload.registration,
        })? {
            SessionResponse::Claimed => {}
            SessionResponse::Error {
                code: ErrorCode::AlreadyClaimed,
                ..
            } => return Err(BridgeError::TokenAlreadyClaimed),
            SessionResponse::Error { message, .. } => {
                return Err(BridgeError::TransportCorrupt(message));
            }
            other => {
                return Err(BridgeError::Remote(format!(
                    "unexpected claim response {other:?}"
                )));
            }
        }

        debug!(session = %payload.session, "Claimed remote session");
        Ok(Self {
            session: payload.session,
            config: payload.config,
            channel: Mutex::new(channel),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn config(&self) -> &TargetConnectionConfig {
        &self.config
    }

    fn call(&self, request: SessionRequest) -> Result<SessionResponse> {
        let response = lock(&self.channel).call(&request)?;
        match response {
            SessionResponse::Error {
                code: ErrorCode::ProtocolMisuse,
                message,
            } => Err(BridgeError::ProtocolMisuse(Cow::Owned(message))),
            SessionResponse::Error { message, .. } => Err(BridgeError::Remote(message)),
            response => Ok(response),
        }
    }

    fn call_ok(&self, request: SessionRequest) -> Result<()> {
        match self.call(request)? {
            SessionResponse::Ok => Ok(()),
            other => Err(BridgeError::Remote(format!("unexpected response {other:?}"))),
        }
    }
}

impl SessionControl for RemoteSession {
    fn state(&self) -> Result<SessionState> {
        match self.call(SessionRequest::State)? {
            SessionResponse::State { state } => Ok(state),
            other => Err(BridgeError::Remote(format!("unexpected response {other:?}"))),
        }
    }

    fn run(&self) -> Result<()> {
        self.call_ok(SessionRequest::Run)
    }

    fn resume(&self) -> Result<()> {
        self.call_ok(SessionRequest::Resume)
    }

    fn interrupt(&self) -> Result<()> {
        self.call_ok(SessionRequest::Interrupt)
    }

    fn terminate(&self) -> Result<()> {
        self.call_ok(SessionRequest::Terminate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RawTargetEvent;
    use crate::session::{ExceptionPolicy, TargetConnection, TargetConnector};
    use crossbeam_channel::Receiver;
    use std::time::Duration;

    struct Refusing;

    impl TargetConnector for Refusing {
        fn connect(
            &self,
            _config: &TargetConnectionConfig,
            _timeout: Duration,
        ) -> Result<Box<dyn TargetConnection>> {
            Err(io::Error::from(io::ErrorKind::ConnectionRefused).into())
        }
    }

    fn new_session() -> (SessionHandle, Receiver<RawTargetEvent>) {
        let config = TargetConnectionConfig::from_options(
            r#"{"exe": "App.exe", "host": "127.0.0.1", "port": 55000, "maxAttempts": 1, "delayMs": 0}"#,
        )
        .unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            SessionHandle::new(config, Arc::new(Refusing), ExceptionPolicy::Continue, tx),
            rx,
        )
    }

    #[test]
    fn test_token_is_plain_text() {
        let transport = SessionTransport::bind().unwrap();
        let (session, _rx) = new_session();
        let token = transport.package(&session, session.config()).unwrap();

        assert!(
            token
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        );
    }

    #[test]
    fn test_registrations_are_unique() {
        let (session, _rx) = new_session();
        let first = registration_nonce(session.id());
        let second = registration_nonce(session.id());

        assert_ne!(first, second);
        let (prefix, nonce) = first.split_once('-').unwrap();
        assert_eq!(prefix, session.id().0.to_string());
        assert_eq!(Uuid::parse_str(nonce).unwrap().get_version_num(), 4);
    }

    #[test]
    fn test_round_trip_proxy_drives_original_session() {
        let transport = SessionTransport::bind().unwrap();
        let (session, _rx) = new_session();
        let token = transport.package(&session, session.config()).unwrap();

        let remote = SessionTransport::unpackage(token.as_str()).unwrap();
        assert_eq!(remote.session_id(), session.id());
        assert_eq!(remote.config(), session.config());
        assert_eq!(remote.state().unwrap(), SessionState::Created);

        remote.run().unwrap();
        assert_ne!(session.current_state(), SessionState::Created);
        assert!(matches!(remote.run(), Err(BridgeError::ProtocolMisuse(_))));

        assert!(session.wait_for_state(SessionState::Exited, Duration::from_secs(2)));
        assert_eq!(remote.state().unwrap(), SessionState::Exited);
        remote.terminate().unwrap();
    }

    #[test]
    fn test_token_claims_once() {
        let transport = SessionTransport::bind().unwrap();
        let (session, _rx) = new_session();
        let token = transport.package(&session, session.config()).unwrap();

        let _remote = SessionTransport::unpackage(token.as_str()).unwrap();
        let second = SessionTransport::unpackage(token.as_str());
        assert!(matches!(second, Err(BridgeError::TokenAlreadyClaimed)));
    }

    #[test]
    fn test_package_twice_fails() {
        let transport = SessionTransport::bind().unwrap();
        let (session, _rx) = new_session();
        transport.package(&session, session.config()).unwrap();

        let again = transport.package(&session, session.config());
        assert!(matches!(again, Err(BridgeError::SerializationFailed(_))));
    }

    #[test]
    fn test_corrupt_tokens() {
        assert!(matches!(
            SessionTransport::unpackage("not base64 !!"),
            Err(BridgeError::TransportCorrupt(_))
        ));
        let not_json = BASE64_STANDARD.encode("hello");
        assert!(matches!(
            SessionTransport::unpackage(&not_json),
            Err(BridgeError::TransportCorrupt(_))
        ));
    }

    #[test]
    fn test_revoked_registration_rejects_calls() {
        let transport = SessionTransport::bind().unwrap();
        let (session, _rx) = new_session();
        let token = transport.package(&session, session.config()).unwrap();
        let remote = SessionTransport::unpackage(token.as_str()).unwrap();

        assert!(transport.revoke(session.id()));
        assert!(!transport.revoke(session.id()));
        assert!(matches!(remote.state(), Err(BridgeError::Remote(_))));
        assert_eq!(session.current_state(), SessionState::Created);
    }
}
