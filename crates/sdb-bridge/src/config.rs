use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::warn;

use crate::error::{BridgeError, Result};
use crate::session::ExceptionPolicy;

pub const DEFAULT_MAX_CONNECTION_ATTEMPTS: u32 = 10;
pub const DEFAULT_TIME_BETWEEN_ATTEMPTS_MS: u64 = 500;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_EVALUATION_TIMEOUT_MS: u64 = 30_000;

/// Launch payload as sent by the host.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct LaunchOptions {
    #[serde(alias = "targetExeFileName")]
    exe: Option<String>,
    #[serde(alias = "hostIp")]
    host: Option<String>,
    #[serde(alias = "monoDebugPort")]
    port: Option<i64>,
    #[serde(alias = "maxConnectionAttempts")]
    max_attempts: Option<i64>,
    #[serde(alias = "timeBetweenConnectionAttemptsInMs")]
    delay_ms: Option<i64>,
    connection_timeout_ms: Option<i64>,
    evaluation_timeout_ms: Option<i64>,
    modification_timeout_ms: Option<i64>,
    socket_timeout_ms: Option<i64>,
    #[serde(default, alias = "enableVerboseDebugLogging")]
    verbose: bool,
    project: Option<String>,
}

/// How to reach a target. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConnectionConfig {
    executable: String,
    host: IpAddr,
    port: u16,
    connection_timeout: Duration,
    max_connection_attempts: u32,
    time_between_attempts: Duration,
    evaluation_timeout: Duration,
    modification_timeout: Duration,
    socket_timeout: Duration,
    verbose_logging: bool,
    project: Option<String>,
}

impl TargetConnectionConfig {
    /// Parse and validate a serialized launch payload.
    pub fn from_options(raw: &str) -> Result<Self> {
        let options: LaunchOptions = serde_json::from_str(raw)
            .map_err(|e| BridgeError::MalformedOptions(Cow::Owned(e.to_string())))?;
        Self::try_from(options)
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    pub fn max_connection_attempts(&self) -> u32 {
        self.max_connection_attempts
    }

    pub fn time_between_attempts(&self) -> Duration {
        self.time_between_attempts
    }

    pub fn evaluation_timeout(&self) -> Duration {
        self.evaluation_timeout
    }

    pub fn modification_timeout(&self) -> Duration {
        self.modification_timeout
    }

    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }

    pub fn verbose_logging(&self) -> bool {
        self.verbose_logging
    }

    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }
}

impl TryFrom<LaunchOptions> for TargetConnectionConfig {
    type Error = BridgeError;

    fn try_from(options: LaunchOptions) -> Result<Self> {
        let executable = options
            .exe
            .filter(|exe| !exe.trim().is_empty())
            .ok_or(BridgeError::MalformedOptions(Cow::Borrowed(
                "missing target executable path",
            )))?;

        let host = options
            .host
            .ok_or(BridgeError::MalformedOptions(Cow::Borrowed(
                "missing host address",
            )))?;
        let host = host.trim().parse::<IpAddr>().map_err(|_| {
            BridgeError::MalformedOptions(Cow::Owned(format!("invalid host address '{host}'")))
        })?;

        let port = options
            .port
            .ok_or(BridgeError::MalformedOptions(Cow::Borrowed("missing debug port")))?;
        let port = u16::try_from(port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| {
                BridgeError::MalformedOptions(Cow::Owned(format!("invalid debug port {port}")))
            })?;

        let max_connection_attempts = match options.max_attempts {
            None => DEFAULT_MAX_CONNECTION_ATTEMPTS,
            Some(n) => u32::try_from(n).ok().filter(|n| *n > 0).ok_or_else(|| {
                BridgeError::MalformedOptions(Cow::Owned(format!(
                    "max connection attempts must be positive, got {n}"
                )))
            })?,
        };

        let connection_timeout = positive_millis(
            "connectionTimeoutMs",
            options.connection_timeout_ms,
            DEFAULT_CONNECTION_TIMEOUT_MS,
        )?;
        let evaluation_timeout = positive_millis(
            "evaluationTimeoutMs",
            options.evaluation_timeout_ms,
            DEFAULT_EVALUATION_TIMEOUT_MS,
        )?;
        let modification_timeout = match options.modification_timeout_ms {
            None => evaluation_timeout,
            some => positive_millis("modificationTimeoutMs", some, 0)?,
        };
        let socket_timeout = match options.socket_timeout_ms {
            None => connection_timeout,
            some => positive_millis("socketTimeoutMs", some, 0)?,
        };
        let time_between_attempts = match options.delay_ms {
            None => Duration::from_millis(DEFAULT_TIME_BETWEEN_ATTEMPTS_MS),
            Some(ms) if ms >= 0 => Duration::from_millis(ms as u64),
            Some(ms) => {
                return Err(BridgeError::MalformedOptions(Cow::Owned(format!(
                    "delayMs must not be negative, got {ms}"
                ))));
            }
        };

        Ok(Self {
            executable,
            host,
            port,
            connection_timeout,
            max_connection_attempts,
            time_between_attempts,
            evaluation_timeout,
            modification_timeout,
            socket_timeout,
            verbose_logging: options.verbose,
            project: options.project,
        })
    }
}

fn positive_millis(name: &str, value: Option<i64>, default_ms: u64) -> Result<Duration> {
    match value {
        None => Ok(Duration::from_millis(default_ms)),
        Some(ms) if ms > 0 => Ok(Duration::from_millis(ms as u64)),
        Some(ms) => Err(BridgeError::MalformedOptions(Cow::Owned(format!(
            "{name} must be positive, got {ms}"
        )))),
    }
}

/// Process-wide settings read from the environment.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub exception_policy: ExceptionPolicy,
    pub log_filter: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            exception_policy: ExceptionPolicy::Continue,
            log_filter: "sdb_bridge=info,sdb_dap=info".to_string(),
        }
    }
}

impl BridgeSettings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(policy) = env::var("SDB_EXCEPTION_POLICY") {
            settings.exception_policy = match policy.to_lowercase().as_str() {
                "continue" => ExceptionPolicy::Continue,
                "abort" => ExceptionPolicy::Abort,
                _ => {
                    warn!(
                        value = %policy,
                        "Invalid SDB_EXCEPTION_POLICY value, using default continue"
                    );
                    ExceptionPolicy::Continue
                }
            };
        }

        if let Ok(filter) = env::var("SDB_LOG") {
            settings.log_filter = filter;
        } else if let Ok(filter) = env::var("RUST_LOG") {
            settings.log_filter = filter;
        }

        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io;
    use std::sync::{Arc, Mutex};

    const SETTINGS_VARS: [&str; 3] = ["SDB_EXCEPTION_POLICY", "SDB_LOG", "RUST_LOG"];

    // Cases share the process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_from_options_with_defaults() {
        let config = TargetConnectionConfig::from_options(
            r#"{"exe": "App.exe", "host": "127.0.0.1", "port": 55000, "maxAttempts": 3, "delayMs": 500}"#,
        )
        .unwrap();

        assert_eq!(config.executable(), "App.exe");
        assert_eq!(config.host().to_string(), "127.0.0.1");
        assert_eq!(config.port(), 55000);
        assert_eq!(config.max_connection_attempts(), 3);
        assert_eq!(config.time_between_attempts(), Duration::from_millis(500));
        assert_eq!(config.connection_timeout(), Duration::from_millis(30_000));
        assert_eq!(config.evaluation_timeout(), Duration::from_millis(30_000));
        assert_eq!(config.modification_timeout(), config.evaluation_timeout());
        assert_eq!(config.socket_timeout(), config.connection_timeout());
        assert!(!config.verbose_logging());
        assert!(config.project().is_none());
        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:55000");
    }

    #[test]
    fn test_from_options_long_form_names() {
        let config = TargetConnectionConfig::from_options(
            r#"{
                "targetExeFileName": "/opt/app/App.exe",
                "hostIp": "10.0.0.5",
                "monoDebugPort": 55555,
                "maxConnectionAttempts": 20,
                "timeBetweenConnectionAttemptsInMs": 250,
                "enableVerboseDebugLogging": true,
                "project": "App.csproj"
            }"#,
        )
        .unwrap();

        assert_eq!(config.executable(), "/opt/app/App.exe");
        assert_eq!(config.port(), 55555);
        assert_eq!(config.max_connection_attempts(), 20);
        assert_eq!(config.time_between_attempts(), Duration::from_millis(250));
        assert!(config.verbose_logging());
        assert_eq!(config.project(), Some("App.csproj"));
    }

    #[test]
    fn test_from_options_explicit_timeouts() {
        let config = TargetConnectionConfig::from_options(
            r#"{"exe": "a", "host": "::1", "port": 1, "connectionTimeoutMs": 100,
                "evaluationTimeoutMs": 200, "modificationTimeoutMs": 300, "socketTimeoutMs": 400}"#,
        )
        .unwrap();

        assert_eq!(config.connection_timeout(), Duration::from_millis(100));
        assert_eq!(config.evaluation_timeout(), Duration::from_millis(200));
        assert_eq!(config.modification_timeout(), Duration::from_millis(300));
        assert_eq!(config.socket_timeout(), Duration::from_millis(400));
    }

    #[rstest]
    #[case::not_json("not json")]
    #[case::missing_exe(r#"{"host": "127.0.0.1", "port": 55000}"#)]
    #[case::empty_exe(r#"{"exe": "  ", "host": "127.0.0.1", "port": 55000}"#)]
    #[case::missing_host(r#"{"exe": "App.exe", "port": 55000}"#)]
    #[case::bad_host(r#"{"exe": "App.exe", "host": "not-an-ip", "port": 55000}"#)]
    #[case::missing_port(r#"{"exe": "App.exe", "host": "127.0.0.1"}"#)]
    #[case::port_as_string(r#"{"exe": "App.exe", "host": "127.0.0.1", "port": "55000"}"#)]
    #[case::port_zero(r#"{"exe": "App.exe", "host": "127.0.0.1", "port": 0}"#)]
    #[case::port_too_large(r#"{"exe": "App.exe", "host": "127.0.0.1", "port": 70000}"#)]
    #[case::zero_attempts(r#"{"exe": "App.exe", "host": "127.0.0.1", "port": 1, "maxAttempts": 0}"#)]
    #[case::negative_delay(r#"{"exe": "App.exe", "host": "127.0.0.1", "port": 1, "delayMs": -1}"#)]
    #[case::zero_timeout(r#"{"exe": "App.exe", "host": "127.0.0.1", "port": 1, "connectionTimeoutMs": 0}"#)]
    fn test_from_options_malformed(#[case] raw: &str) {
        let result = TargetConnectionConfig::from_options(raw);
        assert!(
            matches!(result, Err(BridgeError::MalformedOptions(_))),
            "expected MalformedOptions for {raw}, got {result:?}"
        );
    }

    #[test]
    fn test_config_serde_round_trip_keeps_values() {
        let config = TargetConnectionConfig::from_options(
            r#"{"exe": "App.exe", "host": "127.0.0.1", "port": 55000}"#,
        )
        .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: TargetConnectionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_default_settings() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.exception_policy, ExceptionPolicy::Continue);
        assert_eq!(settings.log_filter, "sdb_bridge=info,sdb_dap=info");
    }

    #[rstest]
    #[case::unset([None, None, None], ExceptionPolicy::Continue, "sdb_bridge=info,sdb_dap=info", false)]
    #[case::abort([Some("abort"), Some("sdb_bridge=debug"), None], ExceptionPolicy::Abort, "sdb_bridge=debug", false)]
    #[case::abort_upper_case([Some("ABORT"), None, None], ExceptionPolicy::Abort, "sdb_bridge=info,sdb_dap=info", false)]
    #[case::continue_policy([Some("continue"), None, None], ExceptionPolicy::Continue, "sdb_bridge=info,sdb_dap=info", false)]
    #[case::invalid_policy([Some("explode"), None, None], ExceptionPolicy::Continue, "sdb_bridge=info,sdb_dap=info", true)]
    #[case::rust_log_fallback([None, None, Some("trace")], ExceptionPolicy::Continue, "trace", false)]
    #[case::sdb_log_wins([None, Some("sdb_bridge=warn"), Some("trace")], ExceptionPolicy::Continue, "sdb_bridge=warn", false)]
    fn test_settings_from_env(
        #[case] values: [Option<&str>; 3],
        #[case] expected_policy: ExceptionPolicy,
        #[case] expected_filter: &str,
        #[case] expect_warning: bool,
    ) {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let original: Vec<_> = SETTINGS_VARS.iter().map(|name| env::var(name).ok()).collect();

        unsafe {
            for (name, value) in SETTINGS_VARS.iter().zip(values) {
                match value {
                    Some(value) => env::set_var(name, value),
                    None => env::remove_var(name),
                }
            }
        }

        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(buffer.clone())
            .with_ansi(false)
            .finish();
        let settings = tracing::subscriber::with_default(subscriber, BridgeSettings::from_env);

        unsafe {
            for (name, value) in SETTINGS_VARS.iter().zip(original) {
                match value {
                    Some(value) => env::set_var(name, value),
                    None => env::remove_var(name),
                }
            }
        }

        assert_eq!(settings.exception_policy, expected_policy);
        assert_eq!(settings.log_filter, expected_filter);
        let logs = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(
            logs.contains("Invalid SDB_EXCEPTION_POLICY value"),
            expect_warning,
            "{logs}"
        );
    }
}
