use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_SOCKET_PORT: u16 = 53000;
pub const DEFAULT_HTTP_PORT: u16 = 52000;
pub const PORT_SCAN_CEILING: u16 = 62000;
pub const BIND_BUDGET: Duration = Duration::from_secs(5);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
pub const REPLY_ATTEMPTS: u32 = 6;
pub const PAUSE_WAKE_INTERVAL: Duration = Duration::from_millis(100);
pub const BACKPRESSURE_THRESHOLD: usize = 10_000;
pub const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_FRAME_RATE: f64 = 60.0;

/// Which transport carries envelopes to the viewer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Socket,
    DataChannel,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "socket" | "websocket" | "ws" => Ok(Self::Socket),
            "datachannel" | "rtc" | "webrtc" => Ok(Self::DataChannel),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Inclusive port scan range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub host: String,
    pub transport: TransportKind,
    pub socket_ports: PortRange,
    pub http_ports: PortRange,
    pub bind_budget: Duration,
    pub handshake_timeout: Duration,
    pub reply_timeout: Duration,
    pub reply_attempts: u32,
    pub pause_wake_interval: Duration,
    pub backpressure_threshold: usize,
    pub backpressure_poll: Duration,
    pub teardown_timeout: Duration,
    pub frame_rate: f64,
    pub realtime: bool,
    pub open_tab: bool,
    pub browser: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BIND_HOST.to_string(),
            transport: TransportKind::Socket,
            socket_ports: PortRange::new(DEFAULT_SOCKET_PORT, PORT_SCAN_CEILING),
            http_ports: PortRange::new(DEFAULT_HTTP_PORT, PORT_SCAN_CEILING),
            bind_budget: BIND_BUDGET,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            reply_timeout: REPLY_TIMEOUT,
            reply_attempts: REPLY_ATTEMPTS,
            pause_wake_interval: PAUSE_WAKE_INTERVAL,
            backpressure_threshold: BACKPRESSURE_THRESHOLD,
            backpressure_poll: BACKPRESSURE_POLL,
            teardown_timeout: TEARDOWN_TIMEOUT,
            frame_rate: DEFAULT_FRAME_RATE,
            realtime: true,
            open_tab: true,
            browser: None,
        }
    }
}

impl BridgeConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("SCENELINK_HOST")
            && !host.trim().is_empty()
        {
            config.host = host.trim().to_string();
        }
        if let Ok(raw_value) = std::env::var("SCENELINK_TRANSPORT") {
            match raw_value.parse::<TransportKind>() {
                Ok(kind) => config.transport = kind,
                Err(err) => warn!("SCENELINK_TRANSPORT: {err}; using socket"),
            }
        }
        if let Some(port) = resolve_port("SCENELINK_SOCKET_PORT") {
            config.socket_ports.start = port;
        }
        if let Some(port) = resolve_port("SCENELINK_HTTP_PORT") {
            config.http_ports.start = port;
        }
        if let Ok(browser) = std::env::var("SCENELINK_BROWSER")
            && !browser.trim().is_empty()
        {
            config.browser = Some(browser.trim().to_string());
        }
        if let Ok(raw_value) = std::env::var("SCENELINK_OPEN_TAB") {
            match raw_value.trim() {
                "0" | "false" | "no" => config.open_tab = false,
                "1" | "true" | "yes" => config.open_tab = true,
                _ => warn!("SCENELINK_OPEN_TAB must be a boolean; got '{raw_value}'"),
            }
        }
        config
    }

    /// Seconds of wall time between network pushes when not in real-time mode.
    /// A rate too small to express saturates at [`Duration::MAX`].
    pub fn frame_budget(&self) -> Duration {
        if self.frame_rate > 0.0 {
            Duration::try_from_secs_f64(1.0 / self.frame_rate).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }
}

fn resolve_port(env_var: &str) -> Option<u16> {
    let raw_value = std::env::var(env_var).ok()?;
    match raw_value.parse::<u16>() {
        Ok(parsed) if parsed > 0 => Some(parsed),
        _ => {
            warn!("{env_var} must be an integer in range 1-65535; got '{raw_value}'");
            None
        }
    }
}
