use std::fmt;
use std::net::{SocketAddr, TcpListener};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::PortRange;
use crate::error::{BridgeError, Result};

/// Wire protocol spoken on a bound endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolKind {
    WebSocket,
    DataChannel,
    Http,
}

/// Where a service is reachable. Immutable once bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub kind: ProtocolKind,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, kind: ProtocolKind) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
        }
    }

    /// Query token the viewer uses to find its transport, e.g. `?53000`.
    pub fn token(&self) -> String {
        match self.kind {
            ProtocolKind::DataChannel => format!("rtc{}", self.port),
            ProtocolKind::WebSocket | ProtocolKind::Http => self.port.to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.kind {
            ProtocolKind::WebSocket => "ws",
            ProtocolKind::DataChannel | ProtocolKind::Http => "http",
        };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Scans a port range for the first free port.
#[derive(Clone, Debug)]
pub struct PortBinder {
    host: String,
    range: PortRange,
    budget: Duration,
}

impl PortBinder {
    pub fn new(host: impl Into<String>, range: PortRange, budget: Duration) -> Self {
        Self {
            host: host.into(),
            range,
            budget,
        }
    }

    /// Binds the first free port in range, returning the listener unstarted.
    pub fn bind(&self, kind: ProtocolKind) -> Result<(TcpListener, Endpoint)> {
        let started = Instant::now();
        let mut candidate = self.range.start;
        while candidate <= self.range.end && started.elapsed() <= self.budget {
            match TcpListener::bind((self.host.as_str(), candidate)) {
                Ok(listener) => {
                    let addr: SocketAddr = listener.local_addr()?;
                    if candidate != self.range.start {
                        info!(
                            "port {} is in use, fell back to {} for {:?}",
                            self.range.start,
                            addr.port(),
                            kind
                        );
                    }
                    return Ok((listener, Endpoint::new(self.host.clone(), addr.port(), kind)));
                }
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                    debug!("port {candidate} on {} is in use", self.host);
                }
                Err(err) => return Err(BridgeError::Io(err)),
            }
            let Some(next) = candidate.checked_add(1) else {
                break;
            };
            candidate = next;
        }
        Err(BridgeError::BindExhausted {
            host: self.host.clone(),
            start: self.range.start,
            end: self.range.end,
        })
    }

    /// Binds a port and hands the listener to `serve`, which must start the
    /// service before returning.
    pub fn bind_with<S>(
        &self,
        kind: ProtocolKind,
        serve: impl FnOnce(TcpListener, Endpoint) -> Result<S>,
    ) -> Result<(Endpoint, S)> {
        let (listener, endpoint) = self.bind(kind)?;
        let service = serve(listener, endpoint.clone())?;
        Ok((endpoint, service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupy(port: u16) -> Option<TcpListener> {
        TcpListener::bind(("127.0.0.1", port)).ok()
    }

    #[test]
    fn falls_back_past_occupied_ports() {
        let _held: Vec<_> = (52000..=52002).filter_map(occupy).collect();
        let binder = PortBinder::new(
            "127.0.0.1",
            PortRange::new(52000, 52005),
            Duration::from_secs(1),
        );
        let (_listener, endpoint) = binder.bind(ProtocolKind::Http).expect("bind");
        assert_eq!(endpoint.port, 52003);
        assert_eq!(endpoint.kind, ProtocolKind::Http);
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let held: Vec<_> = (52110..=52112).filter_map(occupy).collect();
        assert_eq!(held.len(), 3, "test ports should be free");
        let binder = PortBinder::new(
            "127.0.0.1",
            PortRange::new(52110, 52112),
            Duration::from_secs(1),
        );
        match binder.bind(ProtocolKind::WebSocket) {
            Err(BridgeError::BindExhausted { start, end, .. }) => {
                assert_eq!((start, end), (52110, 52112));
            }
            other => panic!("expected BindExhausted, got {other:?}"),
        }
    }

    #[test]
    fn bound_port_stays_inside_range() {
        let binder = PortBinder::new(
            "127.0.0.1",
            PortRange::new(52200, 52210),
            Duration::from_secs(1),
        );
        let (endpoint, port) = binder
            .bind_with(ProtocolKind::WebSocket, |listener, _| {
                Ok(listener.local_addr()?.port())
            })
            .expect("bind");
        assert!((52200..=52210).contains(&endpoint.port));
        assert_eq!(endpoint.port, port);
    }

    #[test]
    fn tokens_encode_transport_kind() {
        assert_eq!(Endpoint::new("h", 53001, ProtocolKind::WebSocket).token(), "53001");
        assert_eq!(Endpoint::new("h", 52000, ProtocolKind::DataChannel).token(), "rtc52000");
        assert_eq!(
            Endpoint::new("localhost", 53001, ProtocolKind::WebSocket).to_string(),
            "ws://localhost:53001"
        );
    }
}
