//! Sessions relayed through a bridge

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use super::transport::TransportKind;

/// Why a bridge session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCloseReason {
    BandwidthExceeded,
    IdleTimeout,
    BridgeEvicted,
    Requested,
}

impl std::fmt::Display for SessionCloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionCloseReason::BandwidthExceeded => "bandwidth cap exceeded",
            SessionCloseReason::IdleTimeout => "idle timeout",
            SessionCloseReason::BridgeEvicted => "bridge evicted",
            SessionCloseReason::Requested => "closed by owner",
        };
        f.write_str(s)
    }
}

/// A connection carried by a bridge
#[derive(Debug, Clone)]
pub struct BridgeSession {
    pub id: u64,
    pub fingerprint: String,
    pub transport: TransportKind,
    pub remote: SocketAddr,
    pub bytes: u64,
    pub started_at: Instant,
    pub last_activity: Instant,
}

impl BridgeSession {
    pub fn new(id: u64, fingerprint: &str, transport: TransportKind, remote: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            fingerprint: fingerprint.to_string(),
            transport,
            remote,
            bytes: 0,
            started_at: now,
            last_activity: now,
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.bytes = self.bytes.saturating_add(bytes as u64);
        self.last_activity = Instant::now();
    }

    /// The limit this session has breached, if any
    pub fn breach(&self, bandwidth_cap: u64, idle_timeout: Duration) -> Option<SessionCloseReason> {
        if self.bytes > bandwidth_cap {
            Some(SessionCloseReason::BandwidthExceeded)
        } else if self.last_activity.elapsed() >= idle_timeout {
            Some(SessionCloseReason::IdleTimeout)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_breach_rules() {
        let mut session = BridgeSession::new(
            1,
            "ab",
            TransportKind::Obfs4,
            "127.0.0.1:443".parse().unwrap(),
        );
        let idle = Duration::from_secs(60);
        assert_eq!(session.breach(100, idle), None);

        session.record(100);
        assert_eq!(session.breach(100, idle), None);
        session.record(1);
        assert_eq!(session.breach(100, idle), Some(SessionCloseReason::BandwidthExceeded));

        let mut quiet = BridgeSession::new(
            2,
            "cd",
            TransportKind::Meek,
            "127.0.0.1:443".parse().unwrap(),
        );
        tokio::time::advance(Duration::from_secs(59)).await;
        quiet.record(1);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(quiet.breach(100, idle), None);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(quiet.breach(100, idle), Some(SessionCloseReason::IdleTimeout));
    }
}
