//! Port forwarding: `port-forward` channels become TCP connections made
//! from the device.
//!
//! Destinations are checked against an allowlist before connecting:
//!
//! | Pattern            | Matches                        |
//! |--------------------|--------------------------------|
//! | `"*"`              | Any host and port              |
//! | `"db.local"`       | That host on any port          |
//! | `"db.local:5432"`  | That host and port only        |
//!
//! An empty list allows nothing.

use crate::channel::copy_to_channel;
use hatch_core::{ChannelEvent, HatchError, HatchResult, PendingChannel, ReasonCode};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Runtime allowlist plus a count of open forwards.
pub struct ForwardPolicy {
    allowed: HashSet<String>,
    allow_all: bool,
    max_connections: usize,
    active: Arc<AtomicUsize>,
}

impl ForwardPolicy {
    pub fn new(allow: &[String], max_connections: usize) -> Self {
        let allowed: HashSet<String> = allow.iter().map(|s| s.trim().to_string()).collect();
        Self {
            allow_all: allowed.contains("*"),
            allowed,
            max_connections,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Allow nothing.
    pub fn deny_all() -> Self {
        Self::new(&[], 0)
    }

    pub fn check(&self, host: &str, port: u16) -> HatchResult<()> {
        if !(self.allow_all
            || self.allowed.contains(host)
            || self.allowed.contains(&format!("{host}:{port}")))
        {
            return Err(HatchError::PolicyDenied(format!(
                "destination not allowed: {host}:{port}"
            )));
        }
        let current = self.active.load(Ordering::Relaxed);
        if current >= self.max_connections {
            return Err(HatchError::PolicyDenied(format!(
                "forward limit reached ({current}/{})",
                self.max_connections
            )));
        }
        Ok(())
    }

    /// Count a forward until the guard drops.
    pub fn acquire(&self) -> ForwardGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ForwardGuard {
            counter: self.active.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

pub struct ForwardGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ForwardGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Connect to the requested target and splice it with the channel.
///
/// Each direction half-closes independently; the channel is closed once
/// both have finished.
pub(crate) async fn serve_forward(pending: PendingChannel, policy: &ForwardPolicy) -> HatchResult<()> {
    let channel_id = pending.id();
    let Some(target) = pending.params().forward.clone() else {
        pending.reject(ReasonCode::ProtocolViolation, "port-forward without a target");
        return Ok(());
    };
    if let Err(e) = policy.check(&target.host, target.port) {
        info!(channel_id, host = %target.host, port = target.port, "forward denied: {e}");
        pending.reject(e.code(), e.to_string());
        return Ok(());
    }

    let addr = format!("{}:{}", target.host, target.port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(channel_id, addr = %addr, error = %e, "forward connect failed");
            pending.reject(ReasonCode::Internal, format!("connect to {addr} failed: {e}"));
            return Ok(());
        }
    };
    let _guard = policy.acquire();
    let (sender, mut receiver) = pending.accept()?.split();
    info!(channel_id, addr = %addr, "forward established");

    let (read_half, mut write_half) = stream.into_split();
    let mut upstream = {
        let sender = sender.clone();
        tokio::spawn(async move {
            copy_to_channel(read_half, &sender).await;
            sender.eof();
        })
    };

    let mut upstream_done = false;
    let mut downstream_done = false;
    while !(upstream_done && downstream_done) {
        tokio::select! {
            _ = &mut upstream, if !upstream_done => upstream_done = true,
            event = receiver.recv(), if !downstream_done => match event {
                Some(ChannelEvent::Data(data)) => {
                    if let Err(e) = write_half.write_all(&data).await {
                        debug!(channel_id, error = %e, "forward target write failed");
                        upstream.abort();
                        sender.close(None);
                        return Ok(());
                    }
                }
                Some(ChannelEvent::Eof) => {
                    let _ = write_half.shutdown().await;
                    downstream_done = true;
                }
                Some(ChannelEvent::Resize { .. }) => {}
                Some(ChannelEvent::Closed { .. }) | Some(ChannelEvent::Failed { .. }) | None => {
                    upstream.abort();
                    return Ok(());
                }
            },
        }
    }
    sender.close(None);
    debug!(channel_id, "forward finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allow: &[&str]) -> ForwardPolicy {
        let allow: Vec<String> = allow.iter().map(|s| s.to_string()).collect();
        ForwardPolicy::new(&allow, 8)
    }

    #[test]
    fn wildcard_allows_everything() {
        let p = policy(&["*"]);
        assert!(p.check("example.com", 80).is_ok());
        assert!(p.check("10.0.0.1", 5432).is_ok());
    }

    #[test]
    fn host_and_host_port_patterns() {
        let p = policy(&["db.local", "cache.local:6379"]);
        assert!(p.check("db.local", 1).is_ok());
        assert!(p.check("cache.local", 6379).is_ok());
        assert!(p.check("cache.local", 6380).is_err());
        assert_eq!(
            p.check("evil.com", 80).unwrap_err().code(),
            ReasonCode::PolicyDenied
        );
    }

    #[test]
    fn empty_list_denies() {
        assert!(ForwardPolicy::deny_all().check("localhost", 22).is_err());
        assert!(policy(&[]).check("localhost", 22).is_err());
    }

    #[test]
    fn limit_counts_live_guards() {
        let p = ForwardPolicy::new(&["*".to_string()], 1);
        {
            let _g = p.acquire();
            assert_eq!(p.active(), 1);
            assert!(p.check("a", 1).is_err());
        }
        assert_eq!(p.active(), 0);
        assert!(p.check("a", 1).is_ok());
    }
}
