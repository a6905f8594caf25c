//! Connection admission.
//!
//! Every inbound TCP connection passes through the gate before the SSH
//! handshake starts: defender ban check, concurrency caps, rate limit,
//! then the post-connect hook. Any failure closes the connection; on
//! success the returned guard keeps the connection registered until it
//! is dropped.

use std::net::IpAddr;
use std::sync::Arc;

use sandpiper_core::{Defender, HostEvent, Protocol};
use tracing::debug;

use crate::connection::{ClientGuard, ConnectionRegistry};
use crate::error::{Error, Result};
use crate::hooks::{execute_post_connect_hook, HookEndpoint};
use crate::rate_limit::ConnectionRateLimiter;

pub struct AdmissionGate {
    defender: Arc<dyn Defender>,
    registry: Arc<ConnectionRegistry>,
    rate_limiter: Arc<ConnectionRateLimiter>,
    post_connect_hook: Option<HookEndpoint>,
}

impl AdmissionGate {
    pub fn new(
        defender: Arc<dyn Defender>,
        registry: Arc<ConnectionRegistry>,
        rate_limiter: Arc<ConnectionRateLimiter>,
        post_connect_hook: Option<HookEndpoint>,
    ) -> Self {
        Self {
            defender,
            registry,
            rate_limiter,
            post_connect_hook,
        }
    }

    /// Decide whether a connection from `ip` may proceed.
    pub async fn check(&self, ip: IpAddr) -> Result<ClientGuard> {
        if self.defender.is_banned(ip) {
            debug!(%ip, "connection refused, address is banned");
            return Err(Error::Admission(format!("address {ip} is banned")));
        }
        let guard = self.registry.add_client(ip).inspect_err(|_| {
            self.defender
                .add_event(ip, Protocol::Ssh, HostEvent::LimitExceeded);
        })?;
        if !self.rate_limiter.allow(ip).await {
            self.defender
                .add_event(ip, Protocol::Ssh, HostEvent::LimitExceeded);
            return Err(Error::Admission(format!("address {ip} is rate limited")));
        }
        if let Some(hook) = &self.post_connect_hook {
            execute_post_connect_hook(hook, ip, Protocol::Ssh).await?;
        }
        Ok(guard)
    }
}
