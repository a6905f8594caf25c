//! Server assembly: configuration loading, listeners and the
//! per-connection pipeline.
//!
//! `initialize` is all-or-nothing: any validation or load error is
//! returned to the caller and nothing is partially applied. Each valid
//! binding gets its own accept loop; each accepted connection runs in
//! its own task behind a panic barrier, so a bad connection can never
//! take the process down.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::FutureExt;
use russh::server::Config as TransportConfig;
use russh::{Disconnect, MethodKind, MethodSet, SshId};
use sandpiper_core::{Defender, UserStore};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionGate;
use crate::algorithms::AlgorithmPolicy;
use crate::auth::AuthActivity;
use crate::certs::CertChecker;
use crate::commands;
use crate::config::{Binding, Config};
use crate::connection::ConnectionRegistry;
use crate::error::{Error, Result};
use crate::hooks::HookEndpoint;
use crate::hostkeys::HostKeyStore;
use crate::metrics::Metrics;
use crate::moduli;
use crate::prefix::normalize_folder_prefix;
use crate::rate_limit::ConnectionRateLimiter;
use crate::revocation::RevocationStore;
use crate::session::{ServerContext, SshSession};
use crate::status::{derive_authentications, HostKeyInfo, ServiceStatus};

/// Accept back-off bounds for transient errors.
const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// The SSH/SFTP front-end of the daemon.
pub struct Server {
    config: Config,
    config_dir: PathBuf,
    store: Arc<dyn UserStore>,
    defender: Arc<dyn Defender>,
    registry: Arc<ConnectionRegistry>,
    metrics: Metrics,
    revocation: Arc<RevocationStore>,
    status: OnceLock<ServiceStatus>,
}

/// Listener tasks of a running server.
pub struct ServerHandles {
    local_addrs: Vec<SocketAddr>,
    tasks: JoinSet<Result<()>>,
}

impl ServerHandles {
    /// The addresses the listeners are actually bound to.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Wait until a listener fails or all of them end.
    pub async fn wait(mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(Error::Other(format!("listener task failed: {e}"))),
            }
        }
        Ok(())
    }
}

impl Server {
    pub fn new(
        config: Config,
        config_dir: impl Into<PathBuf>,
        store: Arc<dyn UserStore>,
        defender: Arc<dyn Defender>,
    ) -> Self {
        let config_dir = config_dir.into();
        let registry = Arc::new(ConnectionRegistry::new(
            config.max_total_connections,
            config.max_per_host_connections,
        ));
        let revoked_path = revoked_certs_path(&config, &config_dir);
        Self {
            config,
            config_dir,
            store,
            defender,
            registry,
            metrics: Metrics::new(),
            revocation: Arc::new(RevocationStore::new(revoked_path)),
            status: OnceLock::new(),
        }
    }

    /// The status snapshot, available once `initialize` succeeded.
    pub fn status(&self) -> Option<&ServiceStatus> {
        self.status.get()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Re-read the revoked user certificates file.
    pub async fn reload_revoked_certs(&self) -> Result<()> {
        self.revocation.reload().await
    }

    /// Validate the configuration, load all credential material, bind
    /// every valid listener and start serving. Returns the listener
    /// handles; errors here are fatal and leave nothing running.
    pub async fn initialize(&self) -> Result<ServerHandles> {
        self.config.validate()?;
        if !self.config.should_bind() {
            return Err(Error::Config("no valid binding configured".to_string()));
        }

        self.revocation.load().await?;
        let cert_checker = Arc::new(CertChecker::load(
            &self.config_dir,
            &self.config,
            Arc::clone(&self.revocation),
        )?);
        let host_keys = HostKeyStore::load(&self.config_dir, &self.config).await?;
        let dh_gex_enabled = moduli::load_moduli(&self.config_dir, &self.config.moduli);
        let policy = AlgorithmPolicy::resolve(&self.config, dh_gex_enabled)?;

        let folder_prefix = normalize_folder_prefix(&self.config.folder_prefix);
        let enabled_commands = if folder_prefix.is_some() {
            debug!(
                prefix = self.config.folder_prefix,
                "folder prefix configured, ssh commands are disabled"
            );
            Vec::new()
        } else {
            commands::effective_ssh_commands(&self.config.enabled_ssh_commands)
        };
        let date_layout = if self.config.folder_prefix_date_layout.is_empty() {
            None
        } else {
            Some(self.config.folder_prefix_date_layout.clone())
        };

        // an invalid keyboard-interactive hook means the method is
        // never offered
        let (keyboard_interactive_enabled, keyboard_interactive_hook) =
            if self.config.keyboard_interactive_authentication {
                match HookEndpoint::parse(&self.config.keyboard_interactive_auth_hook) {
                    Ok(endpoint) => (true, endpoint),
                    Err(e) => {
                        warn!(error = %e, "keyboard interactive authentication disabled");
                        (false, None)
                    }
                }
            } else {
                (false, None)
            };

        let post_connect_hook = match HookEndpoint::parse(&self.config.post_connect_hook) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                return Err(Error::Config(format!("invalid post-connect hook: {e}")));
            }
        };

        let transport_config = Arc::new(self.transport_config(
            &host_keys,
            &policy,
            keyboard_interactive_enabled,
        )?);

        let context = Arc::new(ServerContext {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            defender: Arc::clone(&self.defender),
            registry: Arc::clone(&self.registry),
            cert_checker,
            metrics: self.metrics.clone(),
            folder_prefix,
            date_layout,
            enabled_commands: enabled_commands.clone(),
            keyboard_interactive_enabled,
            keyboard_interactive_hook,
        });
        let gate = Arc::new(AdmissionGate::new(
            Arc::clone(&self.defender),
            Arc::clone(&self.registry),
            Arc::new(ConnectionRateLimiter::new(self.config.rate_limit.clone())),
            post_connect_hook,
        ));

        // bind everything before serving anything, so a bind error is
        // fatal at initialize
        let mut listeners = Vec::new();
        let mut bindings = Vec::new();
        for binding in self.config.bindings.iter().filter(|b| b.is_valid()) {
            let listener = TcpListener::bind(binding.socket_address())
                .await
                .map_err(|e| {
                    Error::Config(format!(
                        "error starting listener on {}: {e}",
                        binding.socket_address()
                    ))
                })?;
            info!(address = %binding.socket_address(), "server listener registered");
            listeners.push((listener, binding.clone()));
            bindings.push(binding.clone());
        }

        let status = ServiceStatus {
            is_active: true,
            bindings,
            host_keys: host_keys
                .keys()
                .iter()
                .map(|k| HostKeyInfo {
                    path: k.path.display().to_string(),
                    fingerprint: k.fingerprint.clone(),
                    algorithm: k.algorithm.clone(),
                })
                .collect(),
            ssh_commands: enabled_commands,
            authentications: derive_authentications(
                self.config.password_authentication,
                keyboard_interactive_enabled,
            ),
            host_key_algos: policy.host_key_algos.clone(),
            kex_algorithms: policy.kex_algorithms.clone(),
            ciphers: policy.ciphers.clone(),
            macs: policy.macs.clone(),
        };
        let _ = self.status.set(status);

        let mut tasks = JoinSet::new();
        let mut local_addrs = Vec::new();
        for (listener, binding) in listeners {
            local_addrs.push(listener.local_addr()?);
            tasks.spawn(accept_loop(
                listener,
                binding,
                Arc::clone(&context),
                Arc::clone(&transport_config),
                Arc::clone(&gate),
            ));
        }
        Ok(ServerHandles { local_addrs, tasks })
    }

    /// Initialize and serve until the first fatal listener error.
    pub async fn run(self) -> Result<()> {
        let handles = self.initialize().await?;
        handles.wait().await
    }

    fn transport_config(
        &self,
        host_keys: &HostKeyStore,
        policy: &AlgorithmPolicy,
        keyboard_interactive_enabled: bool,
    ) -> Result<TransportConfig> {
        let mut methods = vec![MethodKind::PublicKey];
        if self.config.password_authentication {
            methods.push(MethodKind::Password);
        }
        if keyboard_interactive_enabled {
            methods.push(MethodKind::KeyboardInteractive);
        }

        let mut transport = TransportConfig {
            server_id: SshId::Standard(self.config.server_id()),
            methods: MethodSet::from(&methods[..]),
            keys: host_keys.server_keys(),
            max_auth_attempts: self.config.effective_max_auth_tries(),
            inactivity_timeout: Some(self.config.idle_timeout()),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        };
        policy.apply(&mut transport.preferred)?;

        if !self.config.login_banner_file.is_empty() {
            let path = resolve_config_path(&self.config_dir, &self.config.login_banner_file);
            match std::fs::read_to_string(&path) {
                Ok(banner) => {
                    transport.auth_banner = Some(Box::leak(banner.into_boxed_str()));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unable to read login banner file");
                }
            }
        }
        Ok(transport)
    }
}

fn resolve_config_path(config_dir: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw.trim());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_dir.join(path)
    }
}

fn revoked_certs_path(config: &Config, config_dir: &Path) -> Option<PathBuf> {
    let raw = config.revoked_user_certs_file.trim();
    if raw.is_empty() {
        None
    } else {
        Some(resolve_config_path(config_dir, raw))
    }
}

/// One accept loop per binding. Transient accept errors back off
/// exponentially from 5 ms to 1 s; anything else shuts this binding
/// down and surfaces the error.
async fn accept_loop(
    listener: TcpListener,
    binding: Binding,
    context: Arc<ServerContext>,
    transport_config: Arc<TransportConfig>,
    gate: Arc<AdmissionGate>,
) -> Result<()> {
    let mut delay = Duration::ZERO;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                delay = Duration::ZERO;
                let context = Arc::clone(&context);
                let transport_config = Arc::clone(&transport_config);
                let gate = Arc::clone(&gate);
                let apply_proxy = binding.apply_proxy_config;
                tokio::spawn(async move {
                    let task = handle_connection(
                        stream,
                        peer,
                        apply_proxy,
                        context,
                        transport_config,
                        gate,
                    );
                    if let Err(panic) = std::panic::AssertUnwindSafe(task).catch_unwind().await {
                        error!(?panic, "panic while serving a connection");
                    }
                });
            }
            Err(e) if is_transient_accept_error(&e) => {
                delay = if delay.is_zero() {
                    ACCEPT_BACKOFF_INITIAL
                } else {
                    (delay * 2).min(ACCEPT_BACKOFF_MAX)
                };
                warn!(
                    address = %binding.socket_address(),
                    error = %e,
                    retry_in = ?delay,
                    "transient accept error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(
                    address = %binding.socket_address(),
                    error = %e,
                    "unrecoverable accept error"
                );
                return Err(e.into());
            }
        }
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    if matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    ) {
        return true;
    }
    #[cfg(unix)]
    if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
        return true;
    }
    false
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    apply_proxy: bool,
    context: Arc<ServerContext>,
    transport_config: Arc<TransportConfig>,
    gate: Arc<AdmissionGate>,
) {
    let remote = if apply_proxy {
        match read_proxy_header(&mut stream).await {
            Ok(Some(source)) => source,
            Ok(None) => peer,
            Err(e) => {
                debug!(%peer, error = %e, "rejecting connection with bad proxy header");
                context.metrics.connection_rejected();
                return;
            }
        }
    } else {
        peer
    };
    let ip = remote.ip();

    let _client_guard = match gate.check(ip).await {
        Ok(guard) => guard,
        Err(e) => {
            debug!(%ip, error = %e, "connection not allowed");
            context.metrics.connection_rejected();
            return;
        }
    };
    context.metrics.connection_opened();

    let connection_id = Uuid::new_v4().simple().to_string();
    let activity = AuthActivity::new();
    let handler = SshSession::new(
        Arc::clone(&context),
        remote,
        connection_id.clone(),
        Arc::clone(&activity),
    );

    let handshake_timeout = context.config.handshake_timeout();
    match russh::server::run_stream(transport_config, stream, handler).await {
        Ok(running) => {
            // the handshake deadline: sessions not authenticated in
            // time are disconnected, afterwards the inactivity timeout
            // governs liveness
            let watchdog_handle = running.handle();
            let watchdog_activity = Arc::clone(&activity);
            tokio::spawn(async move {
                tokio::time::sleep(handshake_timeout).await;
                if !watchdog_activity.is_authenticated() {
                    debug!("handshake deadline expired, disconnecting");
                    let _ = watchdog_handle
                        .disconnect(Disconnect::ByApplication, "handshake timeout".into(), "".into())
                        .await;
                }
            });

            if let Err(e) = running.await {
                debug!(connection_id, %ip, error = %e, "connection closed with error");
            }
        }
        Err(e) => {
            debug!(connection_id, %ip, error = %e, "failed to accept connection");
        }
    }

    activity.flush_failure(&context.metrics, context.defender.as_ref(), ip);
    context.metrics.connection_closed();
}

/// Read a PROXY protocol v1 header and return the advertised source
/// address. `PROXY UNKNOWN` keeps the socket address.
async fn read_proxy_header(stream: &mut TcpStream) -> Result<Option<SocketAddr>> {
    use tokio::io::AsyncReadExt;

    // v1 header lines are at most 107 bytes including CRLF
    let mut line = Vec::with_capacity(107);
    loop {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Admission("proxy header truncated".to_string()));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 107 {
            return Err(Error::Admission("proxy header too long".to_string()));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    let header = String::from_utf8(line)
        .map_err(|_| Error::Admission("proxy header is not valid UTF-8".to_string()))?;
    parse_proxy_v1(&header)
}

fn parse_proxy_v1(header: &str) -> Result<Option<SocketAddr>> {
    let mut fields = header.split(' ');
    if fields.next() != Some("PROXY") {
        return Err(Error::Admission(format!("malformed proxy header {header:?}")));
    }
    match fields.next() {
        Some("UNKNOWN") => Ok(None),
        Some("TCP4") | Some("TCP6") => {
            let src_ip: IpAddr = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| Error::Admission("bad proxy source address".to_string()))?;
            let _dst_ip = fields
                .next()
                .ok_or_else(|| Error::Admission("bad proxy destination address".to_string()))?;
            let src_port: u16 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| Error::Admission("bad proxy source port".to_string()))?;
            Ok(Some(SocketAddr::new(src_ip, src_port)))
        }
        other => Err(Error::Admission(format!(
            "unsupported proxy protocol {other:?}"
        ))),
    }
}
