//! Per-connection SSH session handler.
//!
//! Implements the transport's server callbacks: the authentication
//! state machine (public key, certificate, password,
//! keyboard-interactive, multi-factor combinations) and the channel
//! dispatcher that routes `subsystem=sftp` to the SFTP server and
//! `exec` to the built-in command processor. Only session channels are
//! served.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::FutureExt;
use russh::keys::{Certificate, HashAlg, PublicKey};
use russh::server::{Auth, Handler, Msg, Response, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use sandpiper_core::{Defender, LocalFs, LoginMethod, Protocol, User, UserStore, Vfs};
use tracing::{debug, error, info};

use crate::auth::{
    finalize_login, record_login_attempt, AuthActivity, AuthState, LoginOutcome,
};
use crate::certs::CertChecker;
use crate::commands::{self, CommandSession, SshCommand};
use crate::config::Config;
use crate::connection::{ConnProtocol, ConnectionRegistry, SessionInfo};
use crate::error::Error;
use crate::hooks::{HookEndpoint, KeyboardAuthSession, KeyboardAuthStep};
use crate::metrics::Metrics;
use crate::prefix::PrefixedHandler;
use crate::sftp::SftpHandler;

/// Everything the per-connection handlers share.
pub(crate) struct ServerContext {
    pub config: Config,
    pub store: Arc<dyn UserStore>,
    pub defender: Arc<dyn Defender>,
    pub registry: Arc<ConnectionRegistry>,
    pub cert_checker: Arc<CertChecker>,
    pub metrics: Metrics,
    /// Normalised folder prefix; `None` when not configured
    pub folder_prefix: Option<String>,
    pub date_layout: Option<String>,
    /// Effective SSH command set (empty when a prefix is configured)
    pub enabled_commands: Vec<String>,
    pub keyboard_interactive_enabled: bool,
    pub keyboard_interactive_hook: Option<HookEndpoint>,
}

pub(crate) struct SshSession {
    ctx: Arc<ServerContext>,
    remote: SocketAddr,
    connection_id: String,
    state: AuthState,
    activity: Arc<AuthActivity>,
    login: Option<LoginOutcome>,
    channels: HashMap<ChannelId, (Channel<Msg>, u64)>,
    channel_counter: u64,
    kb_session: Option<KeyboardAuthSession>,
    kb_check_password: bool,
    kb_user: Option<User>,
}

impl SshSession {
    pub(crate) fn new(
        ctx: Arc<ServerContext>,
        remote: SocketAddr,
        connection_id: String,
        activity: Arc<AuthActivity>,
    ) -> Self {
        Self {
            ctx,
            remote,
            connection_id,
            state: AuthState::default(),
            activity,
            login: None,
            channels: HashMap::new(),
            channel_counter: 0,
            kb_session: None,
            kb_check_password: false,
            kb_user: None,
        }
    }

    fn ip(&self) -> IpAddr {
        self.remote.ip()
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    fn partial_success_reject(&self, next_methods: &[LoginMethod]) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(to_method_set(next_methods)),
            partial_success: true,
        }
    }

    /// Common success path: run the final login check and keep the
    /// outcome as the connection's one and only user snapshot.
    fn complete_login(
        &mut self,
        user: User,
        method: LoginMethod,
        key_description: Option<String>,
        cert: Option<crate::certs::CertAuthInfo>,
    ) -> Result<Auth, Error> {
        let outcome = finalize_login(
            &self.ctx.registry,
            &self.connection_id,
            user,
            method,
            key_description,
            self.ip(),
            &self.state.partial_success,
            cert,
        )?;
        self.login = Some(outcome);
        Ok(Auth::Accept)
    }

    fn record_failure(&self, username: &str, method: LoginMethod, error: &Error) {
        record_login_attempt(
            &self.ctx.metrics,
            self.ctx.defender.as_ref(),
            username,
            self.ip(),
            method,
            Some(error),
        );
    }

    fn record_success(&self, username: &str, method: LoginMethod) {
        record_login_attempt(
            &self.ctx.metrics,
            self.ctx.defender.as_ref(),
            username,
            self.ip(),
            method,
            None,
        );
    }

    async fn try_publickey(
        &mut self,
        username: &str,
        key: &PublicKey,
    ) -> Result<PubkeyOutcome, Error> {
        let method = LoginMethod::PublicKey;
        let offered = key
            .to_openssh()
            .map_err(|e| Error::auth(method, Error::Other(format!("unusable public key: {e}"))))?;
        let user = self
            .ctx
            .store
            .check_user_and_pubkey(username, &offered, self.ip(), Protocol::Ssh, false)
            .await
            .map_err(|e| Error::auth(method, e.into()))?;

        if user.is_partial_auth(method) {
            debug!(
                connection_id = %self.connection_id,
                username,
                "user authenticated with partial success"
            );
            let next = user.next_auth_methods(
                &[LoginMethod::PublicKey],
                self.ctx.config.password_authentication,
            );
            return Ok(PubkeyOutcome::Partial(next));
        }

        let mut description = key.fingerprint(HashAlg::Sha256).to_string();
        if !key.comment().is_empty() {
            description = format!("{description} {}", key.comment());
        }
        let auth = self
            .complete_login(user, method, Some(description), None)
            .map_err(|e| Error::auth(method, e))?;
        Ok(PubkeyOutcome::Done(auth))
    }

    async fn try_certificate(
        &mut self,
        username: &str,
        cert: &Certificate,
    ) -> Result<PubkeyOutcome, Error> {
        let method = LoginMethod::PublicKey;
        // certificate validation runs before the user store is consulted
        let cert_info = self
            .ctx
            .cert_checker
            .check_user_cert(username, self.ip(), cert)
            .await
            .map_err(|e| Error::auth(method, e))?;

        let certified = PublicKey::new(cert.public_key().clone(), "");
        let offered = certified
            .to_openssh()
            .map_err(|e| Error::auth(method, Error::Other(format!("unusable public key: {e}"))))?;
        let user = self
            .ctx
            .store
            .check_user_and_pubkey(username, &offered, self.ip(), Protocol::Ssh, true)
            .await
            .map_err(|e| Error::auth(method, e.into()))?;

        if user.is_partial_auth(method) {
            debug!(
                connection_id = %self.connection_id,
                username,
                "user authenticated with partial success"
            );
            let next = user.next_auth_methods(
                &[LoginMethod::PublicKey],
                self.ctx.config.password_authentication,
            );
            return Ok(PubkeyOutcome::Partial(next));
        }

        let description = cert_info.describe();
        let auth = self
            .complete_login(user, method, Some(description), Some(cert_info))
            .map_err(|e| Error::auth(method, e))?;
        Ok(PubkeyOutcome::Done(auth))
    }

    fn handle_pubkey_result(&mut self, username: &str, result: Result<PubkeyOutcome, Error>) -> Auth {
        match result {
            Ok(PubkeyOutcome::Partial(next)) => {
                self.state.record_partial_success(LoginMethod::PublicKey);
                self.partial_success_reject(&next)
            }
            Ok(PubkeyOutcome::Done(auth)) => {
                self.record_success(username, LoginMethod::PublicKey);
                auth
            }
            Err(e) => {
                self.record_failure(username, LoginMethod::PublicKey, &e);
                self.activity.note_pubkey_failure(e.is_not_found());
                Self::reject()
            }
        }
    }

    fn reset_keyboard_state(&mut self) {
        self.kb_session = None;
        self.kb_check_password = false;
        self.kb_user = None;
    }

    /// Hand a session channel to the SFTP server, wrapped with the
    /// prefix middleware when a folder prefix is configured.
    fn spawn_sftp(
        &self,
        channel: Channel<Msg>,
        channel_id: ChannelId,
        session_id: String,
        login: LoginOutcome,
        handle: russh::server::Handle,
    ) {
        let ctx = Arc::clone(&self.ctx);
        let info = SessionInfo {
            id: session_id.clone(),
            username: login.user.username.clone(),
            protocol: ConnProtocol::Sftp,
            remote_ip: self.remote.ip(),
            connected_at: chrono::Utc::now(),
        };
        let guard = self.ctx.registry.add_session(info);
        tokio::spawn(async move {
            let task = async move {
                let _guard = guard;
                let vfs: Arc<dyn Vfs> = Arc::new(LocalFs::new(&login.user.home_dir));
                let handler = SftpHandler::new(
                    session_id.clone(),
                    login.user.username.clone(),
                    vfs,
                    login.user.filters.start_directory.clone(),
                    ctx.date_layout.is_some(),
                );
                let stream = channel.into_stream();
                match &ctx.folder_prefix {
                    Some(prefix) => {
                        let wrapped = PrefixedHandler::new(
                            prefix.clone(),
                            ctx.date_layout.clone(),
                            handler,
                        );
                        russh_sftp::server::run(stream, wrapped).await;
                    }
                    None => russh_sftp::server::run(stream, handler).await,
                }
                info!(connection_id = %session_id, "sftp session closed");
                let _ = handle.exit_status_request(channel_id, 0).await;
                let _ = handle.eof(channel_id).await;
                let _ = handle.close(channel_id).await;
            };
            if let Err(panic) = std::panic::AssertUnwindSafe(task).catch_unwind().await {
                error!(?panic, "panic in sftp session task");
            }
        });
    }

    fn spawn_command(
        &self,
        command: SshCommand,
        channel: Channel<Msg>,
        session_id: String,
        login: LoginOutcome,
    ) {
        let info = SessionInfo {
            id: session_id.clone(),
            username: login.user.username.clone(),
            protocol: ConnProtocol::SshExec,
            remote_ip: self.remote.ip(),
            connected_at: chrono::Utc::now(),
        };
        let guard = self.ctx.registry.add_session(info);
        tokio::spawn(async move {
            let task = async move {
                let _guard = guard;
                let vfs: Arc<dyn Vfs> = Arc::new(LocalFs::new(&login.user.home_dir));
                let session = CommandSession {
                    channel,
                    vfs,
                    connection_id: session_id.clone(),
                    username: login.user.username.clone(),
                };
                if let Err(e) = commands::execute(command, session).await {
                    debug!(connection_id = %session_id, error = %e, "command finished with error");
                }
            };
            if let Err(panic) = std::panic::AssertUnwindSafe(task).catch_unwind().await {
                error!(?panic, "panic in ssh command task");
            }
        });
    }
}

enum PubkeyOutcome {
    Partial(Vec<LoginMethod>),
    Done(Auth),
}

fn to_method_set(methods: &[LoginMethod]) -> MethodSet {
    let kinds: Vec<MethodKind> = methods
        .iter()
        .filter_map(|m| match m {
            LoginMethod::Password => Some(MethodKind::Password),
            LoginMethod::PublicKey => Some(MethodKind::PublicKey),
            LoginMethod::KeyboardInteractive => Some(MethodKind::KeyboardInteractive),
            _ => None,
        })
        .collect();
    MethodSet::from(&kinds[..])
}

impl Handler for SshSession {
    type Error = Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.activity.note_attempt();
        self.state.attempts += 1;
        let result = self.try_publickey(user, public_key).await;
        Ok(self.handle_pubkey_result(user, result))
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        self.activity.note_attempt();
        self.state.attempts += 1;
        let result = self.try_certificate(user, certificate).await;
        Ok(self.handle_pubkey_result(user, result))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.activity.note_attempt();
        self.state.attempts += 1;
        if !self.ctx.config.password_authentication {
            let err = Error::auth(
                LoginMethod::Password,
                Error::Core(sandpiper_core::Error::MethodDisabled(
                    "password authentication is disabled".to_string(),
                )),
            );
            self.record_failure(user, LoginMethod::Password, &err);
            return Ok(Self::reject());
        }
        let method = self.state.effective_method(LoginMethod::Password);
        let result = async {
            let account = self
                .ctx
                .store
                .check_user_and_password(user, password, self.ip(), Protocol::Ssh)
                .await
                .map_err(|e| Error::auth(method, e.into()))?;
            self.complete_login(account, method, None, None)
                .map_err(|e| Error::auth(method, e))
        }
        .await;
        match result {
            Ok(auth) => {
                self.record_success(user, method);
                Ok(auth)
            }
            Err(e) => {
                self.record_failure(user, method, &e);
                Ok(Self::reject())
            }
        }
    }

    async fn auth_keyboard_interactive<'a>(
        &'a mut self,
        user: &str,
        _submethods: &str,
        response: Option<Response<'a>>,
    ) -> Result<Auth, Self::Error> {
        self.activity.note_attempt();
        let method = self.state.effective_method(LoginMethod::KeyboardInteractive);
        if !self.ctx.keyboard_interactive_enabled {
            let err = Error::auth(
                method,
                Error::Core(sandpiper_core::Error::MethodDisabled(
                    "keyboard interactive authentication is disabled".to_string(),
                )),
            );
            self.record_failure(user, method, &err);
            return Ok(Self::reject());
        }

        let answers: Vec<String> = response
            .map(|r| r.map(|a| String::from_utf8_lossy(&a).into_owned()).collect())
            .unwrap_or_default();

        if self.kb_session.is_none() {
            self.state.attempts += 1;
            self.kb_session = Some(KeyboardAuthSession::new(
                self.ctx.keyboard_interactive_hook.clone(),
                user,
                self.ip(),
            ));
        }

        // a round flagged check_password validates its first answer
        // against the store before the conversation continues
        if self.kb_check_password {
            self.kb_check_password = false;
            let Some(password) = answers.first() else {
                let err = Error::auth(method, Error::Other("missing password answer".to_string()));
                self.record_failure(user, method, &err);
                self.reset_keyboard_state();
                return Ok(Self::reject());
            };
            match self
                .ctx
                .store
                .check_user_and_password(user, password, self.ip(), Protocol::Ssh)
                .await
            {
                Ok(account) => self.kb_user = Some(account),
                Err(e) => {
                    let err = Error::auth(method, e.into());
                    self.record_failure(user, method, &err);
                    self.reset_keyboard_state();
                    return Ok(Self::reject());
                }
            }
        }

        let step = match self.kb_session.as_mut() {
            Some(kb) => kb.advance(&answers).await,
            None => Err(Error::Other("no keyboard interactive session".to_string())),
        };
        match step {
            Ok(KeyboardAuthStep::Round(round)) => {
                self.kb_check_password = round.check_password;
                let prompts: Vec<(Cow<'static, str>, bool)> = round
                    .questions
                    .into_iter()
                    .map(|(question, echo)| (Cow::Owned(question), echo))
                    .collect();
                Ok(Auth::Partial {
                    name: Cow::Borrowed(""),
                    instructions: Cow::Owned(round.instruction),
                    prompts: Cow::Owned(prompts),
                })
            }
            Ok(KeyboardAuthStep::Success) => {
                let account = match self.kb_user.take() {
                    Some(account) => Ok(account),
                    None => self.ctx.store.get_user(user).await.map_err(Error::from),
                };
                let result = account
                    .map_err(|e| Error::auth(method, e))
                    .and_then(|account| {
                        self.complete_login(account, method, None, None)
                            .map_err(|e| Error::auth(method, e))
                    });
                self.reset_keyboard_state();
                match result {
                    Ok(auth) => {
                        self.record_success(user, method);
                        Ok(auth)
                    }
                    Err(e) => {
                        self.record_failure(user, method, &e);
                        Ok(Self::reject())
                    }
                }
            }
            Ok(KeyboardAuthStep::Failure) => {
                let err = Error::auth(
                    method,
                    Error::Other("keyboard interactive authentication failed".to_string()),
                );
                self.record_failure(user, method, &err);
                self.reset_keyboard_state();
                Ok(Self::reject())
            }
            Err(e) => {
                let err = Error::auth(method, e);
                self.record_failure(user, method, &err);
                self.reset_keyboard_state();
                Ok(Self::reject())
            }
        }
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        self.activity.note_authenticated();
        if let Some(login) = &self.login {
            info!(
                connection_id = %self.connection_id,
                username = %login.user.username,
                method = %login.method_description,
                remote = %self.remote,
                "user logged in"
            );
            self.ctx.store.update_last_login(&login.user.username).await;
        }
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channel_counter += 1;
        debug!(
            connection_id = %self.connection_id,
            channel = self.channel_counter,
            "session channel opened"
        );
        self.channels
            .insert(channel.id(), (channel, self.channel_counter));
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(connection_id = %self.connection_id, "rejecting direct-tcpip channel");
        Ok(false)
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(connection_id = %self.connection_id, "rejecting x11 channel");
        Ok(false)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let login = self.login.clone();
        let entry = self.channels.remove(&channel_id);
        match (name, login, entry) {
            ("sftp", Some(login), Some((channel, counter))) => {
                let session_id = format!("{}_{}", self.connection_id, counter);
                info!(
                    connection_id = %session_id,
                    username = %login.user.username,
                    "starting sftp subsystem"
                );
                let _ = session.channel_success(channel_id);
                let handle = session.handle();
                self.spawn_sftp(channel, channel_id, session_id, login, handle);
            }
            (other, _, _) => {
                debug!(
                    connection_id = %self.connection_id,
                    subsystem = other,
                    "rejecting subsystem request"
                );
                let _ = session.channel_failure(channel_id);
            }
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(login) = self.login.clone() else {
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };
        // a folder prefix disables the exec surface entirely
        if self.ctx.folder_prefix.is_some() {
            debug!(
                connection_id = %self.connection_id,
                "folder prefix configured, exec requests are refused"
            );
            let _ = session.channel_failure(channel_id);
            return Ok(());
        }
        let command = match commands::parse_command_payload(data) {
            Ok(command) => command,
            Err(e) => {
                debug!(connection_id = %self.connection_id, error = %e, "bad exec payload");
                let _ = session.channel_failure(channel_id);
                return Ok(());
            }
        };
        if !commands::is_command_enabled(&command, &self.ctx.enabled_commands) {
            debug!(
                connection_id = %self.connection_id,
                program = %command.program,
                "command not enabled"
            );
            let _ = session.channel_failure(channel_id);
            return Ok(());
        }
        let Some((channel, counter)) = self.channels.remove(&channel_id) else {
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };
        let session_id = format!("{}_{}", self.connection_id, counter);
        let _ = session.channel_success(channel_id);
        self.spawn_command(command, channel, session_id, login);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(connection_id = %self.connection_id, "rejecting shell request");
        let _ = session.channel_failure(channel_id);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(connection_id = %self.connection_id, "rejecting pty request");
        let _ = session.channel_failure(channel_id);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_failure(channel_id);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel_id);
        Ok(())
    }
}
