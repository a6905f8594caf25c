//! Built-in SSH exec commands.
//!
//! A small fixed set of commands is served in-process: SCP, the digest
//! helpers (`md5sum` .. `sha512sum`), and the `cd`/`pwd` helpers some
//! mobile SFTP clients use to discover their start directory. `cd` does
//! nothing and `pwd` always answers `/`: client paths are virtual and
//! rooted at the user's storage root.

use std::sync::Arc;

use md5::{Digest, Md5};
use russh::server::Msg;
use russh::Channel;
use russh::ChannelMsg;
use sandpiper_core::{OpenParams, Vfs};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::scp;

/// Every SSH command the daemon knows how to serve.
pub const SUPPORTED_SSH_COMMANDS: &[&str] = &[
    "scp", "md5sum", "sha1sum", "sha256sum", "sha384sum", "sha512sum", "cd", "pwd",
];

/// Commands enabled when the configuration does not say otherwise.
pub fn default_ssh_commands() -> Vec<String> {
    ["md5sum", "sha1sum", "cd", "pwd"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Expand the configured command list: `*` enables everything,
/// unsupported names are dropped with a warning.
pub fn effective_ssh_commands(configured: &[String]) -> Vec<String> {
    if configured.iter().any(|c| c == "*") {
        return SUPPORTED_SSH_COMMANDS.iter().map(|s| s.to_string()).collect();
    }
    let mut commands = Vec::new();
    for raw in configured {
        let name = raw.trim();
        if SUPPORTED_SSH_COMMANDS.contains(&name) {
            if !commands.iter().any(|c| c == name) {
                commands.push(name.to_string());
            }
        } else {
            warn!(command = name, "unsupported ssh command ignored");
        }
    }
    commands
}

/// A parsed exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Parse the raw exec payload into a command line.
pub fn parse_command_payload(payload: &[u8]) -> Result<SshCommand> {
    let line = std::str::from_utf8(payload)
        .map_err(|_| Error::Command("exec payload is not valid UTF-8".to_string()))?;
    let mut parts = split_command_line(line)?;
    if parts.is_empty() {
        return Err(Error::Command("empty exec payload".to_string()));
    }
    let program = parts.remove(0);
    Ok(SshCommand {
        program,
        args: parts,
    })
}

/// Split a command line honoring single quotes, double quotes and
/// backslash escapes.
fn split_command_line(line: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_part = false;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if quote != Some('\'') => {
                escaped = true;
                in_part = true;
            }
            '\'' | '"' => match quote {
                Some(q) if q == c => quote = None,
                Some(_) => current.push(c),
                None => {
                    quote = Some(c);
                    in_part = true;
                }
            },
            c if c.is_whitespace() && quote.is_none() => {
                if in_part {
                    parts.push(std::mem::take(&mut current));
                    in_part = false;
                }
            }
            c => {
                current.push(c);
                in_part = true;
            }
        }
    }
    if quote.is_some() || escaped {
        return Err(Error::Command(format!("malformed command line {line:?}")));
    }
    if in_part {
        parts.push(current);
    }
    Ok(parts)
}

/// Whether a parsed command may run under the effective enabled set.
pub fn is_command_enabled(command: &SshCommand, enabled: &[String]) -> bool {
    enabled.iter().any(|c| c == &command.program)
}

/// Everything a command needs to run against one session channel.
pub struct CommandSession {
    pub channel: Channel<Msg>,
    pub vfs: Arc<dyn Vfs>,
    pub connection_id: String,
    pub username: String,
}

impl CommandSession {
    async fn finish(&self, exit_status: u32) {
        let _ = self.channel.exit_status(exit_status).await;
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
    }
}

/// Run a validated command to completion on its channel.
pub async fn execute(command: SshCommand, mut session: CommandSession) -> Result<()> {
    info!(
        connection_id = %session.connection_id,
        username = %session.username,
        program = %command.program,
        "serving ssh command"
    );
    let outcome = match command.program.as_str() {
        "cd" => Ok(()),
        "pwd" => session
            .channel
            .data(&b"/\n"[..])
            .await
            .map_err(Error::from),
        "scp" => scp::execute(&command.args, &mut session).await,
        program => match DigestKind::from_name(program) {
            Some(kind) => run_digest(kind, &command.args, &mut session).await,
            None => Err(Error::Command(format!("unsupported command {program:?}"))),
        },
    };
    match outcome {
        Ok(()) => {
            session.finish(0).await;
            Ok(())
        }
        Err(e) => {
            warn!(
                connection_id = %session.connection_id,
                program = %command.program,
                error = %e,
                "ssh command failed"
            );
            let message = format!("{e}\n");
            let _ = session.channel.extended_data(1, message.as_bytes()).await;
            session.finish(1).await;
            Err(e)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DigestKind {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "md5sum" => Some(DigestKind::Md5),
            "sha1sum" => Some(DigestKind::Sha1),
            "sha256sum" => Some(DigestKind::Sha256),
            "sha384sum" => Some(DigestKind::Sha384),
            "sha512sum" => Some(DigestKind::Sha512),
            _ => None,
        }
    }
}

async fn run_digest(
    kind: DigestKind,
    args: &[String],
    session: &mut CommandSession,
) -> Result<()> {
    let (digest, label) = match args.first() {
        Some(path) => {
            let file = session
                .vfs
                .open(
                    path,
                    OpenParams {
                        read: true,
                        ..Default::default()
                    },
                )
                .await?;
            (hash_reader(kind, file).await?, path.clone())
        }
        None => {
            let data = read_channel_to_end(&mut session.channel).await?;
            (hash_reader(kind, &data[..]).await?, "-".to_string())
        }
    };
    debug!(label = %label, "digest computed");
    let line = format!("{digest}  {label}\n");
    session.channel.data(line.as_bytes()).await?;
    Ok(())
}

async fn hash_reader<R>(kind: DigestKind, reader: R) -> Result<String>
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    match kind {
        DigestKind::Md5 => hash_with::<Md5, R>(reader).await,
        DigestKind::Sha1 => hash_with::<Sha1, R>(reader).await,
        DigestKind::Sha256 => hash_with::<Sha256, R>(reader).await,
        DigestKind::Sha384 => hash_with::<Sha384, R>(reader).await,
        DigestKind::Sha512 => hash_with::<Sha512, R>(reader).await,
    }
}

async fn hash_with<D, R>(mut reader: R) -> Result<String>
where
    D: Digest,
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let mut hasher = D::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Drain the channel's inbound data until EOF.
async fn read_channel_to_end(channel: &mut Channel<Msg>) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data: chunk } => data.extend_from_slice(&chunk),
            ChannelMsg::Eof | ChannelMsg::Close => break,
            _ => {}
        }
    }
    Ok(data)
}
