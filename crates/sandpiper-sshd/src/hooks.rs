//! External hooks: post-connect and keyboard-interactive authentication.
//!
//! A hook endpoint is either an absolute path to a local executable or an
//! `http(s)://` URL. Command hooks get their input through environment
//! variables (post-connect) or line-delimited JSON on stdin/stdout
//! (keyboard-interactive); HTTP hooks get a GET with query parameters or
//! a POST with a JSON body.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use sandpiper_core::Protocol;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Timeout applied to every hook interaction.
const HOOK_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub enum HookEndpoint {
    Command(PathBuf),
    Http(String),
}

impl HookEndpoint {
    /// Parse a configured hook value. Empty means "no hook"; a command
    /// must be an absolute path to an existing file.
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(Some(HookEndpoint::Http(raw.to_string())));
        }
        let path = Path::new(raw);
        if !path.is_absolute() {
            return Err(Error::Config(format!(
                "invalid hook program {raw:?}: must be an absolute path"
            )));
        }
        if !path.exists() {
            return Err(Error::Config(format!(
                "invalid hook program {raw:?}: file does not exist"
            )));
        }
        Ok(Some(HookEndpoint::Command(path.to_path_buf())))
    }
}

/// Run the post-connect hook for a new connection. Any failure rejects
/// the connection.
pub async fn execute_post_connect_hook(
    endpoint: &HookEndpoint,
    ip: IpAddr,
    protocol: Protocol,
) -> Result<()> {
    match endpoint {
        HookEndpoint::Command(path) => {
            let status = tokio::time::timeout(
                HOOK_TIMEOUT,
                Command::new(path)
                    .env("SANDPIPER_CONNECTION_IP", ip.to_string())
                    .env("SANDPIPER_CONNECTION_PROTOCOL", protocol.as_str())
                    .status(),
            )
            .await
            .map_err(|_| Error::Admission("post-connect hook timed out".to_string()))?
            .map_err(|e| Error::Admission(format!("post-connect hook failed to start: {e}")))?;
            if status.success() {
                Ok(())
            } else {
                Err(Error::Admission(format!(
                    "post-connect hook rejected the connection, exit status: {status}"
                )))
            }
        }
        HookEndpoint::Http(url) => {
            let client = reqwest::Client::builder()
                .timeout(HOOK_TIMEOUT)
                .build()
                .map_err(|e| Error::Admission(format!("post-connect hook client error: {e}")))?;
            let response = client
                .get(url)
                .query(&[("ip", ip.to_string()), ("protocol", protocol.to_string())])
                .send()
                .await
                .map_err(|e| Error::Admission(format!("post-connect hook request error: {e}")))?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(Error::Admission(format!(
                    "post-connect hook rejected the connection, status: {}",
                    response.status()
                )))
            }
        }
    }
}

/// One round of keyboard-interactive prompts.
#[derive(Debug, Clone)]
pub struct KeyboardAuthRound {
    pub instruction: String,
    /// Prompt text and whether the client may echo the answer
    pub questions: Vec<(String, bool)>,
    /// When set, the first answer of this round must additionally match
    /// the user's password in the store
    pub check_password: bool,
}

#[derive(Debug)]
pub enum KeyboardAuthStep {
    Round(KeyboardAuthRound),
    Success,
    Failure,
}

#[derive(Serialize)]
struct KeyboardAuthHookRequest<'a> {
    request_id: &'a str,
    step: u32,
    username: &'a str,
    ip: String,
    answers: &'a [String],
    questions: &'a [String],
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct KeyboardAuthHookResponse {
    auth_result: i32,
    instruction: String,
    questions: Vec<String>,
    echos: Vec<bool>,
    check_password: i32,
}

struct HookChild {
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Driver for one keyboard-interactive conversation.
///
/// Without an endpoint the built-in fallback issues a single password
/// prompt which the caller validates against the user store.
pub struct KeyboardAuthSession {
    endpoint: Option<HookEndpoint>,
    request_id: String,
    username: String,
    ip: IpAddr,
    step: u32,
    last_questions: Vec<String>,
    child: Option<HookChild>,
}

impl KeyboardAuthSession {
    pub fn new(endpoint: Option<HookEndpoint>, username: &str, ip: IpAddr) -> Self {
        Self {
            endpoint,
            request_id: Uuid::new_v4().simple().to_string(),
            username: username.to_string(),
            ip,
            step: 0,
            last_questions: Vec::new(),
            child: None,
        }
    }

    /// Feed the client's answers (empty on the first call) and get the
    /// next step of the conversation.
    pub async fn advance(&mut self, answers: &[String]) -> Result<KeyboardAuthStep> {
        self.step += 1;
        match self.endpoint.clone() {
            None => Ok(self.advance_builtin()),
            Some(HookEndpoint::Command(path)) => self.advance_command(&path, answers).await,
            Some(HookEndpoint::Http(url)) => self.advance_http(&url, answers).await,
        }
    }

    fn advance_builtin(&mut self) -> KeyboardAuthStep {
        if self.step == 1 {
            KeyboardAuthStep::Round(KeyboardAuthRound {
                instruction: String::new(),
                questions: vec![("Password: ".to_string(), false)],
                check_password: true,
            })
        } else {
            // the caller verified the password answer before advancing
            KeyboardAuthStep::Success
        }
    }

    async fn advance_command(
        &mut self,
        path: &Path,
        answers: &[String],
    ) -> Result<KeyboardAuthStep> {
        if self.child.is_none() {
            let mut child = Command::new(path)
                .env("SANDPIPER_AUTHD_USERNAME", &self.username)
                .env("SANDPIPER_AUTHD_IP", self.ip.to_string())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| Error::Other(format!("keyboard interactive hook spawn: {e}")))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::Other("keyboard interactive hook has no stdin".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| Error::Other("keyboard interactive hook has no stdout".into()))?;
            self.child = Some(HookChild {
                _child: child,
                stdin,
                stdout: BufReader::new(stdout),
            });
        }

        let request = serde_json::to_string(&KeyboardAuthHookRequest {
            request_id: &self.request_id,
            step: self.step,
            username: &self.username,
            ip: self.ip.to_string(),
            answers,
            questions: &self.last_questions,
        })
        .map_err(|e| Error::Other(format!("keyboard interactive hook encode: {e}")))?;

        let Some(child) = self.child.as_mut() else {
            return Err(Error::Other(
                "keyboard interactive hook is not running".to_string(),
            ));
        };
        let response = tokio::time::timeout(HOOK_TIMEOUT, async {
            child.stdin.write_all(request.as_bytes()).await?;
            child.stdin.write_all(b"\n").await?;
            child.stdin.flush().await?;
            let mut line = String::new();
            child.stdout.read_line(&mut line).await?;
            Ok::<String, std::io::Error>(line)
        })
        .await
        .map_err(|_| Error::Other("keyboard interactive hook timed out".to_string()))?
        .map_err(|e| Error::Other(format!("keyboard interactive hook I/O: {e}")))?;

        let response: KeyboardAuthHookResponse = serde_json::from_str(response.trim())
            .map_err(|e| Error::Other(format!("keyboard interactive hook response: {e}")))?;
        Ok(self.interpret(response))
    }

    async fn advance_http(&mut self, url: &str, answers: &[String]) -> Result<KeyboardAuthStep> {
        let client = reqwest::Client::builder()
            .timeout(HOOK_TIMEOUT)
            .build()
            .map_err(|e| Error::Other(format!("keyboard interactive hook client: {e}")))?;
        let response = client
            .post(url)
            .json(&KeyboardAuthHookRequest {
                request_id: &self.request_id,
                step: self.step,
                username: &self.username,
                ip: self.ip.to_string(),
                answers,
                questions: &self.last_questions,
            })
            .send()
            .await
            .map_err(|e| Error::Other(format!("keyboard interactive hook request: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Other(format!(
                "keyboard interactive hook status: {}",
                response.status()
            )));
        }
        let response: KeyboardAuthHookResponse = response
            .json()
            .await
            .map_err(|e| Error::Other(format!("keyboard interactive hook response: {e}")))?;
        Ok(self.interpret(response))
    }

    fn interpret(&mut self, response: KeyboardAuthHookResponse) -> KeyboardAuthStep {
        match response.auth_result {
            1 => KeyboardAuthStep::Success,
            -1 => KeyboardAuthStep::Failure,
            _ if response.questions.is_empty() => {
                warn!(request_id = %self.request_id, "hook sent no questions, failing auth");
                KeyboardAuthStep::Failure
            }
            _ => {
                self.last_questions = response.questions.clone();
                let questions = response
                    .questions
                    .into_iter()
                    .enumerate()
                    .map(|(i, q)| (q, response.echos.get(i).copied().unwrap_or(false)))
                    .collect();
                debug!(request_id = %self.request_id, step = self.step, "hook sent prompts");
                KeyboardAuthStep::Round(KeyboardAuthRound {
                    instruction: response.instruction,
                    questions,
                    check_password: response.check_password == 1,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        assert!(HookEndpoint::parse("").unwrap().is_none());
        assert!(matches!(
            HookEndpoint::parse("https://auth.example.com/kb").unwrap(),
            Some(HookEndpoint::Http(_))
        ));
        // relative paths are invalid
        assert!(HookEndpoint::parse("relative/hook.sh").is_err());
        // absolute but missing
        assert!(HookEndpoint::parse("/definitely/not/here").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_endpoint_parse_existing_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hook.sh");
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        let parsed = HookEndpoint::parse(path.to_str().unwrap()).unwrap();
        assert!(matches!(parsed, Some(HookEndpoint::Command(_))));
    }

    #[tokio::test]
    async fn test_builtin_flow() {
        let ip = "127.0.0.1".parse().unwrap();
        let mut session = KeyboardAuthSession::new(None, "alice", ip);
        match session.advance(&[]).await.unwrap() {
            KeyboardAuthStep::Round(round) => {
                assert_eq!(round.questions.len(), 1);
                assert!(round.check_password);
                assert!(!round.questions[0].1, "password must not echo");
            }
            other => panic!("expected a prompt round, got {other:?}"),
        }
        let answers = vec!["secret".to_string()];
        assert!(matches!(
            session.advance(&answers).await.unwrap(),
            KeyboardAuthStep::Success
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_hook_conversation() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb-hook.sh");
        std::fs::write(
            &path,
            concat!(
                "#!/bin/sh\n",
                "read request\n",
                "echo '{\"auth_result\":0,\"instruction\":\"demo\",",
                "\"questions\":[\"Token: \"],\"echos\":[true]}'\n",
                "read request\n",
                "case \"$request\" in\n",
                "  *42*) echo '{\"auth_result\":1}' ;;\n",
                "  *) echo '{\"auth_result\":-1}' ;;\n",
                "esac\n"
            ),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let endpoint = HookEndpoint::parse(path.to_str().unwrap()).unwrap();
        let ip = "127.0.0.1".parse().unwrap();

        let mut session = KeyboardAuthSession::new(endpoint.clone(), "alice", ip);
        match session.advance(&[]).await.unwrap() {
            KeyboardAuthStep::Round(round) => {
                assert_eq!(round.instruction, "demo");
                assert_eq!(round.questions, vec![("Token: ".to_string(), true)]);
            }
            other => panic!("expected prompts, got {other:?}"),
        }
        assert!(matches!(
            session.advance(&["42".to_string()]).await.unwrap(),
            KeyboardAuthStep::Success
        ));

        // wrong token fails
        let mut session = KeyboardAuthSession::new(endpoint, "alice", ip);
        session.advance(&[]).await.unwrap();
        assert!(matches!(
            session.advance(&["7".to_string()]).await.unwrap(),
            KeyboardAuthStep::Failure
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_post_connect_hook_command() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let accept = dir.path().join("accept.sh");
        std::fs::write(&accept, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&accept, std::fs::Permissions::from_mode(0o755)).unwrap();
        let reject = dir.path().join("reject.sh");
        std::fs::write(&reject, "#!/bin/sh\nexit 1\n").unwrap();
        std::fs::set_permissions(&reject, std::fs::Permissions::from_mode(0o755)).unwrap();

        let ip = "127.0.0.1".parse().unwrap();
        let accept = HookEndpoint::parse(accept.to_str().unwrap()).unwrap().unwrap();
        assert!(execute_post_connect_hook(&accept, ip, Protocol::Ssh)
            .await
            .is_ok());
        let reject = HookEndpoint::parse(reject.to_str().unwrap()).unwrap().unwrap();
        assert!(execute_post_connect_hook(&reject, ip, Protocol::Ssh)
            .await
            .is_err());
    }
}
