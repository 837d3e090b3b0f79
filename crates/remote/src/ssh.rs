//! OpenSSH 게스트 셸 전송
//!
//! 시스템의 `ssh`/`scp` 클라이언트 프로세스로 명령을 실행합니다.
//! 개인 키는 세션이 살아 있는 동안만 0600 임시 파일에 존재하며,
//! 세션이 drop되면 함께 삭제됩니다.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, warn};
use vmprobe_core::types::{CommandOutput, Credentials, SessionKind, SessionTarget};

use crate::config::SshSettings;
use crate::error::RemoteError;
use crate::retry::connect_with_retry;
use crate::session::{RemoteSession, SessionConnector, record_command, shell_quote};

/// OpenSSH가 접속 실패 시 반환하는 종료 코드
const SSH_TRANSPORT_EXIT: i32 = 255;

/// OpenSSH 게스트 셸 커넥터
#[derive(Debug, Clone)]
pub struct SshConnector {
    settings: SshSettings,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Result<Self, RemoteError> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &SshSettings {
        &self.settings
    }
}

impl SessionConnector for SshConnector {
    type Session = SshSession;

    fn kind(&self) -> SessionKind {
        SessionKind::GuestShell
    }

    async fn connect(
        &self,
        target: &SessionTarget,
        credentials: &Credentials,
    ) -> Result<SshSession, RemoteError> {
        let (user, private_key) = match credentials {
            Credentials::PrivateKey { user, private_key } => (user.clone(), private_key),
            Credentials::Password { .. } => {
                return Err(RemoteError::Credentials {
                    target: target.to_string(),
                    reason: "guest shell requires a private key".to_owned(),
                });
            }
        };

        let key_file = write_key_file(private_key)?;
        let session = SshSession {
            target: target.clone(),
            user,
            key_file,
            settings: self.settings.clone(),
            alive: AtomicBool::new(true),
        };

        // 게스트 부팅 직후에는 sshd가 아직 떠 있지 않으므로 접속 확인을 재시도합니다.
        connect_with_retry(target, self.settings.retry, |attempt| {
            let session = &session;
            async move {
                debug!(remote = %session.target, attempt, "probing guest shell");
                let output = session
                    .spawn_ssh("true", session.settings.connect_timeout)
                    .await?;
                if output.exit_code == SSH_TRANSPORT_EXIT {
                    return Err(RemoteError::Transport {
                        target: session.target.to_string(),
                        reason: first_line(&output.stderr),
                    });
                }
                Ok(())
            }
        })
        .await?;

        info!(remote = %target, user = %session.user, "guest shell session opened");
        Ok(session)
    }
}

/// OpenSSH 게스트 셸 세션
pub struct SshSession {
    target: SessionTarget,
    user: String,
    key_file: NamedTempFile,
    settings: SshSettings,
    alive: AtomicBool,
}

impl SshSession {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.target.address)
    }

    /// 공통 옵션: 호스트 키 검사 비활성화, 비대화식, 접속 제한 시간
    fn common_options(&self) -> Vec<String> {
        vec![
            "-i".to_owned(),
            self.key_file.path().display().to_string(),
            "-o".to_owned(),
            "StrictHostKeyChecking=no".to_owned(),
            "-o".to_owned(),
            "UserKnownHostsFile=/dev/null".to_owned(),
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            "LogLevel=ERROR".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout={}", self.settings.connect_timeout.as_secs().max(1)),
        ]
    }

    fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-p".to_owned());
        args.push(self.target.port.to_string());
        args.push(self.destination());
        args.push(remote_command.to_owned());
        args
    }

    fn scp_args(&self, local_path: &Path, remote_path: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-P".to_owned());
        args.push(self.target.port.to_string());
        args.push(local_path.display().to_string());
        args.push(format!("{}:{}", self.destination(), remote_path));
        args
    }

    async fn spawn_ssh(
        &self,
        remote_command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        self.spawn(&self.settings.ssh_program, self.ssh_args(remote_command), remote_command, timeout)
            .await
    }

    async fn spawn(
        &self,
        program: &str,
        args: Vec<String>,
        label: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        let started = tokio::time::Instant::now();
        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(CommandOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    // 시그널로 종료된 경우 종료 코드가 없음
                    exit_code: output.status.code().unwrap_or(-1),
                    duration: started.elapsed(),
                })
            }
            Err(_elapsed) => Err(RemoteError::Timeout {
                target: self.target.to_string(),
                command: label.to_owned(),
                budget: timeout,
                partial: String::new(),
            }),
        }
    }

    fn ensure_alive(&self) -> Result<(), RemoteError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(RemoteError::Closed {
                target: self.target.to_string(),
            })
        }
    }

    fn mark_dead(&self, reason: &str) -> RemoteError {
        self.alive.store(false, Ordering::SeqCst);
        warn!(remote = %self.target, reason, "guest shell transport failed");
        RemoteError::Transport {
            target: self.target.to_string(),
            reason: reason.to_owned(),
        }
    }
}

impl RemoteSession for SshSession {
    fn target(&self) -> &SessionTarget {
        &self.target
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn execute(
        &self,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        self.ensure_alive()?;
        let remote_command = remote_command_line(command, args);
        debug!(remote = %self.target, command = %remote_command, "guest command");

        let result = self.spawn_ssh(&remote_command, timeout).await;
        match result {
            Ok(output) if output.exit_code == SSH_TRANSPORT_EXIT => {
                record_command(SessionKind::GuestShell, "transport_error", output.duration);
                Err(self.mark_dead(&first_line(&output.stderr)))
            }
            Ok(output) => {
                let label = if output.success() { "success" } else { "failure" };
                record_command(SessionKind::GuestShell, label, output.duration);
                Ok(output)
            }
            Err(e) => {
                record_command(SessionKind::GuestShell, "error", timeout);
                Err(e)
            }
        }
    }

    async fn copy_to(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        self.ensure_alive()?;
        let args = self.scp_args(local_path, remote_path);
        let label = format!("scp {} {remote_path}", local_path.display());
        let output = self
            .spawn(&self.settings.scp_program, args, &label, self.settings.command_timeout)
            .await?;

        match output.exit_code {
            0 => Ok(()),
            SSH_TRANSPORT_EXIT => Err(self.mark_dead(&first_line(&output.stderr))),
            _ => Err(RemoteError::CommandFailed {
                target: self.target.to_string(),
                command: label,
                output,
            }),
        }
    }

    async fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            debug!(remote = %self.target, "guest shell session closed");
        }
    }
}

/// 원격 명령줄: 인자는 셸 인용 처리
fn remote_command_line(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        return command.to_owned();
    }
    let quoted: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
    format!("{command} {}", quoted.join(" "))
}

fn write_key_file(private_key: &str) -> Result<NamedTempFile, RemoteError> {
    // NamedTempFile은 유닉스에서 0600 권한으로 생성됨
    let mut file = tempfile::Builder::new().prefix("vmprobe-key-").tempfile()?;
    file.write_all(private_key.as_bytes())?;
    if !private_key.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(file)
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("connection failed")
        .to_owned()
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("target", &self.target)
            .field("user", &self.user)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}
