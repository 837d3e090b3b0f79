//! Scripted remote connectors.
//!
//! A [`ScriptedConnector`] hands out sessions that record every command and
//! answer from a reply table: the first entry whose pattern is a substring
//! of the command line wins, everything else exits 0 with empty output.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vmprobe_core::types::{CommandOutput, Credentials, SessionKind, SessionTarget};
use vmprobe_remote::{RemoteError, RemoteSession, SessionConnector, display_command};

/// Shared log of everything the connector and its sessions saw.
#[derive(Default)]
pub struct SessionLog {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub targets: Mutex<Vec<SessionTarget>>,
    pub users: Mutex<Vec<String>>,
    pub commands: Mutex<Vec<String>>,
    pub copies: Mutex<Vec<(PathBuf, String)>>,
}

pub struct ScriptedConnector {
    kind: SessionKind,
    replies: Arc<Vec<(String, i32, String, String)>>,
    fail_connect: bool,
    log: Arc<SessionLog>,
}

#[allow(dead_code)]
impl ScriptedConnector {
    pub fn guest() -> Self {
        Self::new(SessionKind::GuestShell)
    }

    pub fn host() -> Self {
        Self::new(SessionKind::HostManagement)
    }

    fn new(kind: SessionKind) -> Self {
        Self {
            kind,
            replies: Arc::new(Vec::new()),
            fail_connect: false,
            log: Arc::new(SessionLog::default()),
        }
    }

    /// Answers commands containing `pattern` with `exit_code` and `stdout`.
    pub fn reply(self, pattern: &str, exit_code: i32, stdout: &str) -> Self {
        self.reply_with_stderr(pattern, exit_code, stdout, "")
    }

    /// Like [`reply`](Self::reply) but also writes `stderr`.
    pub fn reply_with_stderr(
        mut self,
        pattern: &str,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
    ) -> Self {
        Arc::make_mut(&mut self.replies).push((
            pattern.to_owned(),
            exit_code,
            stdout.to_owned(),
            stderr.to_owned(),
        ));
        self
    }

    /// Every connect attempt fails as if the retry budget ran out.
    pub fn unreachable(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn connects(&self) -> usize {
        self.log.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.log.closes.load(Ordering::SeqCst)
    }

    pub fn targets(&self) -> Vec<SessionTarget> {
        self.log.targets.lock().unwrap().clone()
    }

    pub fn users(&self) -> Vec<String> {
        self.log.users.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.commands.lock().unwrap().clone()
    }

    pub fn copies(&self) -> Vec<(PathBuf, String)> {
        self.log.copies.lock().unwrap().clone()
    }

    /// Commands containing `needle`.
    pub fn commands_matching(&self, needle: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }
}

impl SessionConnector for ScriptedConnector {
    type Session = ScriptedSession;

    fn kind(&self) -> SessionKind {
        self.kind
    }

    async fn connect(
        &self,
        target: &SessionTarget,
        credentials: &Credentials,
    ) -> Result<ScriptedSession, RemoteError> {
        self.log.targets.lock().unwrap().push(target.clone());
        self.log.users.lock().unwrap().push(credentials.user().to_owned());
        if self.fail_connect {
            return Err(RemoteError::Connection {
                target: target.to_string(),
                attempts: 3,
                reason: "connection refused".to_owned(),
            });
        }
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedSession {
            target: target.clone(),
            alive: AtomicBool::new(true),
            replies: Arc::clone(&self.replies),
            log: Arc::clone(&self.log),
        })
    }
}

pub struct ScriptedSession {
    target: SessionTarget,
    alive: AtomicBool,
    replies: Arc<Vec<(String, i32, String, String)>>,
    log: Arc<SessionLog>,
}

impl RemoteSession for ScriptedSession {
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
        _timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        if !self.is_alive() {
            return Err(RemoteError::Closed {
                target: self.target.to_string(),
            });
        }
        let line = display_command(command, args);
        self.log.commands.lock().unwrap().push(line.clone());
        let (exit_code, stdout, stderr) = self
            .replies
            .iter()
            .find(|(pattern, _, _, _)| line.contains(pattern.as_str()))
            .map(|(_, code, out, err)| (*code, out.clone(), err.clone()))
            .unwrap_or((0, String::new(), String::new()));
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            ..CommandOutput::default()
        })
    }

    async fn copy_to(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        self.log
            .copies
            .lock()
            .unwrap()
            .push((local_path.to_path_buf(), remote_path.to_owned()));
        Ok(())
    }

    async fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
