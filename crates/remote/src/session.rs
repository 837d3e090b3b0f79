//! Remote session abstraction.
//!
//! [`RemoteSession`] is one authenticated channel to either the guest shell
//! or the hypervisor host. [`SessionConnector`] opens sessions of one kind.
//! Callers are written against these traits only; the concrete transports
//! live in [`crate::ssh`] and [`crate::winrm`].

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tracing::debug;
use vmprobe_core::metrics as m;
use vmprobe_core::types::{CommandOutput, Credentials, SessionKind, SessionTarget};

use crate::error::RemoteError;

/// A single authenticated remote session.
///
/// A transport failure mid-command clears the liveness flag. After that,
/// every `execute`/`copy_to` fails with [`RemoteError::Closed`] until a new
/// session is opened.
pub trait RemoteSession: Send + Sync + 'static {
    /// Address this session is connected to.
    fn target(&self) -> &SessionTarget;

    /// Returns `false` once the session was closed or its transport failed.
    fn is_alive(&self) -> bool;

    /// Runs a command and returns its output whatever the exit code.
    ///
    /// Fails only on transport errors or when `timeout` elapses.
    fn execute(
        &self,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> impl Future<Output = Result<CommandOutput, RemoteError>> + Send;

    /// Copies a local file to `remote_path`.
    fn copy_to(
        &self,
        local_path: &Path,
        remote_path: &str,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Closes the session. Safe to call more than once.
    fn close(&self) -> impl Future<Output = ()> + Send;

    /// Runs a command and fails with [`RemoteError::CommandFailed`] on a
    /// non-zero exit code.
    fn run(
        &self,
        command: &str,
        args: &[String],
        timeout: Duration,
    ) -> impl Future<Output = Result<CommandOutput, RemoteError>> + Send {
        async move {
            let output = self.execute(command, args, timeout).await?;
            if output.success() {
                Ok(output)
            } else {
                Err(RemoteError::CommandFailed {
                    target: self.target().to_string(),
                    command: display_command(command, args),
                    output,
                })
            }
        }
    }
}

/// Opens sessions of one kind.
pub trait SessionConnector: Send + Sync + 'static {
    type Session: RemoteSession;

    /// Session kind this connector produces.
    fn kind(&self) -> SessionKind;

    /// Opens a session, retrying within the connector's budget.
    fn connect(
        &self,
        target: &SessionTarget,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Self::Session, RemoteError>> + Send;
}

/// Quotes one argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+@%".contains(&b));
    if safe {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Joins a command and its arguments for logs and error messages.
pub fn display_command(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_owned()
    } else {
        format!("{command} {}", args.join(" "))
    }
}

/// Stages a local script into `staging_dir` on a guest and runs it.
///
/// The script is copied, its line endings normalised with `dos2unix` when the
/// guest has it, marked executable and run from the staging directory.
/// Returns the script's output whatever the exit code.
pub async fn run_staged_script<S: RemoteSession>(
    session: &S,
    local_path: &Path,
    staging_dir: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput, RemoteError> {
    let file_name = local_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RemoteError::Config {
            field: "script".to_owned(),
            reason: format!("'{}' has no file name", local_path.display()),
        })?;
    let remote_path = format!("{staging_dir}/{file_name}");
    let quoted_dir = shell_quote(staging_dir);
    let quoted_path = shell_quote(&remote_path);

    session
        .run(&format!("mkdir -p {quoted_dir}"), &[], timeout)
        .await?;
    session.copy_to(local_path, &remote_path).await?;
    session
        .run(
            &format!(
                "(command -v dos2unix >/dev/null 2>&1 && dos2unix -q {quoted_path}); chmod +x {quoted_path}"
            ),
            &[],
            timeout,
        )
        .await?;

    debug!(remote = %session.target(), script = file_name, "running staged script");
    session
        .execute(
            &format!("cd {quoted_dir} && ./{}", shell_quote(file_name)),
            args,
            timeout,
        )
        .await
}

/// Records one remote command in the channel metrics.
pub(crate) fn record_command(kind: SessionKind, result: &'static str, elapsed: Duration) {
    metrics::counter!(
        m::REMOTE_COMMANDS_TOTAL,
        m::LABEL_CHANNEL => kind.as_str(),
        m::LABEL_RESULT => result
    )
    .increment(1);
    metrics::histogram!(
        m::REMOTE_COMMAND_DURATION_SECONDS,
        m::LABEL_CHANNEL => kind.as_str()
    )
    .record(elapsed.as_secs_f64());
}
