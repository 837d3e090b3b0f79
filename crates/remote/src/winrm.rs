//! WinRM host-management transport.
//!
//! Speaks WS-Management SOAP over HTTP(S) with basic auth. One session owns
//! one remote `cmd` shell; every command runs as Command → Receive (until the
//! command state is Done) → Signal terminate. Closing deletes the shell.
//!
//! Command lines are passed verbatim to the remote command processor.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use reqwest::{Client, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vmprobe_core::types::{CommandOutput, Credentials, SessionKind, SessionTarget};

use crate::config::WinRmSettings;
use crate::error::RemoteError;
use crate::retry::connect_with_retry;
use crate::session::{RemoteSession, SessionConnector, display_command, record_command};

const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";
const RESOURCE_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// WSManFault code for a Receive that produced no output within the operation timeout.
const FAULT_OPERATION_TIMEOUT: &str = "2150858793";
const MAX_ENVELOPE_SIZE: u32 = 153_600;

/// WinRM host-management connector.
pub struct WinRmConnector {
    settings: WinRmSettings,
    http: Client,
    parser: Arc<SoapParser>,
}

impl WinRmConnector {
    pub fn new(settings: WinRmSettings) -> Result<Self, RemoteError> {
        settings.validate()?;
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| RemoteError::Config {
                field: "host".to_owned(),
                reason: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self {
            settings,
            http,
            parser: Arc::new(SoapParser::new()?),
        })
    }

    pub fn settings(&self) -> &WinRmSettings {
        &self.settings
    }
}

impl SessionConnector for WinRmConnector {
    type Session = WinRmSession;

    fn kind(&self) -> SessionKind {
        SessionKind::HostManagement
    }

    async fn connect(
        &self,
        target: &SessionTarget,
        credentials: &Credentials,
    ) -> Result<WinRmSession, RemoteError> {
        let (user, password) = match credentials {
            Credentials::Password { user, password } => (user.clone(), password.clone()),
            Credentials::PrivateKey { .. } => {
                return Err(RemoteError::Credentials {
                    target: target.to_string(),
                    reason: "host management requires a password".to_owned(),
                });
            }
        };

        let session = WinRmSession {
            target: target.clone(),
            endpoint: self.settings.endpoint(&target.address, target.port),
            user,
            password,
            http: self.http.clone(),
            parser: Arc::clone(&self.parser),
            operation_timeout: self.settings.operation_timeout,
            shell_id: Mutex::new(None),
            alive: AtomicBool::new(true),
        };

        let shell_id = connect_with_retry(target, self.settings.retry, |attempt| {
            let session = &session;
            async move {
                debug!(remote = %session.target, attempt, "creating remote shell");
                session.create_shell().await
            }
        })
        .await?;

        info!(remote = %target, user = %session.user, shell_id = %shell_id, "host session opened");
        *session.shell_id.lock().await = Some(shell_id);
        Ok(session)
    }
}

/// One remote `cmd` shell on the hypervisor host.
pub struct WinRmSession {
    target: SessionTarget,
    endpoint: String,
    user: String,
    password: String,
    http: Client,
    parser: Arc<SoapParser>,
    operation_timeout: Duration,
    shell_id: Mutex<Option<String>>,
    alive: AtomicBool,
}

/// Output gathered so far by a running command.
#[derive(Default)]
struct Collected {
    command_id: Option<String>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
}

enum SoapReply {
    Body(String),
    OperationTimedOut,
}

impl WinRmSession {
    async fn create_shell(&self) -> Result<String, RemoteError> {
        let options = "<w:OptionSet>\
             <w:Option Name=\"WINRS_NOPROFILE\">FALSE</w:Option>\
             <w:Option Name=\"WINRS_CODEPAGE\">65001</w:Option>\
             </w:OptionSet>";
        let body = "<rsp:Shell>\
             <rsp:InputStreams>stdin</rsp:InputStreams>\
             <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>\
             </rsp:Shell>";
        let reply = self
            .post(self.envelope(ACTION_CREATE, None, options, body))
            .await?;
        self.parser.shell_id(&expect_body(reply)?)
    }

    fn envelope(&self, action: &str, shell_id: Option<&str>, options: &str, body: &str) -> String {
        build_envelope(
            &self.endpoint,
            action,
            shell_id,
            self.operation_timeout,
            options,
            body,
        )
    }

    async fn post(&self, envelope: String) -> Result<SoapReply, RemoteError> {
        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Credentials {
                target: self.target.to_string(),
                reason: format!("user '{}' was rejected", self.user),
            });
        }
        let text = response.text().await?;
        if status.is_success() {
            return Ok(SoapReply::Body(text));
        }
        if text.contains(FAULT_OPERATION_TIMEOUT) {
            return Ok(SoapReply::OperationTimedOut);
        }
        Err(RemoteError::Protocol(
            self.parser
                .fault(&text)
                .unwrap_or_else(|| format!("HTTP {} from {}", status.as_u16(), self.endpoint)),
        ))
    }

    async fn run_command(
        &self,
        shell_id: &str,
        command_line: &str,
        collected: &mut Collected,
    ) -> Result<(), RemoteError> {
        let options = "<w:OptionSet>\
             <w:Option Name=\"WINRS_CONSOLEMODE_STDIN\">TRUE</w:Option>\
             <w:Option Name=\"WINRS_SKIP_CMD_SHELL\">FALSE</w:Option>\
             </w:OptionSet>";
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            xml_escape(command_line)
        );
        let reply = self
            .post(self.envelope(ACTION_COMMAND, Some(shell_id), options, &body))
            .await?;
        let command_id = self.parser.command_id(&expect_body(reply)?)?;
        collected.command_id = Some(command_id.clone());

        let receive = format!(
            "<rsp:Receive><rsp:DesiredStream CommandId=\"{command_id}\">stdout stderr</rsp:DesiredStream></rsp:Receive>"
        );
        loop {
            let reply = self
                .post(self.envelope(ACTION_RECEIVE, Some(shell_id), "", &receive))
                .await?;
            let text = match reply {
                SoapReply::Body(text) => text,
                SoapReply::OperationTimedOut => continue,
            };
            let chunk = self.parser.receive(&text)?;
            collected.stdout.extend(chunk.stdout);
            collected.stderr.extend(chunk.stderr);
            if chunk.exit_code.is_some() {
                collected.exit_code = chunk.exit_code;
            }
            if chunk.done {
                return Ok(());
            }
        }
    }

    /// Best-effort terminate; the shell stays usable either way.
    async fn terminate(&self, shell_id: &str, command_id: &str) {
        let body = format!(
            "<rsp:Signal CommandId=\"{command_id}\"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"
        );
        if let Err(e) = self
            .post(self.envelope(ACTION_SIGNAL, Some(shell_id), "", &body))
            .await
        {
            debug!(remote = %self.target, error = %e, "terminate signal failed");
        }
    }

    async fn current_shell(&self) -> Result<String, RemoteError> {
        if !self.is_alive() {
            return Err(self.closed());
        }
        self.shell_id.lock().await.clone().ok_or_else(|| self.closed())
    }

    fn closed(&self) -> RemoteError {
        RemoteError::Closed {
            target: self.target.to_string(),
        }
    }
}

impl RemoteSession for WinRmSession {
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
        let shell_id = self.current_shell().await?;
        let command_line = display_command(command, args);
        debug!(remote = %self.target, command = %command_line, "host command");

        let started = tokio::time::Instant::now();
        let mut collected = Collected::default();
        let result = tokio::time::timeout(
            timeout,
            self.run_command(&shell_id, &command_line, &mut collected),
        )
        .await;
        let elapsed = started.elapsed();

        if let Some(command_id) = collected.command_id.as_deref() {
            self.terminate(&shell_id, command_id).await;
        }

        match result {
            Ok(Ok(())) => {
                let output = CommandOutput {
                    stdout: String::from_utf8_lossy(&collected.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&collected.stderr).into_owned(),
                    exit_code: collected.exit_code.unwrap_or(-1),
                    duration: elapsed,
                };
                let label = if output.success() { "success" } else { "failure" };
                record_command(SessionKind::HostManagement, label, elapsed);
                Ok(output)
            }
            Ok(Err(e)) => {
                record_command(SessionKind::HostManagement, "transport_error", elapsed);
                if matches!(e, RemoteError::Transport { .. }) {
                    self.alive.store(false, Ordering::SeqCst);
                    warn!(remote = %self.target, error = %e, "host transport failed");
                }
                Err(e)
            }
            Err(_elapsed) => {
                record_command(SessionKind::HostManagement, "timeout", elapsed);
                Err(RemoteError::Timeout {
                    target: self.target.to_string(),
                    command: command_line,
                    budget: timeout,
                    partial: String::from_utf8_lossy(&collected.stdout).into_owned(),
                })
            }
        }
    }

    async fn copy_to(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        // 호스트 스크립트는 호스트에 미리 배포되어 있어야 함
        Err(RemoteError::Protocol(format!(
            "file copy is not supported over WinRM ({} -> {remote_path})",
            local_path.display()
        )))
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let Some(shell_id) = self.shell_id.lock().await.take() else {
            return;
        };
        let envelope = self.envelope(ACTION_DELETE, Some(&shell_id), "", "");
        match self.post(envelope).await {
            Ok(_) => debug!(remote = %self.target, shell_id = %shell_id, "remote shell deleted"),
            Err(e) => warn!(remote = %self.target, error = %e, "failed to delete remote shell"),
        }
    }
}

impl std::fmt::Debug for WinRmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinRmSession")
            .field("target", &self.target)
            .field("endpoint", &self.endpoint)
            .field("user", &self.user)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

fn expect_body(reply: SoapReply) -> Result<String, RemoteError> {
    match reply {
        SoapReply::Body(text) => Ok(text),
        SoapReply::OperationTimedOut => {
            Err(RemoteError::Protocol("operation timed out".to_owned()))
        }
    }
}

fn build_envelope(
    endpoint: &str,
    action: &str,
    shell_id: Option<&str>,
    operation_timeout: Duration,
    options: &str,
    body: &str,
) -> String {
    let selector = shell_id
        .map(|id| {
            format!(
                "<w:SelectorSet><w:Selector Name=\"ShellId\">{}</w:Selector></w:SelectorSet>",
                xml_escape(id)
            )
        })
        .unwrap_or_default();
    let message_id = uuid::Uuid::new_v4();
    let timeout_secs = operation_timeout.as_secs().max(1);

    format!(
        "<s:Envelope xmlns:s=\"{NS_SOAP}\" xmlns:a=\"{NS_ADDRESSING}\" xmlns:w=\"{NS_WSMAN}\" xmlns:rsp=\"{NS_SHELL}\">\
         <s:Header>\
         <a:To>{endpoint}</a:To>\
         <a:ReplyTo><a:Address s:mustUnderstand=\"true\">{ANONYMOUS}</a:Address></a:ReplyTo>\
         <w:MaxEnvelopeSize s:mustUnderstand=\"true\">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>\
         <a:MessageID>uuid:{message_id}</a:MessageID>\
         <w:Locale xml:lang=\"en-US\" s:mustUnderstand=\"false\"/>\
         <w:OperationTimeout>PT{timeout_secs}S</w:OperationTimeout>\
         <w:ResourceURI s:mustUnderstand=\"true\">{RESOURCE_CMD}</w:ResourceURI>\
         <a:Action s:mustUnderstand=\"true\">{action}</a:Action>\
         {selector}{options}\
         </s:Header>\
         <s:Body>{body}</s:Body>\
         </s:Envelope>",
        endpoint = xml_escape(endpoint),
    )
}

fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// One Receive response.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReceiveChunk {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
    done: bool,
}

/// Regex-based extraction of the few WS-Management elements we need.
struct SoapParser {
    shell_id: Regex,
    command_id: Regex,
    stream: Regex,
    stream_name: Regex,
    done: Regex,
    exit_code: Regex,
    fault_message: Regex,
    fault_text: Regex,
}

impl SoapParser {
    fn new() -> Result<Self, RemoteError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| RemoteError::Protocol(format!("bad pattern: {e}")))
        };
        Ok(Self {
            shell_id: compile(r"<(?:\w+:)?ShellId>\s*([^<\s]+)\s*</")?,
            command_id: compile(r"<(?:\w+:)?CommandId>\s*([^<\s]+)\s*</")?,
            stream: compile(r"<(?:\w+:)?Stream\b([^>]*)>([^<]*)</(?:\w+:)?Stream>")?,
            stream_name: compile(r#"Name="(\w+)""#)?,
            done: compile(r#"<(?:\w+:)?CommandState\b[^>]*State="[^"]*/Done""#)?,
            exit_code: compile(r"<(?:\w+:)?ExitCode>\s*(-?\d+)\s*</")?,
            fault_message: compile(r"<(?:\w+:)?Message>\s*([^<]+?)\s*</")?,
            fault_text: compile(r"<(?:\w+:)?Text\b[^>]*>\s*([^<]+?)\s*</")?,
        })
    }

    fn shell_id(&self, text: &str) -> Result<String, RemoteError> {
        capture(&self.shell_id, text)
            .ok_or_else(|| RemoteError::Protocol("create response has no ShellId".to_owned()))
    }

    fn command_id(&self, text: &str) -> Result<String, RemoteError> {
        capture(&self.command_id, text)
            .ok_or_else(|| RemoteError::Protocol("command response has no CommandId".to_owned()))
    }

    fn receive(&self, text: &str) -> Result<ReceiveChunk, RemoteError> {
        let mut chunk = ReceiveChunk::default();
        for caps in self.stream.captures_iter(text) {
            let attrs = caps.get(1).map_or("", |m| m.as_str());
            let content = caps.get(2).map_or("", |m| m.as_str()).trim();
            if content.is_empty() {
                continue;
            }
            let decoded = STANDARD
                .decode(content)
                .map_err(|e| RemoteError::Protocol(format!("bad stream encoding: {e}")))?;
            match capture(&self.stream_name, attrs).as_deref() {
                Some("stderr") => chunk.stderr.extend(decoded),
                _ => chunk.stdout.extend(decoded),
            }
        }
        chunk.done = self.done.is_match(text);
        chunk.exit_code = capture(&self.exit_code, text)
            .and_then(|code| code.parse::<i64>().ok())
            // Windows 종료 코드는 u32이므로 i32로 래핑
            .map(|code| code as i32);
        Ok(chunk)
    }

    fn fault(&self, text: &str) -> Option<String> {
        capture(&self.fault_message, text).or_else(|| capture(&self.fault_text, text))
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
}
