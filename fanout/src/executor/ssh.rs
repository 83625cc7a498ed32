// Bundled SSH worker: one task per host behind a semaphore, blocking ssh2
// sessions on the blocking pool, per-attempt retry with jittered backoff.
use super::{ErrorReceiver, OutputReceiver, Parameter, TransferFile, Worker};
use crate::config;
use crate::formatter::Output;
use crate::util;
use color_eyre::Report;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ssh2::{CheckResult, KnownHostFileKind, Session};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

// Retry jitter comes from one generator, seeded once per process.
static BACKOFF_RNG: Lazy<Mutex<StdRng>> = Lazy::new(|| Mutex::new(StdRng::from_entropy()));

fn backoff_ms() -> u64 {
    BACKOFF_RNG.lock().gen_range(0..1000)
}

#[derive(Debug, Error)]
pub enum SshError {
    #[error("Connection Timeout.")]
    ConnectTimeout,
    #[error("Execution Timeout.")]
    ExecutionTimeout,
    #[error("invalid port: {0}")]
    BadPort(String),
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("authentication failed for {user}@{host}")]
    Auth { user: String, host: String },
    #[error("no host key from {host}")]
    MissingHostKey { host: String },
    #[error("host key mismatch for {host}")]
    HostKeyMismatch { host: String },
    #[error("no known host key for {host}")]
    UnknownHostKey { host: String },
    #[error("host key check failed for {host}")]
    HostKeyCheck { host: String },
    #[error(transparent)]
    Ssh(#[from] ssh2::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How the worker treats remote host keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    /// Verify against `~/.ssh/known_hosts`; unknown and mismatched keys
    /// both fail the host.
    #[default]
    KnownHosts,
    /// Trust whatever the remote presents.
    AcceptAny,
}

impl TrustPolicy {
    pub fn parse(value: &str) -> Self {
        match value {
            "accept-any" => TrustPolicy::AcceptAny,
            _ => TrustPolicy::KnownHosts,
        }
    }
}

/// Authentication material shared by every host of a run.
#[derive(Debug, Default)]
struct AuthSet {
    keys: Vec<PathBuf>,
    passwd: Option<String>,
}

fn default_key_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    ["id_rsa", "id_dsa"]
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|path| path.is_file())
        .collect()
}

/// Writes the scp sink framing for one file: `C<perm> <size> <basename>`,
/// the raw bytes, then the NUL trailer.
fn write_sink_frame<W: Write>(writer: &mut W, transfer: &TransferFile) -> std::io::Result<()> {
    write!(
        writer,
        "C{} {} {}\n",
        transfer.perm,
        transfer.data.len(),
        transfer.basename
    )?;
    writer.write_all(&transfer.data)?;
    writer.write_all(b"\x00")?;
    writer.flush()
}

/// Prefixes `cmd` with the scp staging pipeline (wrapped in the transfer
/// hooks) when the job ships a file.
fn assemble_cmd(data: &Parameter, cmd: &str) -> String {
    let transfer_cmd = match &data.transfer {
        Some(transfer) if transfer.ready() => format!(
            "cd {} && /usr/bin/scp -qrt . && echo '{} saved.'",
            transfer.destination, transfer.dst
        ),
        _ => String::new(),
    };
    let staged = data.wrap_cmd_with_hook(&transfer_cmd);
    util::wrap_cmd_before(cmd, &staged)
}

/// One host's worth of work.
struct SshItem {
    host: String,
    alias: String,
    port: String,
    user: String,
    cmd: String,
    timeout: u64,
    retry: i32,
    policy: TrustPolicy,
    auth: Arc<AuthSet>,
    transfer: Option<Arc<TransferFile>>,
}

/// Time left before `deadline`; the attempt's budget is spent once this
/// hits zero.
fn remaining(deadline: Instant) -> Result<Duration, SshError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(SshError::ConnectTimeout)
    } else {
        Ok(left)
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline
        .map(|deadline| Instant::now() >= deadline)
        .unwrap_or(false)
}

// libssh2 reports an expired session timeout as LIBSSH2_ERROR_TIMEOUT (-9)
fn is_ssh_timeout(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(-9))
}

impl SshItem {
    /// One connection attempt: TCP, handshake, host-key check, auth. When a
    /// timeout is configured, a single budget covers all of it, and any
    /// phase outliving the deadline fails the attempt with
    /// "Connection Timeout.".
    fn connect_once(&self) -> Result<Session, SshError> {
        let port: u16 = self
            .port
            .parse()
            .map_err(|_| SshError::BadPort(self.port.clone()))?;
        let deadline = (self.timeout > 0)
            .then(|| Instant::now() + Duration::from_secs(self.timeout));

        let tcp = match deadline {
            Some(deadline) => {
                let addr = (self.host.as_str(), port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| SshError::Resolve(self.host.clone()))?;
                TcpStream::connect_timeout(&addr, remaining(deadline)?).map_err(|err| {
                    if err.kind() == std::io::ErrorKind::TimedOut {
                        SshError::ConnectTimeout
                    } else {
                        SshError::Io(err)
                    }
                })?
            }
            None => TcpStream::connect((self.host.as_str(), port))?,
        };

        let mut sess = Session::new()?;
        if let Some(deadline) = deadline {
            // hand the unspent part of the budget to libssh2; lifted again
            // before exec
            sess.set_timeout(remaining(deadline)?.as_millis().max(1) as u32);
        }
        sess.set_tcp_stream(tcp);
        sess.handshake().map_err(|err| {
            if is_ssh_timeout(&err) || deadline_passed(deadline) {
                SshError::ConnectTimeout
            } else {
                SshError::Ssh(err)
            }
        })?;
        self.check_host_key(&sess, port)?;
        self.authenticate(&sess).map_err(|err| {
            if deadline_passed(deadline) {
                SshError::ConnectTimeout
            } else {
                err
            }
        })?;
        sess.set_timeout(0);
        Ok(sess)
    }

    fn check_host_key(&self, sess: &Session, port: u16) -> Result<(), SshError> {
        if self.policy == TrustPolicy::AcceptAny {
            return Ok(());
        }
        let mut known_hosts = sess.known_hosts()?;
        if let Some(home) = dirs::home_dir() {
            let file = home.join(".ssh").join("known_hosts");
            if file.is_file() {
                known_hosts.read_file(&file, KnownHostFileKind::OpenSSH)?;
            }
        }
        let (key, _) = sess.host_key().ok_or_else(|| SshError::MissingHostKey {
            host: self.host.clone(),
        })?;
        match known_hosts.check_port(&self.host, port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::Mismatch => Err(SshError::HostKeyMismatch {
                host: self.host.clone(),
            }),
            CheckResult::NotFound => Err(SshError::UnknownHostKey {
                host: self.host.clone(),
            }),
            CheckResult::Failure => Err(SshError::HostKeyCheck {
                host: self.host.clone(),
            }),
        }
    }

    fn authenticate(&self, sess: &Session) -> Result<(), SshError> {
        for key in &self.auth.keys {
            match sess.userauth_pubkey_file(&self.user, None, key, None) {
                Ok(()) if sess.authenticated() => return Ok(()),
                Err(err) if is_ssh_timeout(&err) => return Err(SshError::ConnectTimeout),
                _ => {}
            }
        }
        if let Some(passwd) = &self.auth.passwd {
            match sess.userauth_password(&self.user, passwd) {
                Ok(()) if sess.authenticated() => return Ok(()),
                Err(err) if is_ssh_timeout(&err) => return Err(SshError::ConnectTimeout),
                _ => {}
            }
        }
        Err(SshError::Auth {
            user: self.user.clone(),
            host: self.host.clone(),
        })
    }

    fn connect_with_retry(&self) -> Result<Session, SshError> {
        let mut retry = self.retry;
        loop {
            match self.connect_once() {
                Ok(sess) => return Ok(sess),
                Err(err) => {
                    retry -= 1;
                    if retry < 0 {
                        return Err(err);
                    }
                    debug!(host = %self.host, %err, retries_left = retry + 1, "reconnecting");
                    std::thread::sleep(Duration::from_millis(backoff_ms()));
                }
            }
        }
    }

    /// Runs the command over an exec channel, shipping the file first when
    /// one is staged. stdin gets EOF only after the NUL trailer, before the
    /// exit status is awaited.
    fn exec_session(&self, sess: Session) -> Result<(String, String, i32), SshError> {
        let mut channel = sess.channel_session()?;
        channel.exec(&self.cmd)?;
        if let Some(transfer) = &self.transfer {
            write_sink_frame(&mut channel, transfer)?;
        }
        channel.send_eof()?;

        let mut stdout_buf = Vec::new();
        channel.read_to_end(&mut stdout_buf)?;
        let mut stderr_buf = Vec::new();
        channel.stderr().read_to_end(&mut stderr_buf)?;
        channel.wait_close()?;
        let exit_code = channel.exit_status()?;

        let stdout = String::from_utf8_lossy(&stdout_buf).trim().to_string();
        let stderr = String::from_utf8_lossy(&stderr_buf).trim().to_string();
        Ok((stdout, stderr, exit_code))
    }
}

fn failure_output(alias: String, hostname: String, error: String) -> Output {
    Output {
        index: 0,
        alias,
        hostname,
        stdout: String::new(),
        stderr: String::new(),
        error,
        exit_code: -1,
    }
}

async fn run_host(item: SshItem) -> Output {
    let alias = item.alias.clone();
    let hostname = item.host.clone();
    let timeout = item.timeout;

    let connect =
        tokio::task::spawn_blocking(move || item.connect_with_retry().map(|sess| (item, sess)));
    let (item, sess) = match connect.await {
        Ok(Ok(connected)) => connected,
        Ok(Err(err)) => return failure_output(alias, hostname, err.to_string()),
        Err(join_err) => return failure_output(alias, hostname, join_err.to_string()),
    };

    // the deadline only abandons the wait; the blocking task keeps the
    // session and closes it whenever the remote side lets go
    let exec = tokio::task::spawn_blocking(move || item.exec_session(sess));
    let joined = if timeout > 0 {
        match tokio::time::timeout(Duration::from_secs(timeout), exec).await {
            Ok(joined) => joined,
            Err(_) => {
                return failure_output(alias, hostname, SshError::ExecutionTimeout.to_string())
            }
        }
    } else {
        exec.await
    };

    match joined {
        Ok(Ok((stdout, stderr, exit_code))) => {
            if exit_code != 0 {
                Output {
                    index: 0,
                    alias,
                    hostname,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: stderr,
                    exit_code,
                }
            } else {
                Output {
                    index: 0,
                    alias,
                    hostname,
                    stdout,
                    stderr,
                    error: String::new(),
                    exit_code: 0,
                }
            }
        }
        Ok(Err(err)) => failure_output(alias, hostname, err.to_string()),
        Err(join_err) => failure_output(alias, hostname, join_err.to_string()),
    }
}

/// The bundled `ssh` worker.
pub struct SshWorker {
    items: Vec<SshItem>,
    concurrency: i64,
}

impl SshWorker {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            concurrency: 1,
        }
    }
}

impl Default for SshWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for SshWorker {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn init(&mut self, data: &Parameter) -> Result<(), Report> {
        let auth = Arc::new(AuthSet {
            keys: default_key_files(),
            passwd: if data.passwd.is_empty() {
                None
            } else {
                Some(data.passwd.clone())
            },
        });
        let policy = TrustPolicy::parse(
            &std::env::var("FANOUT_HOSTKEY").unwrap_or_else(|_| config::get_string("hostkey")),
        );
        let transfer = data
            .transfer
            .as_ref()
            .filter(|transfer| transfer.ready())
            .map(|transfer| Arc::new(transfer.clone()));

        self.concurrency = data.concurrency;
        self.items = data
            .host_info_list
            .iter()
            .map(|info| {
                let base_cmd = info.cmd.as_deref().unwrap_or(data.cmd.as_str());
                SshItem {
                    host: info.host.clone(),
                    alias: info.alias.clone(),
                    port: info.port.clone(),
                    user: info
                        .user
                        .clone()
                        .unwrap_or_else(|| data.user.clone()),
                    cmd: assemble_cmd(data, base_cmd),
                    timeout: data.timeout,
                    retry: data.retry,
                    policy,
                    auth: Arc::clone(&auth),
                    transfer: transfer.clone(),
                }
            })
            .collect();
        Ok(())
    }

    fn execute(&mut self, done: CancellationToken) -> (OutputReceiver, ErrorReceiver) {
        let (tx, rx) = mpsc::channel(self.items.len().max(1));
        let (_err_tx, err_rx) = mpsc::channel::<Report>(1);
        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1) as usize));
        for item in self.items.drain(..) {
            let tx = tx.clone();
            let semaphore = Arc::clone(&semaphore);
            let done = done.clone();
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                if done.is_cancelled() {
                    return;
                }
                let output = run_host(item).await;
                tokio::select! {
                    _ = done.cancelled() => {}
                    _ = tx.send(output) => {}
                }
            });
        }
        (rx, err_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TransferHook;
    use crate::hostlist::HostInfo;

    fn transfer_fixture() -> TransferFile {
        TransferFile {
            data: b"AB".to_vec(),
            perm: "0644".to_string(),
            basename: "x".to_string(),
            destination: "/tmp".to_string(),
            dst: "/tmp/x".to_string(),
            hook: None,
        }
    }

    #[test]
    fn sink_frame_bytes() {
        let mut sink = Vec::new();
        write_sink_frame(&mut sink, &transfer_fixture()).unwrap();
        let mut expected = b"C0644 2 x\n".to_vec();
        expected.extend_from_slice(b"AB");
        expected.push(0);
        assert_eq!(sink, expected);
    }

    #[test]
    fn assembles_transfer_command_before_the_main_one() {
        let data = Parameter {
            transfer: Some(transfer_fixture()),
            ..Default::default()
        };
        assert_eq!(
            assemble_cmd(&data, "hostname"),
            "cd /tmp && /usr/bin/scp -qrt . && echo '/tmp/x saved.' && hostname"
        );
    }

    #[test]
    fn assembles_hooks_around_the_transfer() {
        let mut transfer = transfer_fixture();
        transfer.hook = Some(TransferHook {
            before: "pwd".to_string(),
            after: "uptime".to_string(),
        });
        let data = Parameter {
            transfer: Some(transfer),
            ..Default::default()
        };
        assert_eq!(
            assemble_cmd(&data, ""),
            "pwd && cd /tmp && /usr/bin/scp -qrt . && echo '/tmp/x saved.' && cd /tmp && uptime"
        );
    }

    #[test]
    fn plain_command_passes_through() {
        let data = Parameter::default();
        assert_eq!(assemble_cmd(&data, "uptime"), "uptime");
    }

    #[test]
    fn trust_policy_parsing() {
        assert_eq!(TrustPolicy::parse("accept-any"), TrustPolicy::AcceptAny);
        assert_eq!(TrustPolicy::parse("known-hosts"), TrustPolicy::KnownHosts);
        assert_eq!(TrustPolicy::parse(""), TrustPolicy::KnownHosts);
    }

    #[test]
    fn backoff_stays_under_a_second() {
        for _ in 0..100 {
            assert!(backoff_ms() < 1000);
        }
    }

    fn closed_port() -> u16 {
        // bind to grab a free port, then drop the listener so connects fail
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn failed_connect_emits_exactly_one_output() {
        let port = closed_port();
        let mut worker = SshWorker::new();
        let data = Parameter {
            user: "nobody".to_string(),
            cmd: "true".to_string(),
            concurrency: 1,
            retry: 1,
            host_info_list: vec![HostInfo {
                host: "127.0.0.1".to_string(),
                alias: "dead".to_string(),
                port: port.to_string(),
                user: Some("nobody".to_string()),
                cmd: Some("true".to_string()),
                index: 0,
            }],
            ..Default::default()
        };
        worker.init(&data).unwrap();

        let done = CancellationToken::new();
        let (mut rx, _err_rx) = worker.execute(done);
        let mut outputs = Vec::new();
        while let Some(output) = rx.recv().await {
            outputs.push(output);
        }
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].exit_code, -1);
        assert_eq!(outputs[0].alias, "dead");
        assert!(!outputs[0].error.is_empty());
    }

    #[tokio::test]
    async fn cancelled_worker_drops_results() {
        let port = closed_port();
        let mut worker = SshWorker::new();
        let data = Parameter {
            user: "nobody".to_string(),
            concurrency: 1,
            retry: 0,
            host_info_list: vec![HostInfo {
                host: "127.0.0.1".to_string(),
                alias: "dead".to_string(),
                port: port.to_string(),
                user: Some("nobody".to_string()),
                cmd: Some("true".to_string()),
                index: 0,
            }],
            ..Default::default()
        };
        worker.init(&data).unwrap();

        let done = CancellationToken::new();
        let (mut rx, _err_rx) = worker.execute(done.clone());
        done.cancel();
        // the channel still closes: tasks drop their results instead of
        // blocking on a consumer that went away
        while rx.recv().await.is_some() {}
    }

    #[test]
    fn expired_deadline_is_a_connection_timeout() {
        let past = Instant::now() - Duration::from_secs(1);
        let err = remaining(past).unwrap_err();
        assert!(matches!(err, SshError::ConnectTimeout));
        assert_eq!(err.to_string(), "Connection Timeout.");
        assert!(remaining(Instant::now() + Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn stalled_handshake_reports_connection_timeout() {
        // accept TCP but never speak SSH, so the attempt dies in the
        // handshake phase of the shared budget
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let item = SshItem {
            host: "127.0.0.1".to_string(),
            alias: "mute".to_string(),
            port: port.to_string(),
            user: "nobody".to_string(),
            cmd: "true".to_string(),
            timeout: 1,
            retry: 0,
            policy: TrustPolicy::AcceptAny,
            auth: Arc::new(AuthSet::default()),
            transfer: None,
        };
        let start = Instant::now();
        let err = match item.connect_once() {
            Ok(_) => panic!("expected connect_once to fail"),
            Err(err) => err,
        };
        let elapsed = start.elapsed();
        assert_eq!(err.to_string(), "Connection Timeout.");
        // one budget for the whole attempt, not one per phase
        assert!(elapsed < Duration::from_millis(1900), "took {:?}", elapsed);
        drop(listener);
    }

    #[test]
    fn invalid_port_degrades_to_a_host_error() {
        let item = SshItem {
            host: "h".to_string(),
            alias: "h".to_string(),
            port: "not-a-port".to_string(),
            user: "u".to_string(),
            cmd: "true".to_string(),
            timeout: 0,
            retry: 0,
            policy: TrustPolicy::AcceptAny,
            auth: Arc::new(AuthSet::default()),
            transfer: None,
        };
        let err = match item.connect_once() {
            Ok(_) => panic!("expected connect_once to fail"),
            Err(err) => err,
        };
        assert!(matches!(err, SshError::BadPort(_)));
    }
}
