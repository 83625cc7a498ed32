// This module contains the job description (`Parameter`, `TransferFile`),
// the `Worker` contract and the `Executor` that drives a worker and feeds
// its outputs to the registered presenters.
pub mod ssh;

use crate::formatter::{Formatter, Output};
use crate::hostlist::HostInfoList;
use crate::util;
use color_eyre::eyre::eyre;
use color_eyre::Report;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Built-in ceiling used when a worker gives no recommendation.
pub const RECOMMENDED_CONCURRENCY: i64 = 60;

#[derive(Debug, Clone, Default)]
pub struct TransferHook {
    pub before: String,
    pub after: String,
}

/// File payload for a copy job. The source is read fully into memory when
/// the job is built, so workers never touch the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct TransferFile {
    pub data: Vec<u8>,
    /// POSIX mode as octal text, e.g. `0644`.
    pub perm: String,
    pub basename: String,
    /// Destination directory on the remote side.
    pub destination: String,
    /// Final destination, `destination/basename`.
    pub dst: String,
    pub hook: Option<TransferHook>,
}

impl TransferFile {
    /// Stats and reads `src`, deriving the remote path under `dst`.
    pub fn load(src: &str, dst: &str) -> Result<Self, Report> {
        let meta = std::fs::metadata(src)?;
        let perm = format!("0{:o}", meta.permissions().mode() & 0o777);
        let data = std::fs::read(src)?;
        let basename = Path::new(src)
            .file_name()
            .ok_or_else(|| eyre!("no basename in {}", src))?
            .to_string_lossy()
            .to_string();
        let dst_path = Path::new(dst).join(&basename).to_string_lossy().to_string();
        Ok(Self {
            data,
            perm,
            basename,
            destination: dst.to_string(),
            dst: dst_path,
            hook: None,
        })
    }

    /// Whether there is anything for a worker to ship.
    pub fn ready(&self) -> bool {
        !self.dst.is_empty() && !self.data.is_empty()
    }
}

/// Everything a worker needs to run the job. Built once; the executor
/// normalizes `concurrency` and fills per-host defaults at the start of
/// `run`, after which it is read-only.
#[derive(Debug, Clone, Default)]
pub struct Parameter {
    pub user: String,
    pub passwd: String,
    pub cmd: String,
    pub account: String,
    pub method: String,
    pub concurrency: i64,
    /// Per-attempt timeout in seconds; `0` disables it.
    pub timeout: u64,
    pub retry: i32,
    pub host_info_list: HostInfoList,
    pub transfer: Option<TransferFile>,
}

impl Parameter {
    /// Wraps `cmd` in the transfer hooks, when any: `before && cmd && (cd
    /// <destination> && after)`.
    pub fn wrap_cmd_with_hook(&self, cmd: &str) -> String {
        let Some(transfer) = &self.transfer else {
            return cmd.to_string();
        };
        let Some(hook) = &transfer.hook else {
            return cmd.to_string();
        };
        let after = if hook.after.is_empty() {
            String::new()
        } else {
            format!("cd {} && {}", transfer.destination, hook.after)
        };
        util::wrap_cmd(cmd, &hook.before, &after)
    }

    pub fn need_transfer(&self) -> bool {
        self.transfer
            .as_ref()
            .map(TransferFile::ready)
            .unwrap_or(false)
    }
}

pub type OutputReceiver = mpsc::Receiver<Output>;
pub type ErrorReceiver = mpsc::Receiver<Report>;

/// A worker connects to every host and produces exactly one `Output` per
/// host on the channel returned by `execute`. Cancelling `done` tells it to
/// stop launching and to drop unsent results.
pub trait Worker: Send {
    fn name(&self) -> &'static str;

    fn init(&mut self, data: &Parameter) -> Result<(), Report>;

    fn execute(&mut self, done: CancellationToken) -> (OutputReceiver, ErrorReceiver);

    /// Concurrency hint honored during normalization. `Some(n)` with `n > 0`
    /// replaces the built-in ceiling; `n <= 0` asks for the host count.
    fn recommended_concurrency(&self) -> Option<i64> {
        None
    }
}

type WorkerCtor = fn() -> Box<dyn Worker>;

fn ssh_ctor() -> Box<dyn Worker> {
    Box::new(ssh::SshWorker::new())
}

// Worker registry. Mutated only through `register_worker`, before a run
// begins.
static WORKERS: Lazy<RwLock<Vec<(&'static str, WorkerCtor)>>> =
    Lazy::new(|| RwLock::new(vec![("ssh", ssh_ctor as WorkerCtor)]));

/// Adds (or replaces) a worker constructor under `name`.
pub fn register_worker(name: &'static str, ctor: WorkerCtor) {
    let mut workers = WORKERS.write();
    if let Some(entry) = workers.iter_mut().find(|(n, _)| *n == name) {
        entry.1 = ctor;
    } else {
        workers.push((name, ctor));
    }
}

/// Returns the names of all registered workers.
pub fn available() -> Vec<&'static str> {
    WORKERS.read().iter().map(|(name, _)| *name).collect()
}

fn create_worker(method: &str) -> Result<Box<dyn Worker>, Report> {
    let workers = WORKERS.read();
    let ctor = workers
        .iter()
        .find(|(name, _)| *name == method)
        .map(|(_, ctor)| *ctor)
        .ok_or_else(|| eyre!("No Such Method: {}", method))?;
    Ok(ctor())
}

/// Clamps the requested concurrency into `[1, count]`, honoring the
/// worker's recommendation when there is one.
pub fn normalize_concurrency(requested: i64, recommended: Option<i64>, count: i64) -> i64 {
    let recommended = match recommended {
        Some(hint) if hint > 0 => hint,
        Some(_) => count,
        None => RECOMMENDED_CONCURRENCY,
    };
    let mut concurrency = requested;
    if concurrency == 0 || concurrency > recommended {
        concurrency = recommended;
    } else if concurrency < 0 {
        concurrency = count;
    }
    if concurrency > count {
        concurrency = count;
    }
    concurrency
}

/// Drives one worker over one host list and fans the resulting outputs to
/// every registered formatter. Per-host failures are counted, never fatal;
/// only configuration and worker-level errors abort the run.
pub struct Executor {
    pub parameter: Parameter,
    worker: Box<dyn Worker>,
    index_map: HashMap<String, usize>,
    formatters: Vec<(String, Box<dyn Formatter>)>,
}

impl Executor {
    /// Builds an executor with the worker selected by `parameter.method`.
    pub fn new(parameter: Parameter) -> Result<Self, Report> {
        let method = if parameter.method.is_empty() {
            "ssh"
        } else {
            parameter.method.as_str()
        };
        let worker = create_worker(method)?;
        Ok(Self::with_worker(parameter, worker))
    }

    /// Builds an executor around an explicit worker.
    pub fn with_worker(mut parameter: Parameter, worker: Box<dyn Worker>) -> Self {
        if parameter.user.is_empty() {
            parameter.user = std::env::var("USER").unwrap_or_default();
        }
        if parameter.method.is_empty() {
            parameter.method = worker.name().to_string();
        }
        Self {
            parameter,
            worker,
            index_map: HashMap::new(),
            formatters: Vec::new(),
        }
    }

    pub fn host_count(&self) -> usize {
        self.parameter.host_info_list.len()
    }

    /// Registers a formatter under a category. A category holds at most one
    /// formatter; registering again replaces the previous one.
    pub fn add_formatter(&mut self, category: &str, formatter: Box<dyn Formatter>) -> &mut Self {
        if let Some(entry) = self
            .formatters
            .iter_mut()
            .find(|(existing, _)| existing == category)
        {
            entry.1 = formatter;
        } else {
            self.formatters.push((category.to_string(), formatter));
        }
        self
    }

    /// Loads `src` for transfer into the remote directory `dst`.
    pub fn set_transfer(&mut self, src: &str, dst: &str) -> Result<&mut Self, Report> {
        self.parameter.transfer = Some(TransferFile::load(src, dst)?);
        Ok(self)
    }

    /// Attaches shell fragments to run before and after the copy.
    pub fn set_transfer_hook(&mut self, before: &str, after: &str) -> &mut Self {
        if before.is_empty() && after.is_empty() {
            return self;
        }
        let transfer = self.parameter.transfer.get_or_insert_with(TransferFile::default);
        transfer.hook = Some(TransferHook {
            before: before.to_string(),
            after: after.to_string(),
        });
        self
    }

    /// Normalizes the parameter before the run: concurrency clamp and
    /// per-host user/cmd defaults.
    fn integrate(&mut self) -> Result<(), Report> {
        let count = self.host_count() as i64;
        if count == 0 {
            return Err(eyre!("Executor cannot Run: Empty Hostlist"));
        }
        self.parameter.concurrency = normalize_concurrency(
            self.parameter.concurrency,
            self.worker.recommended_concurrency(),
            count,
        );
        self.index_map = self
            .parameter
            .host_info_list
            .iter()
            .enumerate()
            .map(|(index, info)| (info.alias.clone(), index))
            .collect();
        for info in &mut self.parameter.host_info_list {
            if info.user.is_none() && !self.parameter.user.is_empty() {
                info.user = Some(self.parameter.user.clone());
            }
            if info.cmd.is_none() && !self.parameter.cmd.is_empty() {
                info.cmd = Some(self.parameter.cmd.clone());
            }
        }
        Ok(())
    }

    /// Initializes and drives the worker, forwarding outputs to the
    /// formatters as they arrive. Returns the number of failed hosts.
    pub async fn run(&mut self) -> Result<i64, Report> {
        self.integrate()?;
        self.worker.init(&self.parameter)?;

        let done = CancellationToken::new();
        let (mut out_rx, mut err_rx) = self.worker.execute(done.clone());

        let mut failed = 0i64;
        let mut result: Result<(), Report> = Ok(());
        let mut err_open = true;
        loop {
            tokio::select! {
                output = out_rx.recv() => match output {
                    Some(mut output) => {
                        if let Some(index) = self.index_map.get(&output.alias) {
                            output.index = *index;
                        }
                        if output.exit_code != 0 {
                            failed += 1;
                        }
                        debug!(alias = %output.alias, exit = output.exit_code, "output");
                        for (_, formatter) in self.formatters.iter_mut() {
                            formatter.add(&output);
                        }
                    }
                    None => break,
                },
                err = err_rx.recv(), if err_open => match err {
                    Some(err) => {
                        result = Err(err);
                        break;
                    }
                    None => err_open = false,
                },
            }
        }

        done.cancel();
        for (_, formatter) in self.formatters.iter_mut() {
            formatter.print();
        }
        result.map(|_| failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostlist::{self, HostInfo};
    use std::sync::{Arc, Mutex};

    fn host(alias: &str) -> HostInfo {
        HostInfo {
            host: alias.to_string(),
            alias: alias.to_string(),
            port: "22".to_string(),
            ..Default::default()
        }
    }

    fn host_list(aliases: &[&str]) -> HostInfoList {
        hostlist::filter(aliases.iter().map(|alias| host(alias)).collect())
    }

    /// Worker that replays canned outputs and records the parameter it was
    /// initialized with.
    struct StubWorker {
        outputs: Vec<Output>,
        seen: Arc<Mutex<Option<Parameter>>>,
        fail_init: bool,
        error: Option<String>,
    }

    impl StubWorker {
        fn replay(outputs: Vec<Output>) -> Self {
            Self {
                outputs,
                seen: Arc::new(Mutex::new(None)),
                fail_init: false,
                error: None,
            }
        }
    }

    impl Worker for StubWorker {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn init(&mut self, data: &Parameter) -> Result<(), Report> {
            if self.fail_init {
                return Err(eyre!("init failed"));
            }
            *self.seen.lock().unwrap() = Some(data.clone());
            Ok(())
        }

        fn execute(&mut self, _done: CancellationToken) -> (OutputReceiver, ErrorReceiver) {
            let (tx, rx) = mpsc::channel(self.outputs.len().max(1));
            let (err_tx, err_rx) = mpsc::channel(1);
            let outputs = std::mem::take(&mut self.outputs);
            let error = self.error.take();
            tokio::spawn(async move {
                if let Some(message) = error {
                    let _ = err_tx.send(eyre!(message)).await;
                    // keep the output channel open so the error is what the
                    // executor observes
                    std::future::pending::<()>().await;
                }
                for output in outputs {
                    let _ = tx.send(output).await;
                }
            });
            (rx, err_rx)
        }
    }

    /// Formatter that collects everything it is fed.
    struct CollectFormatter {
        outputs: Arc<Mutex<Vec<Output>>>,
        printed: Arc<Mutex<bool>>,
    }

    impl Formatter for CollectFormatter {
        fn add(&mut self, output: &Output) {
            self.outputs.lock().unwrap().push(output.clone());
        }

        fn print(&mut self) {
            *self.printed.lock().unwrap() = true;
        }
    }

    fn collector() -> (CollectFormatter, Arc<Mutex<Vec<Output>>>, Arc<Mutex<bool>>) {
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let printed = Arc::new(Mutex::new(false));
        (
            CollectFormatter {
                outputs: outputs.clone(),
                printed: printed.clone(),
            },
            outputs,
            printed,
        )
    }

    #[test]
    fn concurrency_clamp() {
        // (requested, recommended, count) -> expected
        let cases = [
            (0, None, 5, 5),
            (1000, None, 5, 5),
            (-1, None, 5, 5),
            (3, None, 5, 3),
            (0, Some(2), 5, 2),
            (4, Some(2), 5, 2),
            (0, Some(-1), 5, 5),
            (0, None, 100, RECOMMENDED_CONCURRENCY),
        ];
        for (requested, recommended, count, expected) in cases {
            assert_eq!(
                normalize_concurrency(requested, recommended, count),
                expected,
                "requested={} recommended={:?} count={}",
                requested,
                recommended,
                count
            );
        }
    }

    #[test]
    fn concurrency_clamp_bounds() {
        for requested in [-10, -1, 0, 1, 7, 1000] {
            for recommended in [None, Some(-1), Some(0), Some(3), Some(80)] {
                for count in [1, 5, 61] {
                    let normalized = normalize_concurrency(requested, recommended, count);
                    assert!(normalized >= 1 && normalized <= count);
                    if let Some(hint) = recommended {
                        if hint > 0 {
                            assert!(normalized <= hint);
                        }
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn two_host_echo() {
        let outputs = vec![
            Output {
                alias: "a".to_string(),
                hostname: "a".to_string(),
                stdout: "ok".to_string(),
                ..Default::default()
            },
            Output {
                alias: "b".to_string(),
                hostname: "b".to_string(),
                stdout: "ok".to_string(),
                ..Default::default()
            },
        ];
        let parameter = Parameter {
            cmd: "echo ok".to_string(),
            concurrency: 2,
            host_info_list: host_list(&["a", "b"]),
            ..Default::default()
        };
        let mut exec = Executor::with_worker(parameter, Box::new(StubWorker::replay(outputs)));
        let (formatter, collected, printed) = collector();
        exec.add_formatter("rt", Box::new(formatter));

        let failed = exec.run().await.unwrap();
        assert_eq!(failed, 0);

        let collected = collected.lock().unwrap();
        assert_eq!(collected.len(), 2);
        assert!(collected.iter().all(|o| o.stdout == "ok" && o.exit_code == 0));
        assert!(*printed.lock().unwrap());
    }

    #[tokio::test]
    async fn every_host_yields_one_output_with_distinct_index() {
        let aliases = ["h0", "h1", "h2", "h3", "h4"];
        // arrival order deliberately scrambled
        let outputs: Vec<_> = [3usize, 0, 4, 1, 2]
            .iter()
            .map(|&i| Output {
                alias: aliases[i].to_string(),
                exit_code: if i % 2 == 0 { 0 } else { 1 },
                ..Default::default()
            })
            .collect();
        let parameter = Parameter {
            host_info_list: host_list(&aliases),
            ..Default::default()
        };
        let mut exec = Executor::with_worker(parameter, Box::new(StubWorker::replay(outputs)));
        let (formatter, collected, _) = collector();
        exec.add_formatter("rt", Box::new(formatter));

        let failed = exec.run().await.unwrap();
        assert_eq!(failed, 2);

        let collected = collected.lock().unwrap();
        assert_eq!(collected.len(), aliases.len());
        let mut indices: Vec<_> = collected.iter().map(|o| o.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn fills_per_host_defaults_and_clamps() {
        let mut list = host_list(&["a", "b", "c"]);
        list[1].user = Some("already".to_string());
        let parameter = Parameter {
            user: "deploy".to_string(),
            cmd: "uptime".to_string(),
            concurrency: 0,
            host_info_list: list,
            ..Default::default()
        };
        let worker = StubWorker::replay(Vec::new());
        let seen = worker.seen.clone();
        let mut exec = Executor::with_worker(parameter, Box::new(worker));
        exec.run().await.unwrap();

        let seen = seen.lock().unwrap();
        let parameter = seen.as_ref().unwrap();
        assert_eq!(parameter.concurrency, 3);
        assert_eq!(parameter.host_info_list[0].user.as_deref(), Some("deploy"));
        assert_eq!(parameter.host_info_list[1].user.as_deref(), Some("already"));
        assert_eq!(parameter.host_info_list[2].cmd.as_deref(), Some("uptime"));
    }

    #[tokio::test]
    async fn empty_hostlist_is_fatal() {
        let mut exec =
            Executor::with_worker(Parameter::default(), Box::new(StubWorker::replay(Vec::new())));
        let err = exec.run().await.unwrap_err();
        assert!(err.to_string().contains("Empty Hostlist"));
    }

    #[tokio::test]
    async fn worker_error_aborts_the_run() {
        let mut worker = StubWorker::replay(Vec::new());
        worker.error = Some("worker exploded".to_string());
        let parameter = Parameter {
            host_info_list: host_list(&["a"]),
            ..Default::default()
        };
        let mut exec = Executor::with_worker(parameter, Box::new(worker));
        let (formatter, _, printed) = collector();
        exec.add_formatter("rt", Box::new(formatter));

        let err = exec.run().await.unwrap_err();
        assert!(err.to_string().contains("worker exploded"));
        // formatters still get their final print on the abort path
        assert!(*printed.lock().unwrap());
    }

    #[tokio::test]
    async fn category_holds_one_formatter() {
        let parameter = Parameter {
            host_info_list: host_list(&["a"]),
            ..Default::default()
        };
        let outputs = vec![Output {
            alias: "a".to_string(),
            ..Default::default()
        }];
        let mut exec = Executor::with_worker(parameter, Box::new(StubWorker::replay(outputs)));
        let (first, first_outputs, _) = collector();
        let (second, second_outputs, _) = collector();
        exec.add_formatter("rt", Box::new(first));
        exec.add_formatter("rt", Box::new(second));

        exec.run().await.unwrap();
        assert!(first_outputs.lock().unwrap().is_empty());
        assert_eq!(second_outputs.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let parameter = Parameter {
            method: "carrier-pigeon".to_string(),
            ..Default::default()
        };
        let err = match Executor::new(parameter) {
            Ok(_) => panic!("expected Executor::new to fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("No Such Method"));
    }

    #[test]
    fn wrap_cmd_with_hook_runs_after_in_destination() {
        let parameter = Parameter {
            transfer: Some(TransferFile {
                destination: "/srv/app".to_string(),
                hook: Some(TransferHook {
                    before: "mkdir -p /srv/app".to_string(),
                    after: "systemctl restart app".to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            parameter.wrap_cmd_with_hook("scp-stage"),
            "mkdir -p /srv/app && scp-stage && cd /srv/app && systemctl restart app"
        );
        // no hook, no change
        let bare = Parameter::default();
        assert_eq!(bare.wrap_cmd_with_hook("hostname"), "hostname");
    }

    #[test]
    fn transfer_load_reads_file_and_derives_paths() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("payload.bin");
        std::fs::write(&src, b"AB").unwrap();

        let transfer = TransferFile::load(&src.to_string_lossy(), "/tmp").unwrap();
        assert_eq!(transfer.data, b"AB");
        assert_eq!(transfer.basename, "payload.bin");
        assert_eq!(transfer.dst, "/tmp/payload.bin");
        assert!(transfer.perm.starts_with('0'));
        assert!(transfer.ready());
    }
}
