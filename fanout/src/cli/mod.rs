//! Command-line surface: flag parsing, stdin/FIFO plumbing and the glue
//! that turns flags + config into a ready `Executor`.

use crate::config::{self, Setting};
use crate::executor::{self, Executor, Parameter};
use crate::formatter::{AnsiFormatter, JsonFormatter, WindowFormatter};
use crate::hostlist::Resolver;
use crate::p2p::P2pManager;
use crate::sig;
use crate::util;
use clap::{Arg, ArgAction, ArgMatches, Command};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Report;
use std::io::{IsTerminal, Read, Write};
use std::os::unix::fs::FileTypeExt;
use tracing_subscriber::EnvFilter;

pub const ENV_PREFIX: &str = "FANOUT";
const CONFIG_FILE: &str = ".fanoutconfig";

/// Which consumer drained the piped stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeUse {
    Hostlist,
    Cmd,
}

/// Data gathered from stdin and FIFO positionals before flag parsing. The
/// piped content may be consumed by at most one of the host-list resolver
/// or the command slot.
pub struct StdinInput {
    pipe: Option<String>,
    fifo: Option<String>,
    fifo_file: Option<String>,
    used_by: Option<PipeUse>,
}

impl StdinInput {
    pub fn gather() -> Self {
        let mut pipe = None;
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            let mut buf = String::new();
            if stdin.lock().read_to_string(&mut buf).is_ok() && !buf.trim().is_empty() {
                pipe = Some(buf);
            }
        }

        let mut fifo = None;
        let mut fifo_file = None;
        for arg in std::env::args().skip(1) {
            let Ok(meta) = std::fs::metadata(&arg) else {
                continue;
            };
            if meta.file_type().is_fifo() {
                if let Ok(content) = std::fs::read_to_string(&arg) {
                    fifo = Some(content);
                    fifo_file = Some(arg);
                    break;
                }
            }
        }

        Self {
            pipe,
            fifo,
            fifo_file,
            used_by: None,
        }
    }

    fn take_pipe(&mut self, consumer: PipeUse) -> Option<String> {
        if self.used_by.is_some() {
            return None;
        }
        let content = self.pipe.take()?;
        self.used_by = Some(consumer);
        Some(content)
    }
}

fn global_args() -> Vec<Arg> {
    vec![
        Arg::new("hosts")
            .short('f')
            .long("hosts")
            .value_name("SPEC")
            .env("FANOUT_HOSTS")
            .help("Hostname list: literal list, file path, or `-` for stdin"),
        Arg::new("user")
            .short('u')
            .long("user")
            .env("FANOUT_USER")
            .help("Login user"),
        Arg::new("method")
            .short('m')
            .long("method")
            .env("FANOUT_METHOD")
            .default_value("ssh")
            .help("How to execute the command"),
        Arg::new("prefer")
            .long("prefer")
            .env("FANOUT_PREFER")
            .help("Override the hostlist lookup chain with a single provider"),
        Arg::new("passwd")
            .short('p')
            .long("passwd")
            .action(ArgAction::SetTrue)
            .help("Prompt for a password authentication method"),
        Arg::new("password")
            .long("password")
            .value_name("PW")
            .help("Password (prefer -p, which does not leak into shell history)"),
        Arg::new("concurrency")
            .short('c')
            .long("concurrency")
            .env("FANOUT_CONCURRENCY")
            .allow_negative_numbers(true)
            .default_value("1")
            .help("Parallel host ceiling; 0 = recommended, <0 = host count"),
        Arg::new("timeout")
            .short('t')
            .long("timeout")
            .env("FANOUT_TIMEOUT")
            .default_value("0")
            .help("Per-attempt timeout in seconds; 0 disables it"),
        Arg::new("retry")
            .long("retry")
            .env("FANOUT_RETRY")
            .default_value("2")
            .help("Extra connection attempts per host"),
        Arg::new("json")
            .short('j')
            .long("json")
            .action(ArgAction::SetTrue)
            .help("Print an aggregated JSON report"),
        Arg::new("window")
            .short('w')
            .long("window")
            .action(ArgAction::SetTrue)
            .help("Interactive command-line user interface"),
        Arg::new("account")
            .long("account")
            .env("FANOUT_ACCOUNT")
            .help("Some workers need an account to initiate"),
        Arg::new("hostkey")
            .long("hostkey")
            .env("FANOUT_HOSTKEY")
            .help("Host key trust policy: known-hosts | accept-any"),
        Arg::new("verbose")
            .long("verbose")
            .action(ArgAction::SetTrue)
            .help("Log to a file under local.tmpdir"),
    ]
}

pub fn build_app() -> Command {
    Command::new("fanout")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Execute commands on many machines over SSH, in parallel")
        .args(global_args())
        .arg(
            Arg::new("command")
                .value_name("COMMAND")
                .num_args(0..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true)
                .help("The command to run on every host"),
        )
        .subcommand(
            Command::new("hostlist")
                .about("Show the resolved host list")
                .arg(Arg::new("spec").required(true))
                .arg(
                    Arg::new("prefer")
                        .long("prefer")
                        .env("FANOUT_PREFER")
                        .help("Override the hostlist lookup chain with a single provider"),
                ),
        )
        .subcommand(
            Command::new("copy")
                .visible_alias("cp")
                .about("Copy src to a remote directory, keeping its mode")
                .args(global_args())
                .arg(
                    Arg::new("src")
                        .short('s')
                        .long("src")
                        .required(true)
                        .help("Source file or directory"),
                )
                .arg(
                    Arg::new("dst")
                        .short('d')
                        .long("dst")
                        .required(true)
                        .help("Destination DIRECTORY"),
                )
                .arg(
                    Arg::new("before")
                        .short('b')
                        .long("before")
                        .help("Command to run before the copy"),
                )
                .arg(
                    Arg::new("after")
                        .short('a')
                        .long("after")
                        .help("Command to run after the copy, in the destination"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Get/Set defaults [ $HOME/.fanoutconfig ]")
                .arg(Arg::new("key").required(true))
                .arg(Arg::new("value")),
        )
}

fn setup_config() {
    let defaults = [
        ("user", std::env::var("USER").unwrap_or_default()),
        ("retry", "2".to_string()),
        ("method", "ssh".to_string()),
        ("concurrency", "1".to_string()),
        ("formatter", "ansi".to_string()),
        ("hostkey", "known-hosts".to_string()),
        ("local.tmpdir", "/tmp".to_string()),
        ("remote.tmpdir", "/tmp".to_string()),
        ("json.pretty", "true".to_string()),
    ];
    let setting = Setting {
        path: None,
        file_name: CONFIG_FILE.to_string(),
        env_prefix: ENV_PREFIX.to_string(),
        defaults: defaults
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect(),
    };
    if let Err(err) = config::setup(setting) {
        eprintln!("config setup failed: {:#}", err);
    }
}

fn init_tracing(verbose: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_env("FANOUT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    if verbose {
        let dir = {
            let configured = config::get_string("local.tmpdir");
            if configured.is_empty() {
                "/tmp".to_string()
            } else {
                configured
            }
        };
        let appender = tracing_appender::rolling::never(dir, "fanout.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        None
    }
}

/// Entry point; returns the process exit code.
pub async fn run() -> i32 {
    let _ = color_eyre::install();
    setup_config();
    if std::env::args().len() == 1 {
        let _ = build_app().print_help();
        return 0;
    }
    let mut stdin = StdinInput::gather();
    let matches = build_app().get_matches();
    let _guard = init_tracing(matches.get_flag("verbose"));
    sig::listen();

    match dispatch(&matches, &mut stdin).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    }
}

async fn dispatch(matches: &ArgMatches, stdin: &mut StdinInput) -> Result<i32, Report> {
    match matches.subcommand() {
        Some(("hostlist", sub)) => hostlist_action(sub),
        Some(("config", sub)) => config_action(sub),
        Some(("copy", sub)) => copy_action(sub, stdin).await,
        _ => main_action(matches, stdin).await,
    }
}

/// Resolves the host spec source: `-f -` and a bare pipe both feed the
/// resolver; a `-f` naming the recorded FIFO substitutes its content.
fn host_spec(
    matches: &ArgMatches,
    stdin: &mut StdinInput,
) -> Result<(String, Option<String>), Report> {
    let hosts = matches
        .get_one::<String>("hosts")
        .cloned()
        .unwrap_or_default();
    if hosts == "-" {
        let content = stdin
            .take_pipe(PipeUse::Hostlist)
            .ok_or_else(|| eyre!("-f - needs data on stdin"))?;
        return Ok((content, Some("string".to_string())));
    }
    if !hosts.is_empty() {
        if stdin.fifo_file.as_deref() == Some(hosts.as_str()) {
            let content = stdin.fifo.take().unwrap_or_default();
            return Ok((content, Some("string".to_string())));
        }
        return Ok((hosts, None));
    }
    if let Some(content) = stdin.take_pipe(PipeUse::Hostlist) {
        return Ok((content, Some("string".to_string())));
    }
    Err(eyre!("Show me the host list."))
}

/// The trailing arguments form the command; a lone FIFO positional or the
/// (still unconsumed) pipe substitute for it.
fn get_cmd(matches: &ArgMatches, stdin: &mut StdinInput) -> Option<String> {
    let words: Vec<String> = matches
        .get_many::<String>("command")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    if words.len() == 1 && stdin.fifo_file.as_deref() == Some(words[0].as_str()) {
        if let Some(content) = stdin.fifo.take() {
            return Some(content.trim().to_string());
        }
    }
    if !words.is_empty() {
        return Some(words.join(" "));
    }
    stdin
        .take_pipe(PipeUse::Cmd)
        .map(|content| content.trim().to_string())
}

fn parse_number<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<T, Report> {
    let raw = matches
        .get_one::<String>(name)
        .cloned()
        .unwrap_or_default();
    raw.parse::<T>()
        .map_err(|_| eyre!("invalid --{} value: {}", name, raw))
}

fn choose_formatter(matches: &ArgMatches) -> &'static str {
    if matches.get_flag("json") {
        return "json";
    }
    if matches.get_flag("window") {
        return "window";
    }
    match config::get_string("formatter").as_str() {
        "json" => "json",
        "window" => "window",
        _ => "ansi",
    }
}

/// Builds an executor out of the flags: host list, credentials, limits and
/// the chosen presenter.
fn prepare_executor(matches: &ArgMatches, stdin: &mut StdinInput) -> Result<Executor, Report> {
    let prefer_flag = matches.get_one::<String>("prefer").cloned();
    let (spec, prefer_override) = host_spec(matches, stdin)?;
    let prefer = prefer_override.or(prefer_flag);

    let mut resolver = Resolver::new();
    let host_info_list = resolver.resolve(&spec, prefer.as_deref())?;

    let passwd = if matches.get_flag("passwd") {
        print!("Password: ");
        std::io::stdout().flush().wrap_err("flush prompt")?;
        util::read_passwd()?
    } else {
        matches
            .get_one::<String>("password")
            .cloned()
            .unwrap_or_default()
    };

    if let Some(policy) = matches.get_one::<String>("hostkey") {
        std::env::set_var("FANOUT_HOSTKEY", policy);
    }

    let parameter = Parameter {
        user: matches
            .get_one::<String>("user")
            .cloned()
            .unwrap_or_default(),
        passwd,
        cmd: String::new(),
        account: matches
            .get_one::<String>("account")
            .cloned()
            .unwrap_or_default(),
        method: matches
            .get_one::<String>("method")
            .cloned()
            .unwrap_or_else(|| "ssh".to_string()),
        concurrency: parse_number(matches, "concurrency")?,
        timeout: parse_number(matches, "timeout")?,
        retry: parse_number(matches, "retry")?,
        host_info_list,
        transfer: None,
    };

    let mut exec = Executor::new(parameter).map_err(|err| {
        eyre!(
            "{:#}\nExecutor Methods Available: {}",
            err,
            executor::available().join(", ")
        )
    })?;

    let user = exec.parameter.user.clone();
    let count = exec.host_count();
    match choose_formatter(matches) {
        "json" => {
            exec.add_formatter(
                "merge",
                Box::new(JsonFormatter::new(config::get_bool("json.pretty"))),
            );
        }
        "window" => {
            let aliases = exec
                .parameter
                .host_info_list
                .iter()
                .map(|info| info.alias.clone())
                .collect();
            exec.add_formatter("rt", Box::new(WindowFormatter::new(&user, aliases)));
        }
        _ => {
            exec.add_formatter("rt", Box::new(AnsiFormatter::new(&user, count)));
        }
    }
    Ok(exec)
}

async fn main_action(matches: &ArgMatches, stdin: &mut StdinInput) -> Result<i32, Report> {
    let mut exec = prepare_executor(matches, stdin)?;
    let cmd = get_cmd(matches, stdin).ok_or_else(|| eyre!("Show me the command."))?;
    exec.parameter.cmd = cmd;
    let failed = exec.run().await.wrap_err("Execute Error")?;
    Ok(failed as i32)
}

async fn copy_action(matches: &ArgMatches, stdin: &mut StdinInput) -> Result<i32, Report> {
    let mut exec = prepare_executor(matches, stdin)?;
    let src = matches
        .get_one::<String>("src")
        .cloned()
        .ok_or_else(|| eyre!("--src is required"))?;
    let dst = matches
        .get_one::<String>("dst")
        .cloned()
        .ok_or_else(|| eyre!("--dst is required"))?;
    let before = matches
        .get_one::<String>("before")
        .cloned()
        .unwrap_or_default();
    let after = matches
        .get_one::<String>("after")
        .cloned()
        .unwrap_or_default();

    match P2pManager::from_config() {
        Some(mut manager) if p2p_worthwhile(&src, exec.host_count())? => {
            manager.set_transfer(&src);
            manager.mkseed()?;
            let remote_tmp = {
                let configured = config::get_string("remote.tmpdir");
                if configured.is_empty() {
                    "/tmp".to_string()
                } else {
                    configured
                }
            };
            if manager.need_transfer_file() {
                exec.set_transfer(&manager.torrent_path().to_string_lossy(), &remote_tmp)?;
            }
            exec.parameter.cmd = util::wrap_cmd(&manager.client_cmd(), &before, &after);
            // every host seeds for the others, so run them all at once
            exec.parameter.concurrency = -1;
        }
        _ => {
            exec.set_transfer(&src, &dst)?;
            exec.set_transfer_hook(&before, &after);
        }
    }

    let failed = exec.run().await.wrap_err("Execute Error")?;
    Ok(failed as i32)
}

/// P2P pays off for directories and for anything above 1 MB x 10 machines
/// worth of traffic.
fn p2p_worthwhile(src: &str, host_count: usize) -> Result<bool, Report> {
    if util::is_dir(src) {
        return Ok(true);
    }
    let meta = std::fs::metadata(src).wrap_err("stat source")?;
    let size_mb = meta.len() as i64 / 1024 / 1024;
    Ok(size_mb * host_count as i64 >= 10)
}

fn hostlist_action(matches: &ArgMatches) -> Result<i32, Report> {
    let spec = matches
        .get_one::<String>("spec")
        .cloned()
        .unwrap_or_default();
    let prefer = matches.get_one::<String>("prefer").cloned();
    let list = Resolver::new().resolve_uncached(&spec, prefer.as_deref())?;
    for info in &list {
        println!("{}", info.alias);
    }
    Ok(0)
}

fn config_action(matches: &ArgMatches) -> Result<i32, Report> {
    let key = matches
        .get_one::<String>("key")
        .cloned()
        .unwrap_or_default();
    match matches.get_one::<String>("value") {
        Some(value) => config::set(&key, value)?,
        None => println!("{}", config::get_string(&key)),
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_stdin() -> StdinInput {
        StdinInput {
            pipe: None,
            fifo: None,
            fifo_file: None,
            used_by: None,
        }
    }

    fn piped_stdin(content: &str) -> StdinInput {
        StdinInput {
            pipe: Some(content.to_string()),
            fifo: None,
            fifo_file: None,
            used_by: None,
        }
    }

    #[test]
    fn app_is_well_formed() {
        build_app().debug_assert();
    }

    #[test]
    fn trailing_arguments_form_the_command() {
        let matches = build_app()
            .try_get_matches_from(["fanout", "-f", "a,b", "df", "-h"])
            .unwrap();
        let mut stdin = empty_stdin();
        assert_eq!(get_cmd(&matches, &mut stdin).as_deref(), Some("df -h"));
        assert_eq!(
            matches.get_one::<String>("hosts").map(String::as_str),
            Some("a,b")
        );
    }

    #[test]
    fn pipe_feeds_the_command_when_hosts_are_flagged() {
        let matches = build_app()
            .try_get_matches_from(["fanout", "-f", "a"])
            .unwrap();
        let mut stdin = piped_stdin("uptime\n");
        let (spec, _) = host_spec(&matches, &mut stdin).unwrap();
        assert_eq!(spec, "a");
        assert_eq!(get_cmd(&matches, &mut stdin).as_deref(), Some("uptime"));
        assert_eq!(stdin.used_by, Some(PipeUse::Cmd));
    }

    #[test]
    fn pipe_feeds_the_hostlist_when_hosts_are_missing() {
        let matches = build_app()
            .try_get_matches_from(["fanout", "uptime"])
            .unwrap();
        let mut stdin = piped_stdin("h1 h2\n");
        let (spec, prefer) = host_spec(&matches, &mut stdin).unwrap();
        assert_eq!(spec, "h1 h2\n");
        assert_eq!(prefer.as_deref(), Some("string"));
        assert_eq!(stdin.used_by, Some(PipeUse::Hostlist));
        // the pipe is spent; the command comes from the arguments
        assert_eq!(get_cmd(&matches, &mut stdin).as_deref(), Some("uptime"));
    }

    #[test]
    fn the_pipe_is_consumed_at_most_once() {
        let mut stdin = piped_stdin("payload");
        assert!(stdin.take_pipe(PipeUse::Hostlist).is_some());
        assert!(stdin.take_pipe(PipeUse::Cmd).is_none());
        assert_eq!(stdin.used_by, Some(PipeUse::Hostlist));
    }

    #[test]
    fn dash_hosts_require_a_pipe() {
        let matches = build_app()
            .try_get_matches_from(["fanout", "-f", "-", "uptime"])
            .unwrap();
        let mut stdin = empty_stdin();
        assert!(host_spec(&matches, &mut stdin).is_err());
    }

    #[test]
    fn missing_hosts_and_pipe_is_an_error() {
        let matches = build_app().try_get_matches_from(["fanout", "uptime"]).unwrap();
        let mut stdin = empty_stdin();
        let err = host_spec(&matches, &mut stdin).unwrap_err();
        assert!(err.to_string().contains("host list"));
    }

    #[test]
    fn copy_subcommand_parses_its_flags() {
        let matches = build_app()
            .try_get_matches_from([
                "fanout", "copy", "-f", "a,b", "-s", "/tmp/x", "-d", "/srv", "-b", "pwd", "-a",
                "uptime",
            ])
            .unwrap();
        let Some(("copy", sub)) = matches.subcommand() else {
            panic!("expected the copy subcommand");
        };
        assert_eq!(sub.get_one::<String>("src").map(String::as_str), Some("/tmp/x"));
        assert_eq!(sub.get_one::<String>("dst").map(String::as_str), Some("/srv"));
        assert_eq!(sub.get_one::<String>("before").map(String::as_str), Some("pwd"));
        assert_eq!(sub.get_one::<String>("after").map(String::as_str), Some("uptime"));
    }

    #[test]
    fn negative_concurrency_parses() {
        let matches = build_app()
            .try_get_matches_from(["fanout", "-f", "a", "-c", "-1", "uptime"])
            .unwrap();
        let concurrency: i64 = parse_number(&matches, "concurrency").unwrap();
        assert_eq!(concurrency, -1);
    }
}
