use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;

use webserv::config::{load_config_file, ServerConfig, Tunables};
use webserv::log::{init_tracing, parse_level, LogSink};
use webserv::poller::Epoll;
use webserv::response::MimeMap;
use webserv::server::Server;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

fn main() -> Result<()> {
    println!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let options = Options::from_command_line()?;
    init_tracing(options.log_level);

    let configs = match &options.config_file {
        Some(path) => load_config_file(path)?,
        None => {
            info!("no config file given, using defaults");
            vec![ServerConfig::default()]
        }
    };

    let poller = Epoll::new(options.tunables.max_events).context("failed to create epoll instance")?;
    let mut server = Server::new(configs, options.tunables, Box::new(poller))
        .with_mime_map(options.mime_map)
        .with_log_sink(options.log_sink);
    server.init_listeners()?;

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    server.run(is_running)?;
    server.stats.print()?;
    Ok(())
}

struct Options {
    config_file: Option<PathBuf>,
    tunables: Tunables,
    log_sink: LogSink,
    log_level: LevelFilter,
    mime_map: MimeMap,
}

impl Options {
    fn from_command_line() -> Result<Self> {
        let mut options = Self {
            config_file: None,
            tunables: Tunables::default(),
            log_sink: LogSink::default(),
            log_level: std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| parse_level(&level).ok())
                .unwrap_or(LevelFilter::INFO),
            mime_map: MimeMap::default(),
        };
        let mut args = std::env::args();
        let name = args.next().unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        while let Some(arg) = args.next().as_deref() {
            match arg {
                "--help" => {
                    usage(&name);
                    std::process::exit(0);
                }
                "--log" => {
                    let filename = args.next().context("missing filename after --log")?;
                    options.log_sink = LogSink::open_file(&filename)?;
                }
                "--syslog" => options.log_sink = LogSink::Syslog,
                "--log-level" => {
                    let level = args.next().context("missing level after --log-level")?;
                    options.log_level = parse_level(&level)?;
                }
                "--timeout" => {
                    let number = args.next().context("missing number after --timeout")?;
                    options.tunables.client_timeout = parse_seconds(&number)
                        .with_context(|| format!("timeout number {} is invalid", number))?;
                }
                "--cgi-timeout" => {
                    let number = args.next().context("missing number after --cgi-timeout")?;
                    options.tunables.cgi_timeout = parse_seconds(&number)
                        .with_context(|| format!("CGI timeout number {} is invalid", number))?;
                }
                "--no-keepalive" => options.tunables.keep_alive = false,
                "--no-server-id" => options.tunables.server_id = false,
                "--mimetypes" => {
                    let filename = args.next().context("missing filename after --mimetypes")?;
                    options
                        .mime_map
                        .parse_extension_map_file(&OsString::from(filename))?;
                }
                "--default-mimetype" => {
                    options.mime_map.default_mimetype = args
                        .next()
                        .context("missing string after --default-mimetype")?;
                }
                flag if flag.starts_with("--") => {
                    return Err(anyhow!("unknown argument `{}'", flag));
                }
                path => {
                    if options.config_file.is_some() {
                        return Err(anyhow!("more than one config file given"));
                    }
                    options.config_file = Some(PathBuf::from(path));
                }
            }
        }
        Ok(options)
    }
}

/// Timeouts are whole seconds and must be positive.
fn parse_seconds(number: &str) -> Result<Duration> {
    match number.parse::<u64>()? {
        0 => Err(anyhow!("timeout must be positive")),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn usage(name: &str) {
    println!("usage:\t{} [config-file] [flags]\n", name);
    println!(
        "\tWithout a config file, one server listens on 0.0.0.0:8080
\tand serves the `html' directory.\n"
    );
    println!("flags:\n");
    println!("\t--log filename");
    println!("\t\tSpecify file for access log.\n");
    println!("\t--syslog");
    println!("\t\tUse syslog for access log.\n");
    println!("\t--log-level level (default: info)");
    println!("\t\tDiagnostics written to stderr: off, error, warn, info, debug or trace.\n");
    println!("\t--timeout secs (default: 60)");
    println!("\t\tIf a connection is idle for more than this many seconds,");
    println!("\t\tit will be closed.\n");
    println!("\t--cgi-timeout secs (default: 60)");
    println!("\t\tIf a CGI script is silent for more than this many seconds,");
    println!("\t\tit is killed and the client gets 504.\n");
    println!("\t--no-keepalive");
    println!("\t\tDisables HTTP Keep-Alive functionality.\n");
    println!("\t--no-server-id");
    println!("\t\tDon't identify the server type in headers");
    println!("\t\tor directory listings.\n");
    println!("\t--mimetypes filename (optional)");
    println!("\t\tParses specified file for extension-MIME associations.\n");
    println!("\t--default-mimetype string (optional, default: application/octet-stream)");
    println!("\t\tFiles with unknown extensions are served as this mimetype.\n");
}
