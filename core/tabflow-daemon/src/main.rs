//! TabFlow daemon entrypoint.
//!
//! A small, single-writer service that owns the tab rule engine: a socket
//! listener with strict request validation, one job queue feeding the writer
//! thread, a SQLite-backed key-value store and an in-process timer service.
//! The browser host reports tab events and drains close/open actions; the CLI
//! manages rules and the stash.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use serde_json::Value;
use tabflow_core::{Command, TabflowEngine};
use tabflow_protocol::{
    parse_host_event, parse_params, ChangesParams, ErrorInfo, Method, Request, Response,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod config;
mod db;
mod logging;
mod tabs;
mod timers;
mod writer;

use db::Db;
use timers::TimerService;
use writer::{Job, Work, Writer};

const SOCKET_NAME: &str = "daemon.sock";
const SOCKET_ENV: &str = "TABFLOW_SOCKET";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const REPLY_TIMEOUT_SECS: u64 = 10;

fn main() {
    let _logging_guard = logging::init();

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let db_path = match daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    let daemon_config = match config::load_runtime_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            config::DaemonConfig::default()
        }
    };
    info!(
        guard_window_secs = daemon_config.engine.guard_window_secs,
        guard_retry_secs = daemon_config.engine.guard_retry_secs,
        undo_window_secs = daemon_config.engine.undo_window_secs,
        stash_sweep_interval_minutes = daemon_config.engine.stash_sweep_interval_minutes,
        "Engine config loaded"
    );

    let (jobs, queue) = mpsc::channel::<Job>();
    let timer_jobs = jobs.clone();
    let timers = TimerService::start(move |name| {
        if timer_jobs.send(Job::TimerFired { name }).is_err() {
            warn!("Writer queue closed; dropping timer fire");
        }
    });
    let writer = Writer::new(TabflowEngine::new(db, daemon_config.engine), timers);
    thread::spawn(move || writer.run(queue));

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "TabFlow daemon started");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let jobs = jobs.clone();
                thread::spawn(move || handle_connection(stream, jobs));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".tabflow").join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".tabflow").join("daemon").join("state.db"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, jobs: Sender<Job>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &jobs);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, jobs: &Sender<Job>) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let work = match work_for(request.method, request.params) {
        Ok(work) => work,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    match submit(jobs, work) {
        Ok(data) => Response::ok(request.id, data),
        Err(err) => Response::error_with_info(request.id, err),
    }
}

/// Parses and validates params on the connection thread, before anything is queued.
fn work_for(method: Method, params: Option<Value>) -> Result<Work, ErrorInfo> {
    match method {
        Method::GetHealth => Ok(Work::Health),
        Method::HostEvent => {
            let params = params.ok_or_else(|| {
                ErrorInfo::new("invalid_params", "host event payload is required")
            })?;
            parse_host_event(params).map(Work::HostEvent)
        }
        Method::Command => {
            let params = params
                .ok_or_else(|| ErrorInfo::new("invalid_params", "command payload is required"))?;
            let command: Command = serde_json::from_value(params).map_err(|err| {
                ErrorInfo::new("invalid_params", format!("command payload is invalid: {}", err))
            })?;
            Ok(Work::Command(command))
        }
        Method::DrainHostActions => Ok(Work::DrainHostActions),
        Method::GetRules => Ok(Work::GetRules),
        Method::GetSettings => Ok(Work::GetSettings),
        Method::GetStash => Ok(Work::GetStash),
        Method::GetRuntime => Ok(Work::GetRuntime),
        Method::GetSoonTabs => Ok(Work::GetSoonTabs),
        Method::GetChanges => {
            let params: ChangesParams = parse_params(params)?;
            Ok(Work::GetChanges {
                since: params.since,
            })
        }
    }
}

fn submit(jobs: &Sender<Job>, work: Work) -> Result<Value, ErrorInfo> {
    let (reply, response) = mpsc::channel();
    jobs.send(Job::Request { work, reply })
        .map_err(|_| ErrorInfo::new("writer_unavailable", "daemon writer is not running"))?;
    response
        .recv_timeout(Duration::from_secs(REPLY_TIMEOUT_SECS))
        .map_err(|_| ErrorInfo::new("writer_timeout", "daemon writer did not reply in time"))?
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
