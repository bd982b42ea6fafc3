//! Socket client for the TabFlow daemon.
//!
//! One request per connection. Transport failures surface as `ErrorInfo`
//! values with client-side codes so callers print every failure the same way.

use chrono::Utc;
use rand::RngCore;
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use tabflow_protocol::{ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION};

const SOCKET_ENV: &str = "TABFLOW_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 15_000;
const WRITE_TIMEOUT_MS: u64 = 2_000;

pub struct DaemonClient {
    socket: PathBuf,
}

impl DaemonClient {
    pub fn from_env() -> Result<Self, ErrorInfo> {
        socket_path()
            .map(Self::with_socket)
            .map_err(|err| ErrorInfo::new("client_error", err))
    }

    pub fn with_socket(socket: PathBuf) -> Self {
        Self { socket }
    }

    /// Sends one request and returns the response data, or the daemon's error.
    pub fn call(&self, method: Method, params: Option<Value>) -> Result<Value, ErrorInfo> {
        let request = Request {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some(make_request_id()),
            params,
        };
        let response = self
            .send_request(&request)
            .map_err(|err| ErrorInfo::new("daemon_unreachable", err))?;

        if response.id.is_some() && response.id != request.id {
            tracing::warn!(expected = ?request.id, got = ?response.id, "Response id mismatch");
        }

        if response.ok {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(response
                .error
                .unwrap_or_else(|| ErrorInfo::new("unknown_error", "Unknown daemon error")))
        }
    }

    fn send_request(&self, request: &Request) -> Result<Response, String> {
        let mut stream = UnixStream::connect(&self.socket).map_err(|err| {
            format!(
                "Failed to connect to daemon socket {}: {}",
                self.socket.display(),
                err
            )
        })?;
        let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

        serde_json::to_writer(&mut stream, request)
            .map_err(|err| format!("Failed to write request: {}", err))?;
        stream
            .write_all(b"\n")
            .map_err(|err| format!("Failed to flush request: {}", err))?;
        stream.flush().ok();

        read_response(&mut stream)
    }
}

fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".tabflow").join(SOCKET_NAME))
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "ctl-{}-{:x}",
        Utc::now().timestamp_millis(),
        random.next_u64()
    )
}
