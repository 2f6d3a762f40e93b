//! Unix socket front end.
//!
//! One request per line, one JSON response per line:
//!
//! ```text
//! QUERY {"path": "/docs/", "q": "report", "recursive": false}
//! SITEMAP
//! STATS
//! PING
//! ```

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::query::ListingEntry;
use crate::store::{Stats, Store};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Results { results: Vec<ListingEntry> },
    Paths { paths: Vec<String> },
    Stats(Stats),
    Status { status: &'static str },
    Error { error: &'static str, message: String },
}

impl Response {
    fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Routes a query to the snapshot when `cached_only` is set or the request is
/// recursive, and to the filesystem otherwise.
pub fn dispatch(store: &Store, req: &QueryRequest, cached_only: bool) -> Result<Vec<ListingEntry>> {
    if cached_only || req.recursive {
        store.query(&req.path, &req.q, req.recursive)
    } else {
        store.query_live(&req.path, &req.q)
    }
}

fn error_response(err: &Error) -> Response {
    let (error, message) = match err.kind() {
        ErrorKind::NotFound => ("not_found", "directory not found"),
        ErrorKind::NotReady => ("unavailable", "index is being built, retry later"),
        ErrorKind::Configuration | ErrorKind::Walk | ErrorKind::Internal => {
            warn!("Request failed: {}", err);
            ("internal", "internal error")
        }
    };
    Response::Error {
        error,
        message: message.to_string(),
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    Response::Error {
        error: "bad_request",
        message: message.into(),
    }
}

/// Directory paths as clients see them: no trailing slash except on `/`.
fn sitemap_paths(paths: Vec<String>) -> Vec<String> {
    paths
        .into_iter()
        .map(|path| match path.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        })
        .collect()
}

/// Answers one protocol line. Blocks on storage and filesystem work.
pub fn handle_line(store: &Store, line: &str, cached_only: bool) -> String {
    let response = if let Some(json) = line.strip_prefix("QUERY ") {
        match serde_json::from_str::<QueryRequest>(json) {
            Ok(req) => match dispatch(store, &req, cached_only) {
                Ok(results) => Response::Results { results },
                Err(e) => error_response(&e),
            },
            Err(e) => bad_request(e.to_string()),
        }
    } else if line == "SITEMAP" {
        match store.sitemap() {
            Ok(paths) => Response::Paths {
                paths: sitemap_paths(paths),
            },
            Err(e) => error_response(&e),
        }
    } else if line == "STATS" {
        match store.stats() {
            Ok(stats) => Response::Stats(stats),
            Err(e) => error_response(&e),
        }
    } else if line == "PING" {
        Response::Status { status: "pong" }
    } else {
        bad_request("unknown command")
    };

    response.to_line()
}

async fn handle_client(stream: UnixStream, store: Arc<Store>, cached_only: bool) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Read error: {}", e);
                break;
            }
        };

        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        debug!("Received: {}", line);

        let worker = Arc::clone(&store);
        let response = match tokio::task::spawn_blocking(move || handle_line(&worker, &line, cached_only)).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Request task failed: {}", e);
                error_response(&Error::Io(io::Error::other(e.to_string()))).to_line()
            }
        };

        if let Err(e) = write.write_all(format!("{}\n", response).as_bytes()).await {
            warn!("Failed to write response: {}", e);
            break;
        }
    }
}

/// Binds the socket at `path`, replacing a stale socket file left by an earlier run.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
}

/// Accepts clients until the task is dropped, one task per connection.
pub async fn serve(listener: UnixListener, store: Arc<Store>, cached_only: bool) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_client(stream, Arc::clone(&store), cached_only));
            }
            Err(e) => {
                warn!("Accept error: {}", e);
            }
        }
    }
}
