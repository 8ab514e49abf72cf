//! Docker Engine API client over the daemon's unix socket.
use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;

use super::{Backend, Candidate, Target};
use crate::container::{self, ContainerID};

pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to docker socket `{socket}`: {source}")]
    Connect {
        socket: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build request for `{path}`: {source}")]
    Request {
        path: String,
        #[source]
        source: hyper::http::Error,
    },
    #[error("request `{path}` failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: hyper::Error,
    },
    #[error("request `{path}` answered {status}: {message}")]
    Status {
        path: String,
        status: u16,
        message: String,
    },
    #[error("failed to decode response of `{path}`: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    ContainerID(#[from] container::Error),
    #[error("container `{0}` is not running")]
    NotRunning(String),
}

impl Error {
    /// True if the socket exists but the agent may not open it.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Connect { source, .. } if source.kind() == std::io::ErrorKind::PermissionDenied)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Entry of `GET /containers/json`.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    image: String,
}

/// Subset of `GET /containers/{id}/json`.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    id: String,
    name: String,
    state: ContainerState,
    #[serde(default)]
    log_path: String,
    config: Option<ContainerConfig>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    running: bool,
    pid: u32,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    #[serde(default)]
    image: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerProbe {
    socket: PathBuf,
}

impl DockerProbe {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// Daemon socket on the host.
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Running containers.
    ///
    /// # Errors
    ///
    /// - [`Error::Connect`] if the socket is missing or not accessible.
    /// - [`Error::Status`] if the daemon rejects the request.
    /// - [`Error::Decode`] if the answer is not a container list.
    pub async fn list(&self) -> Result<Vec<Candidate>> {
        let path = "/containers/json";
        let summaries: Vec<ContainerSummary> = decode(path, &self.get(path).await?)?;
        Ok(summaries
            .into_iter()
            .map(|summary| Candidate {
                backend: Backend::Docker,
                name: summary
                    .names
                    .first()
                    .map(|name| display_name(name).to_owned())
                    .unwrap_or_else(|| summary.id.clone()),
                id: summary.id,
                image: Some(summary.image).filter(|image| !image.is_empty()),
                namespace: None,
            })
            .collect())
    }

    /// Inspects the container of `candidate` for its pid and json log file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] for a stopped container, otherwise the
    /// errors of [`Self::list`].
    pub async fn resolve(&self, candidate: &Candidate) -> Result<Target> {
        let path = format!("/containers/{}/json", candidate.id);
        let inspect: ContainerInspect = decode(&path, &self.get(&path).await?)?;
        if !inspect.state.running || inspect.state.pid == 0 {
            return Err(Error::NotRunning(inspect.id));
        }
        Ok(Target {
            backend: Backend::Docker,
            name: display_name(&inspect.name).to_owned(),
            pid: inspect.state.pid,
            container_id: Some(ContainerID::new(&inspect.id)?),
            service_unit: None,
            image: inspect
                .config
                .map(|config| config.image)
                .filter(|image| !image.is_empty())
                .or_else(|| candidate.image.clone()),
            runtime_log: Some(PathBuf::from(inspect.log_path))
                .filter(|path| !path.as_os_str().is_empty()),
        })
    }

    /// Last `lines` lines of stdout and stderr.
    pub async fn logs(&self, id: &str, lines: usize) -> Result<Vec<String>> {
        let path = format!("/containers/{id}/logs?stdout=1&stderr=1&tail={lines}");
        let raw = self.get(&path).await?;
        Ok(String::from_utf8_lossy(&demux(&raw))
            .lines()
            .map(str::to_owned)
            .collect())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let stream = tokio::net::UnixStream::connect(&self.socket)
            .await
            .map_err(|source| Error::Connect {
                socket: self.socket.clone(),
                source,
            })?;
        let transport = |source| Error::Transport {
            path: path.to_owned(),
            source,
        };
        let (mut sender, conn) = http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(transport)?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("Docker connection closed with error: {err}");
            }
        });

        let request = hyper::Request::get(path)
            .header(hyper::header::HOST, "docker")
            .body(Empty::new())
            .map_err(|source| Error::Request {
                path: path.to_owned(),
                source,
            })?;
        log::trace!("GET {path}");
        let response = sender.send_request(request).await.map_err(transport)?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(transport)?
            .to_bytes();
        if !status.is_success() {
            return Err(Error::Status {
                path: path.to_owned(),
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        Ok(body)
    }
}

fn decode<T: serde::de::DeserializeOwned>(path: &str, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|source| Error::Decode {
        path: path.to_owned(),
        source,
    })
}

/// Docker prefixes container names with `/`.
fn display_name(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

fn error_message(body: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        message: String,
    }
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(err) => err.message,
        Err(_) => String::from_utf8_lossy(body).trim().to_owned(),
    }
}

/// Strips the 8 byte stream headers docker puts in front of each log frame of
/// a container without tty. Output of tty containers is passed through.
fn demux(raw: &[u8]) -> Vec<u8> {
    let is_framed = raw.len() >= 8 && raw[0] <= 2 && raw[1..4] == [0, 0, 0];
    if !is_framed {
        return raw.to_vec();
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while rest.len() >= 8 {
        let size = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + size).min(rest.len());
        out.extend_from_slice(&rest[8..end]);
        rest = &rest[end..];
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    pub const MY_NODE_ID: &str = "8dfafdbc3a405c1e2b7d9f04a6c3e8b1d2f7a9c0e4b6d8f1a3c5e7b9d0f2a4c6";

    /// Serves canned responses keyed by request path and query on a unix
    /// socket below `dir`. Unknown paths answer 404.
    pub fn serve(
        dir: &Path,
        routes: impl IntoIterator<Item = (String, (u16, Vec<u8>))>,
    ) -> PathBuf {
        let socket = dir.join("docker.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        let routes: Arc<HashMap<_, _>> = Arc::new(routes.into_iter().collect());
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let routes = Arc::clone(&routes);
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&head);
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_owned();
                    let (status, body) = routes
                        .get(&path)
                        .cloned()
                        .unwrap_or((404, br#"{"message":"page not found"}"#.to_vec()));
                    let response = format!(
                        "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.write_all(&body).await;
                });
            }
        });
        socket
    }

    /// A daemon running `my-node-1` with `pid` next to an unrelated container.
    pub fn my_node_routes(pid: u32) -> Vec<(String, (u16, Vec<u8>))> {
        let list = format!(
            r#"[
                {{"Id":"{other}","Names":["/prometheus"],"Image":"prom/prometheus","State":"running"}},
                {{"Id":"{MY_NODE_ID}","Names":["/my-node-1"],"Image":"algorand/algod:latest","State":"running"}}
            ]"#,
            other = "1".repeat(64),
        );
        let inspect = format!(
            r#"{{
                "Id":"{MY_NODE_ID}",
                "Name":"/my-node-1",
                "State":{{"Status":"running","Running":true,"Pid":{pid}}},
                "LogPath":"/var/lib/docker/containers/{MY_NODE_ID}/{MY_NODE_ID}-json.log",
                "Config":{{"Image":"algorand/algod:latest","Cmd":["algod","-d","/algod/data"]}}
            }}"#
        );
        vec![
            ("/containers/json".to_owned(), (200, list.into_bytes())),
            (
                format!("/containers/{MY_NODE_ID}/json"),
                (200, inspect.into_bytes()),
            ),
        ]
    }
}
