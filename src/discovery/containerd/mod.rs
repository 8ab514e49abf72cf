//! containerd discovery over its gRPC socket.
//!
//! Containers of every namespace are listed; the init task of the matched
//! container provides the pid.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::Channel;

use super::error::io_error_kind;
use super::{Backend, Candidate, DEFAULT_PROBE_TIMEOUT, Target};
use crate::container::{self, ContainerID};

pub mod proto;
mod transport;

pub const DEFAULT_SOCKET: &str = "/run/containerd/containerd.sock";

const NAMESPACE_HEADER: &str = "containerd-namespace";

/// Labels carrying a human readable container name, by precedence.
const NAME_LABELS: [&str; 2] = ["nerdctl/name", "io.kubernetes.container.name"];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to containerd socket `{socket}`: {source}")]
    Connect {
        socket: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("containerd call `{method}` failed: {status}")]
    Rpc {
        method: &'static str,
        #[source]
        status: Box<tonic::Status>,
    },
    #[error("namespace `{0}` is not a valid header value")]
    InvalidNamespace(String),
    #[error("container `{0}` has no task")]
    NoTask(String),
    #[error("task of container `{0}` is not running")]
    NotRunning(String),
    #[error(transparent)]
    ContainerID(#[from] container::Error),
}

impl Error {
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Connect { source, .. } => {
                io_error_kind(source) == Some(std::io::ErrorKind::PermissionDenied)
            }
            Self::Rpc { status, .. } => status.code() == tonic::Code::PermissionDenied,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerdProbe {
    socket: PathBuf,
    timeout: Duration,
}

impl ContainerdProbe {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Bounds dialing the socket and every call made over it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Daemon socket on the host.
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Containers of all namespaces. Running state is only checked on
    /// [`resolve`](Self::resolve). A namespace that cannot be listed is
    /// skipped.
    ///
    /// # Errors
    ///
    /// - [`Error::Connect`] if the socket cannot be dialed.
    /// - [`Error::Rpc`] if listing the namespaces fails.
    pub async fn list(&self) -> Result<Vec<Candidate>> {
        let channel = self.connect().await?;
        let namespaces: proto::ListNamespacesResponse = unary(
            &channel,
            proto::LIST_NAMESPACES,
            None,
            proto::ListNamespacesRequest::default(),
        )
        .await?;
        log::debug!("Found {} containerd namespaces", namespaces.namespaces.len());

        let mut candidates = Vec::new();
        for namespace in namespaces.namespaces {
            let containers: proto::ListContainersResponse = match unary(
                &channel,
                proto::LIST_CONTAINERS,
                Some(&namespace.name),
                proto::ListContainersRequest::default(),
            )
            .await
            {
                Ok(response) => response,
                Err(err) => {
                    log::warn!("Skipping containerd namespace `{}`: {err}", namespace.name);
                    continue;
                }
            };
            candidates.extend(containers.containers.into_iter().map(|container| Candidate {
                backend: Backend::Containerd,
                name: display_name(&container.id, &container.labels).to_owned(),
                image: Some(container.image).filter(|image| !image.is_empty()),
                id: container.id,
                namespace: Some(namespace.name.clone()),
            }));
        }
        Ok(candidates)
    }

    /// Looks up the init task of the container for its pid.
    ///
    /// # Errors
    ///
    /// - [`Error::NoTask`] or [`Error::NotRunning`] for a container that is
    ///   not running.
    /// - [`Error::Connect`] or [`Error::Rpc`] if containerd cannot be asked.
    pub async fn resolve(&self, candidate: &Candidate) -> Result<Target> {
        let channel = self.connect().await?;
        let response: proto::GetResponse = unary(
            &channel,
            proto::GET_TASK,
            candidate.namespace.as_deref(),
            proto::GetRequest {
                container_id: candidate.id.clone(),
                exec_id: String::new(),
            },
        )
        .await?;
        let process = response
            .process
            .ok_or_else(|| Error::NoTask(candidate.id.clone()))?;
        if proto::Status::try_from(process.status) != Ok(proto::Status::Running) || process.pid == 0 {
            return Err(Error::NotRunning(candidate.id.clone()));
        }

        Ok(Target {
            backend: Backend::Containerd,
            name: candidate.name.clone(),
            pid: process.pid,
            container_id: Some(ContainerID::new(&candidate.id)?),
            service_unit: None,
            image: candidate.image.clone(),
            runtime_log: None,
        })
    }

    async fn connect(&self) -> Result<Channel> {
        transport::connect(&self.socket, self.timeout).await
    }
}

fn display_name<'a>(id: &'a str, labels: &'a HashMap<String, String>) -> &'a str {
    NAME_LABELS
        .iter()
        .find_map(|label| labels.get(*label).filter(|name| !name.is_empty()))
        .map_or(id, String::as_str)
}

async fn unary<Req, Resp>(
    channel: &Channel,
    method: &'static str,
    namespace: Option<&str>,
    message: Req,
) -> Result<Resp>
where
    Req: prost::Message + Send + Sync + 'static,
    Resp: prost::Message + Default + Send + Sync + 'static,
{
    let rpc_error = |status| Error::Rpc {
        method,
        status: Box::new(status),
    };
    let mut grpc = tonic::client::Grpc::new(channel.clone());
    grpc.ready()
        .await
        .map_err(|err| rpc_error(tonic::Status::unavailable(err.to_string())))?;

    let mut request = tonic::Request::new(message);
    if let Some(namespace) = namespace {
        let value = AsciiMetadataValue::from_str(namespace)
            .map_err(|_| Error::InvalidNamespace(namespace.to_owned()))?;
        request.metadata_mut().insert(NAMESPACE_HEADER, value);
    }
    let codec = tonic::codec::ProstCodec::<Req, Resp>::default();
    let response = grpc
        .unary(request, PathAndQuery::from_static(method), codec)
        .await
        .map_err(rpc_error)?;
    Ok(response.into_inner())
}
