//! gRPC channel to the containerd daemon over its unix socket.
use std::path::Path;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tonic::transport::{Channel, Endpoint, Uri};

use super::{Error, Result};

/// Placeholder authority; every stream goes to the socket regardless.
const AUTHORITY: &str = "http://containerd";

/// Opens a channel whose connections all dial `socket`. Dialing and each call
/// made on the channel are bounded by `timeout`.
///
/// # Errors
///
/// Returns [`Error::Connect`] if the socket cannot be dialed in time.
pub(super) async fn connect(socket: &Path, timeout: Duration) -> Result<Channel> {
    let path = socket.to_path_buf();
    let dial = tower::service_fn(move |_: Uri| {
        let path = path.clone();
        async move {
            let stream = tokio::net::UnixStream::connect(&path).await?;
            Ok::<_, std::io::Error>(TokioIo::new(stream))
        }
    });

    let channel = Endpoint::from_static(AUTHORITY)
        .connect_timeout(timeout)
        .timeout(timeout)
        .connect_with_connector(dial)
        .await
        .map_err(|source| Error::Connect {
            socket: socket.to_path_buf(),
            source,
        })?;
    log::trace!("Connected to containerd at `{}`", socket.display());
    Ok(channel)
}
