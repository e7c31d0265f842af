use std::{net::SocketAddr, time::Duration};

use tokio::net::{lookup_host, TcpStream};

use crate::{
    error::{Error, ErrorKind, Result},
    options::TargetAddress,
};

/// The timeout applied to connection attempts when the pool options do not specify one.
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens a TCP connection to `address`, attempting each resolved socket address in sequence and
/// returning the first success or the most recent failure.
pub(crate) async fn connect_tcp(
    address: &TargetAddress,
    connect_timeout: Option<Duration>,
) -> Result<TcpStream> {
    let timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);

    let socket_addrs: Vec<_> = lookup_host((address.host.as_str(), address.port))
        .await
        .map_err(|e| {
            Error::from(ErrorKind::DnsResolve {
                message: format!("failed to resolve {}: {}", address, e),
            })
        })?
        .collect();

    if socket_addrs.is_empty() {
        return Err(ErrorKind::DnsResolve {
            message: format!("no results for {}", address),
        }
        .into());
    }

    let mut last_error = None;
    for socket_addr in socket_addrs {
        match try_connect(socket_addr, timeout).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| Error::internal("connection attempt produced no result")))
}

async fn try_connect(address: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream_future = TcpStream::connect(address);

    // A zero timeout means connection attempts are not bounded.
    let stream = if timeout.is_zero() {
        stream_future.await?
    } else {
        tokio::time::timeout(timeout, stream_future)
            .await
            .map_err(|_| Error::network_timeout())??
    };

    stream.set_nodelay(true)?;

    Ok(stream)
}
