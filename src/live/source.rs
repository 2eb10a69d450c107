//! Live source variants and their open connections.

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tunerflow_common::{MediaProtocol, MediaSourceInfo};

use super::LiveStreamError;
use crate::tuners::control::{ControlClient, TunerLease, CONTROL_PORT};
use crate::tuners::udp_target;

const UDP_DATAGRAM_MAX: usize = 65_536;
const FILE_READ_CHUNK: usize = 188 * 512;
const FILE_TAIL_POLL: Duration = Duration::from_millis(100);

/// Where a live stream's bytes come from.
#[derive(Debug, Clone)]
pub enum LiveSource {
    /// HDHomeRun channel URL served over HTTP.
    HdHomeRunHttp { url: String },
    /// Legacy HDHomeRun: tuned over the control protocol, streams UDP to us.
    HdHomeRunUdp {
        host: String,
        channel: String,
        tuner_count: u32,
    },
    /// A source handed to us by a channel provider.
    Provided { media_source: MediaSourceInfo },
}

impl fmt::Display for LiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HdHomeRunHttp { url } => write!(f, "hdhomerun-http {}", url),
            Self::HdHomeRunUdp { host, channel, .. } => {
                write!(f, "hdhomerun-udp {} channel {}", host, channel)
            }
            Self::Provided { media_source } => {
                write!(f, "{} {}", media_source.protocol, media_source.path)
            }
        }
    }
}

impl LiveSource {
    /// Establish the underlying connection.
    ///
    /// The caller applies the open timeout.
    pub async fn connect(&self, http: &reqwest::Client) -> Result<SourceConnection, LiveStreamError> {
        match self {
            Self::HdHomeRunHttp { url } => connect_http(http, url).await,
            Self::HdHomeRunUdp {
                host,
                channel,
                tuner_count,
            } => connect_legacy(host, channel, *tuner_count).await,
            Self::Provided { media_source } => match media_source.protocol {
                MediaProtocol::Http => connect_http(http, &media_source.path).await,
                MediaProtocol::File => {
                    let file = File::open(&media_source.path).await.map_err(|e| {
                        if e.kind() == io::ErrorKind::NotFound {
                            LiveStreamError::InvalidSource(format!("{} does not exist", media_source.path))
                        } else {
                            LiveStreamError::Io(e)
                        }
                    })?;
                    Ok(SourceConnection::File {
                        file,
                        tail: media_source.is_infinite_stream,
                    })
                }
                MediaProtocol::Udp => {
                    let addr = parse_udp_url(&media_source.path)?;
                    let socket = UdpSocket::bind(addr).await.map_err(|e| {
                        LiveStreamError::SourceUnavailable(format!("cannot bind {}: {}", addr, e))
                    })?;
                    Ok(SourceConnection::Udp {
                        socket,
                        lease: None,
                        buf: vec![0u8; UDP_DATAGRAM_MAX],
                    })
                }
            },
        }
    }
}

async fn connect_http(http: &reqwest::Client, url: &str) -> Result<SourceConnection, LiveStreamError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| LiveStreamError::SourceUnavailable(format!("{}: {}", url, e)))?;

    let status = response.status();
    if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
        // HDHomeRun answers 503 when every tuner is in use.
        return Err(LiveStreamError::SourceBusy(format!("{} returned {}", url, status)));
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(LiveStreamError::InvalidSource(format!("{} returned {}", url, status)));
    }
    if !status.is_success() {
        return Err(LiveStreamError::SourceUnavailable(format!("{} returned {}", url, status)));
    }

    Ok(SourceConnection::Http {
        body: Box::pin(response.bytes_stream()),
    })
}

async fn connect_legacy(
    host: &str,
    channel: &str,
    tuner_count: u32,
) -> Result<SourceConnection, LiveStreamError> {
    let local_ip = local_ip_towards(host).await?;
    let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0))
        .await
        .map_err(|e| LiveStreamError::SourceUnavailable(format!("cannot bind UDP socket: {}", e)))?;
    let port = socket.local_addr()?.port();
    let target = udp_target(&local_ip.to_string(), port);

    let lease = ControlClient::new(host)
        .lock_and_tune(tuner_count, channel, &target)
        .await?;

    tracing::info!(host, channel, tuner = lease.tuner, %target, "Legacy tuner streaming");

    Ok(SourceConnection::Udp {
        socket,
        lease: Some(lease),
        buf: vec![0u8; UDP_DATAGRAM_MAX],
    })
}

/// Local address the OS would use to reach `host`.
async fn local_ip_towards(host: &str) -> Result<IpAddr, LiveStreamError> {
    let probe = UdpSocket::bind("0.0.0.0:0").await?;
    probe
        .connect((host, CONTROL_PORT))
        .await
        .map_err(|e| LiveStreamError::SourceUnavailable(format!("cannot route to {}: {}", host, e)))?;
    Ok(probe.local_addr()?.ip())
}

fn parse_udp_url(url: &str) -> Result<SocketAddr, LiveStreamError> {
    url.strip_prefix("udp://")
        .unwrap_or(url)
        .trim_start_matches('@')
        .parse()
        .map_err(|_| LiveStreamError::InvalidSource(format!("bad UDP address: {}", url)))
}

/// An open source, yielding transport-stream chunks.
pub enum SourceConnection {
    Http {
        body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    },
    Udp {
        socket: UdpSocket,
        lease: Option<TunerLease>,
        buf: Vec<u8>,
    },
    File {
        file: File,
        tail: bool,
    },
}

impl SourceConnection {
    /// Next chunk of data, or `None` once the source has ended.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, LiveStreamError> {
        match self {
            Self::Http { body } => match body.next().await {
                Some(Ok(chunk)) => Ok(Some(chunk)),
                Some(Err(e)) => Err(LiveStreamError::SourceUnavailable(e.to_string())),
                None => Ok(None),
            },
            Self::Udp { socket, buf, .. } => {
                let n = socket.recv(buf).await?;
                Ok(Some(Bytes::copy_from_slice(&buf[..n])))
            }
            Self::File { file, tail } => {
                let mut chunk = vec![0u8; FILE_READ_CHUNK];
                loop {
                    let n = file.read(&mut chunk).await?;
                    if n > 0 {
                        chunk.truncate(n);
                        return Ok(Some(Bytes::from(chunk)));
                    }
                    if !*tail {
                        return Ok(None);
                    }
                    tokio::time::sleep(FILE_TAIL_POLL).await;
                }
            }
        }
    }

    /// Give the tuner back.
    pub async fn release(self) {
        if let Self::Udp {
            lease: Some(lease), ..
        } = self
        {
            if let Err(e) = ControlClient::new(&lease.host).release(&lease).await {
                tracing::warn!(host = %lease.host, tuner = lease.tuner, "Failed to release tuner: {}", e);
            }
        }
    }
}
