//! HDHomeRun control protocol, used to tune legacy devices.
//!
//! Packet layout:
//! ```text
//! +--------+--------+------------------------+--------+
//! | Type   | Length |  TLVs (tag, len, data) | CRC32  |
//! | u16 BE | u16 BE |      Length bytes      | u32 LE |
//! +--------+--------+------------------------+--------+
//! ```
//! TLV lengths take one byte below 128 and two bytes otherwise (low seven
//! bits first, with the high bit set as a continuation flag).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::TunerError;

pub const CONTROL_PORT: u16 = 65001;

pub const TYPE_GETSET_REQ: u16 = 0x0004;
pub const TYPE_GETSET_RPY: u16 = 0x0005;

pub const TAG_GETSET_NAME: u8 = 0x03;
pub const TAG_GETSET_VALUE: u8 = 0x04;
pub const TAG_ERROR_MESSAGE: u8 = 0x05;
pub const TAG_GETSET_LOCKKEY: u8 = 0x15;

const HEADER_SIZE: usize = 4;
const CRC_SIZE: usize = 4;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// CRC-32 (IEEE 802.3, reflected polynomial 0xEDB88320).
pub fn crc32(data: &[u8]) -> u32 {
    static CRC_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC_TABLE[index];
    }
    crc ^ 0xFFFF_FFFF
}

fn put_var_len(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u8((len & 0x7F) as u8 | 0x80);
        buf.put_u8((len >> 7) as u8);
    }
}

fn get_var_len(buf: &mut Bytes) -> Result<usize, TunerError> {
    if !buf.has_remaining() {
        return Err(TunerError::Protocol("truncated TLV length".into()));
    }
    let first = buf.get_u8() as usize;
    if first & 0x80 == 0 {
        return Ok(first);
    }
    if !buf.has_remaining() {
        return Err(TunerError::Protocol("truncated TLV length".into()));
    }
    let second = buf.get_u8() as usize;
    Ok((first & 0x7F) | (second << 7))
}

/// NUL-terminated string payload.
fn c_string(s: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(s.len() + 1);
    v.extend_from_slice(s.as_bytes());
    v.push(0);
    v
}

fn from_c_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// A decoded control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: u16,
    pub tlvs: Vec<(u8, Bytes)>,
}

impl Packet {
    pub fn tag(&self, tag: u8) -> Option<&Bytes> {
        self.tlvs.iter().find(|(t, _)| *t == tag).map(|(_, v)| v)
    }

    pub fn tag_string(&self, tag: u8) -> Option<String> {
        self.tag(tag).map(|v| from_c_string(v))
    }
}

/// Frame a packet: header, TLVs, CRC trailer.
pub fn encode_packet(packet_type: u16, tlvs: &[(u8, Vec<u8>)]) -> Bytes {
    let mut payload = BytesMut::new();
    for (tag, value) in tlvs {
        payload.put_u8(*tag);
        put_var_len(&mut payload, value.len());
        payload.put_slice(value);
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    buf.put_u16(packet_type);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(&payload);
    let crc = crc32(&buf);
    buf.put_u32_le(crc);
    buf.freeze()
}

/// Build a get (no `value`) or set request.
pub fn encode_getset(name: &str, value: Option<&str>, lockkey: Option<u32>) -> Bytes {
    let mut tlvs = vec![(TAG_GETSET_NAME, c_string(name))];
    if let Some(value) = value {
        tlvs.push((TAG_GETSET_VALUE, c_string(value)));
    }
    if let Some(key) = lockkey {
        tlvs.push((TAG_GETSET_LOCKKEY, key.to_be_bytes().to_vec()));
    }
    encode_packet(TYPE_GETSET_REQ, &tlvs)
}

/// Decode one complete packet, verifying its CRC.
pub fn decode_packet(data: &[u8]) -> Result<Packet, TunerError> {
    if data.len() < HEADER_SIZE + CRC_SIZE {
        return Err(TunerError::Protocol(format!("packet too short: {} bytes", data.len())));
    }

    let mut header = &data[..HEADER_SIZE];
    let packet_type = header.get_u16();
    let length = header.get_u16() as usize;
    let body_end = HEADER_SIZE + length;
    if data.len() != body_end + CRC_SIZE {
        return Err(TunerError::Protocol(format!(
            "length mismatch: header says {}, got {}",
            length,
            data.len().saturating_sub(HEADER_SIZE + CRC_SIZE)
        )));
    }

    let mut trailer = &data[body_end..];
    let expected = trailer.get_u32_le();
    let actual = crc32(&data[..body_end]);
    if expected != actual {
        return Err(TunerError::Protocol(format!(
            "bad CRC: expected {:08x}, computed {:08x}",
            expected, actual
        )));
    }

    let mut payload = Bytes::copy_from_slice(&data[HEADER_SIZE..body_end]);
    let mut tlvs = Vec::new();
    while payload.has_remaining() {
        let tag = payload.get_u8();
        let len = get_var_len(&mut payload)?;
        if payload.remaining() < len {
            return Err(TunerError::Protocol(format!(
                "TLV {:#04x} wants {} bytes, {} left",
                tag,
                len,
                payload.remaining()
            )));
        }
        tlvs.push((tag, payload.split_to(len)));
    }

    Ok(Packet { packet_type, tlvs })
}

/// Read one framed packet from a stream.
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, TunerError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;

    let mut data = vec![0u8; HEADER_SIZE + length + CRC_SIZE];
    data[..HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut data[HEADER_SIZE..]).await?;
    decode_packet(&data)
}

/// A tuner we hold the lock for.
#[derive(Debug, Clone)]
pub struct TunerLease {
    pub host: String,
    pub tuner: u32,
    pub lockkey: u32,
}

/// Get/set client for one device.
#[derive(Debug, Clone)]
pub struct ControlClient {
    host: String,
    addr: String,
}

impl ControlClient {
    pub fn new(host: &str) -> Self {
        Self::with_port(host, CONTROL_PORT)
    }

    pub fn with_port(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            addr: format!("{}:{}", host, port),
        }
    }

    async fn connect(&self) -> Result<TcpStream, TunerError> {
        tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TunerError::Protocol(format!("timed out connecting to {}", self.addr)))?
            .map_err(TunerError::Io)
    }

    async fn exchange(
        conn: &mut TcpStream,
        name: &str,
        value: Option<&str>,
        lockkey: Option<u32>,
    ) -> Result<String, TunerError> {
        let request = encode_getset(name, value, lockkey);
        conn.write_all(&request).await?;

        let reply = tokio::time::timeout(IO_TIMEOUT, read_packet(conn))
            .await
            .map_err(|_| TunerError::Protocol(format!("no reply for {}", name)))??;

        if reply.packet_type != TYPE_GETSET_RPY {
            return Err(TunerError::Protocol(format!(
                "unexpected packet type {:#06x}",
                reply.packet_type
            )));
        }
        if let Some(message) = reply.tag_string(TAG_ERROR_MESSAGE) {
            return Err(TunerError::Device(message));
        }
        Ok(reply.tag_string(TAG_GETSET_VALUE).unwrap_or_default())
    }

    pub async fn get(&self, name: &str) -> Result<String, TunerError> {
        let mut conn = self.connect().await?;
        Self::exchange(&mut conn, name, None, None).await
    }

    pub async fn set(&self, name: &str, value: &str, lockkey: Option<u32>) -> Result<String, TunerError> {
        let mut conn = self.connect().await?;
        Self::exchange(&mut conn, name, Some(value), lockkey).await
    }

    /// Lock the first free tuner, tune it and point its output at `target`.
    ///
    /// If this future is dropped part way (an open timeout), a lock that may
    /// already be held is released in the background.
    pub async fn lock_and_tune(
        &self,
        tuner_count: u32,
        channel: &str,
        target: &str,
    ) -> Result<TunerLease, TunerError> {
        let mut conn = self.connect().await?;
        let lockkey = rand::random::<u32>().max(1);

        for tuner in 0..tuner_count.max(1) {
            let lease = TunerLease {
                host: self.host.clone(),
                tuner,
                lockkey,
            };
            // Armed before the request: the device may grant the lock even if
            // the reply never reaches us.
            let guard = LeaseGuard::new(self.clone(), lease.clone());

            let lock_name = format!("/tuner{}/lockkey", tuner);
            match Self::exchange(&mut conn, &lock_name, Some(&lockkey.to_string()), None).await {
                Ok(_) => {}
                Err(TunerError::Device(message)) => {
                    guard.disarm();
                    tracing::debug!(host = %self.host, tuner, "Tuner unavailable: {}", message);
                    continue;
                }
                Err(e) => return Err(e),
            }

            let (setting, value) = channel_setting(channel);
            let tuned = async {
                Self::exchange(&mut conn, &format!("/tuner{}/{}", tuner, setting), Some(&value), Some(lockkey))
                    .await?;
                Self::exchange(&mut conn, &format!("/tuner{}/target", tuner), Some(target), Some(lockkey)).await
            }
            .await;

            return match tuned {
                Ok(_) => Ok(guard.disarm()),
                Err(e) => {
                    if self.unlock(&mut conn, &lease).await.is_ok() {
                        guard.disarm();
                    }
                    match e {
                        TunerError::Device(message) => Err(TunerError::ChannelNotFound(format!(
                            "{} on {}: {}",
                            channel, self.host, message
                        ))),
                        other => Err(other),
                    }
                }
            };
        }

        Err(TunerError::NoFreeTuner(format!(
            "all {} tuners on {} are in use",
            tuner_count, self.host
        )))
    }

    async fn unlock(&self, conn: &mut TcpStream, lease: &TunerLease) -> Result<(), TunerError> {
        let target = format!("/tuner{}/target", lease.tuner);
        Self::exchange(conn, &target, Some("none"), Some(lease.lockkey)).await?;
        let lock = format!("/tuner{}/lockkey", lease.tuner);
        Self::exchange(conn, &lock, Some("none"), Some(lease.lockkey)).await?;
        Ok(())
    }

    /// Stop streaming and drop the lock.
    pub async fn release(&self, lease: &TunerLease) -> Result<(), TunerError> {
        let mut conn = self.connect().await?;
        self.unlock(&mut conn, lease).await
    }
}

/// Releases a tuner lock on drop unless disarmed.
struct LeaseGuard {
    client: ControlClient,
    lease: TunerLease,
    armed: bool,
}

impl LeaseGuard {
    fn new(client: ControlClient, lease: TunerLease) -> Self {
        Self {
            client,
            lease,
            armed: true,
        }
    }

    fn disarm(mut self) -> TunerLease {
        self.armed = false;
        self.lease.clone()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let lease = self.lease.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(host = %lease.host, tuner = lease.tuner, "No runtime to release abandoned tuner lock");
            return;
        };
        let client = self.client.clone();
        handle.spawn(async move {
            match client.release(&lease).await {
                Ok(()) => tracing::debug!(host = %lease.host, tuner = lease.tuner, "Released abandoned tuner lock"),
                Err(e) => tracing::debug!(host = %lease.host, tuner = lease.tuner, "Abandoned tuner lock not released: {}", e),
            }
        });
    }
}

/// Virtual channels ("5.1", "7") are tuned with `vchannel`, physical
/// channel specs ("auto:57") with `channel`.
fn channel_setting(channel: &str) -> (&'static str, String) {
    if channel.contains(':') {
        ("channel", channel.to_string())
    } else {
        ("vchannel", channel.to_string())
    }
}
