//! Gateway wire protocol
//!
//! Length-prefixed JSON frames: 4-byte big-endian length, then the JSON
//! body. One request maps to one response. Frame size is bounded so a
//! misbehaving peer cannot make the client allocate unbounded memory.

use duplex_core::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::BusRecord;

/// Maximum accepted frame size.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Client-to-gateway request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Publish one keyed record; acknowledged only after durable accept.
    Produce {
        topic: String,
        key: String,
        payload: String,
    },
    /// Fetch the next record for a group, long-polling up to `max_wait_ms`.
    Fetch {
        group: String,
        topics: Vec<String>,
        max_wait_ms: u64,
    },
    /// Advance a group's committed offset past `offset`.
    Commit {
        group: String,
        topic: String,
        partition: u32,
        offset: u64,
    },
}

/// Gateway-to-client response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Record durably accepted.
    Produced { partition: u32, offset: u64 },
    /// One fetched record.
    Record { record: BusRecord },
    /// Fetch wait elapsed with nothing to deliver.
    Empty,
    /// Offset committed.
    Committed,
    /// Request failed on the gateway side.
    Error { message: String },
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(ReplicationError::bus(format!(
            "frame of {} bytes exceeds limit of {} bytes",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ReplicationError::bus(format!(
            "peer announced frame of {len} bytes, limit is {MAX_FRAME_SIZE}"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
