//! Proxy wire messages
//!
//! Every message is one frame with a bincode payload and a CRC32 trailer:
//!
//! ```text
//! [message_type:1][length:4][payload:N][crc32:4]
//! ```

use crate::change::ChangeSet;
use crate::identifier::MeshObjectIdentifier;
use crate::mesh::MeshObject;
use crate::{Error, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const HEADER_LEN: usize = 5;
const CRC_LEN: usize = 4;

/// Largest payload accepted from the wire (64MB)
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Message type tag
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMessageType {
    /// Committed changes
    Changes = 0x01,
    /// Replica request
    RequestReplicas = 0x10,
    /// Replica grant
    ReplicaGranted = 0x11,
    /// Replica cancellation
    CancelReplicas = 0x12,
}

impl TryFrom<u8> for ProxyMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Changes),
            0x10 => Ok(Self::RequestReplicas),
            0x11 => Ok(Self::ReplicaGranted),
            0x12 => Ok(Self::CancelReplicas),
            _ => Err(Error::wire(format!("Unknown message type: {:#04x}", value))),
        }
    }
}

/// Message exchanged between two proxies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProxyMessage {
    /// Changes the partner must apply, in commit order
    Changes {
        /// Committed changes
        changes: ChangeSet,
    },

    /// Ask the partner for replicas
    RequestReplicas {
        /// Requested nodes
        ids: Vec<MeshObjectIdentifier>,
    },

    /// Replicas granted by the partner
    ReplicaGranted {
        /// Node state at grant time
        objects: Vec<MeshObject>,
    },

    /// The sender dropped its replicas of these nodes
    CancelReplicas {
        /// Cancelled nodes
        ids: Vec<MeshObjectIdentifier>,
    },
}

impl ProxyMessage {
    /// Type tag
    pub fn message_type(&self) -> ProxyMessageType {
        match self {
            Self::Changes { .. } => ProxyMessageType::Changes,
            Self::RequestReplicas { .. } => ProxyMessageType::RequestReplicas,
            Self::ReplicaGranted { .. } => ProxyMessageType::ReplicaGranted,
            Self::CancelReplicas { .. } => ProxyMessageType::CancelReplicas,
        }
    }

    /// Encode into one frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::wire(format!("Serialization failed: {}", e)))?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::wire(format!("Payload too large: {} bytes", payload.len())));
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        Ok(buf)
    }

    /// Decode one complete frame
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN + CRC_LEN {
            return Err(Error::wire("Frame too short"));
        }

        let crc_offset = buf.len() - CRC_LEN;
        let stored_crc = read_u32(&buf[crc_offset..])?;
        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();
        if stored_crc != computed_crc {
            return Err(Error::wire(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        let message_type = ProxyMessageType::try_from(buf[0])?;
        let length = read_u32(&buf[1..HEADER_LEN])? as usize;
        if HEADER_LEN + length != crc_offset {
            return Err(Error::wire(format!(
                "Length mismatch: header says {}, frame holds {}",
                length,
                crc_offset - HEADER_LEN
            )));
        }

        let message: Self = bincode::deserialize(&buf[HEADER_LEN..crc_offset])
            .map_err(|e| Error::wire(format!("Deserialization failed: {}", e)))?;
        if message.message_type() != message_type {
            return Err(Error::wire(format!(
                "Frame tagged {:?} holds {:?}",
                message_type,
                message.message_type()
            )));
        }
        Ok(message)
    }

    /// Write one frame to an async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame from an async stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let length = read_u32(&header[1..])? as usize;
        if length > MAX_PAYLOAD_LEN {
            return Err(Error::wire(format!("Payload too large: {} bytes", length)));
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + length + CRC_LEN);
        frame.extend_from_slice(&header);
        frame.resize(HEADER_LEN + length + CRC_LEN, 0);
        reader.read_exact(&mut frame[HEADER_LEN..]).await?;

        Self::decode(&frame)
    }
}

fn read_u32(bytes: &[u8]) -> Result<u32> {
    let array: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::wire("Truncated integer"))?;
    Ok(u32::from_le_bytes(array))
}
