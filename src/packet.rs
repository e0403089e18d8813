//! MPEG-TS packet type and framing helper
//!
//! A transport-stream packet is a fixed 188-byte frame starting with the
//! sync byte `0x47`. Packets are backed by `bytes::Bytes`, so fanning one
//! packet out to many subscriber queues only bumps a reference count; the
//! payload is allocated exactly once.

use std::fmt;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of an MPEG transport-stream packet in bytes
pub const PACKET_SIZE: usize = 188;

/// Every TS packet starts with this synchronization byte
pub const SYNC_BYTE: u8 = 0x47;

/// One immutable 188-byte transport-stream frame
#[derive(Clone, PartialEq, Eq)]
pub struct Packet(Bytes);

impl Packet {
    /// Wrap a buffer as a packet, verifying size and sync byte.
    pub fn new(data: Bytes) -> Option<Self> {
        if data.len() == PACKET_SIZE && data[0] == SYNC_BYTE {
            Some(Packet(data))
        } else {
            None
        }
    }

    /// Borrow the packet payload
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Consume the packet, yielding the shared payload
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Packet length; always [`PACKET_SIZE`]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet(pid={:#06x})", self.pid())
    }
}

impl Packet {
    /// The 13-bit packet identifier, useful in log output
    fn pid(&self) -> u16 {
        (u16::from(self.0[1] & 0x1f) << 8) | u16::from(self.0[2])
    }
}

/// Read the next 188-byte frame from `reader`.
///
/// Bytes before the first `0x47` are discarded one at a time, so streams
/// that start mid-packet or contain short glitches resynchronize on the
/// next frame boundary. Returns `Ok(None)` when the stream ends cleanly
/// before a sync byte is seen; an EOF inside a frame is reported as
/// `ErrorKind::UnexpectedEof`.
pub async fn read_packet<R>(reader: &mut R) -> io::Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; PACKET_SIZE];

    // resynchronize: skip until the sync byte
    loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).await? == 0 {
            return Ok(None);
        }
        if byte[0] == SYNC_BYTE {
            break;
        }
    }

    buf[0] = SYNC_BYTE;
    reader.read_exact(&mut buf[1..]).await?;

    Ok(Some(Packet(Bytes::copy_from_slice(&buf))))
}
