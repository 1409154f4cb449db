//! Length-prefixed media sample framing between a local streamer and the agent.
//!
//! Little-endian:
//! ```text
//! [0..4]   length (u32) of everything that follows
//! [4..12]  duration (u64) in nanoseconds
//! [12..]   sample payload
//! ```

use std::io::{Read, Write};
use std::time::Duration;

pub const SAMPLE_PREFIX_SIZE: usize = 4;
pub const SAMPLE_DURATION_SIZE: usize = 8;
/// Upper bound on the length field; anything larger is treated as corruption.
pub const MAX_SAMPLE_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SamplePacket {
    pub data: Vec<u8>,
    pub duration: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("sample frame too short: {0} bytes (need at least {SAMPLE_DURATION_SIZE})")]
    TooShort(usize),
    #[error("sample frame too large: {0} bytes (limit {MAX_SAMPLE_FRAME})")]
    TooLarge(usize),
    #[error("sample i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl SamplePacket {
    pub fn new(data: impl Into<Vec<u8>>, duration: Duration) -> Self {
        Self {
            data: data.into(),
            duration,
        }
    }

    /// Length-field value for this packet (duration + payload).
    pub fn frame_len(&self) -> usize {
        SAMPLE_DURATION_SIZE + self.data.len()
    }

    /// Serialize length prefix, duration and payload into one buffer.
    pub fn encode(&self) -> Result<Vec<u8>, SampleError> {
        let len = self.frame_len();
        if len > MAX_SAMPLE_FRAME {
            return Err(SampleError::TooLarge(len));
        }
        // Durations past u64::MAX nanoseconds (~584 years) saturate.
        let nanos = u64::try_from(self.duration.as_nanos()).unwrap_or(u64::MAX);

        let mut buf = Vec::with_capacity(SAMPLE_PREFIX_SIZE + len);
        buf.extend_from_slice(&(len as u32).to_le_bytes());
        buf.extend_from_slice(&nanos.to_le_bytes());
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Decode a frame whose length prefix has already been consumed.
    pub fn decode(frame: &[u8]) -> Result<Self, SampleError> {
        if frame.len() < SAMPLE_DURATION_SIZE {
            return Err(SampleError::TooShort(frame.len()));
        }
        let (head, data) = frame.split_at(SAMPLE_DURATION_SIZE);
        let mut nanos = [0u8; SAMPLE_DURATION_SIZE];
        nanos.copy_from_slice(head);
        Ok(Self {
            data: data.to_vec(),
            duration: Duration::from_nanos(u64::from_le_bytes(nanos)),
        })
    }

    /// Validate a length prefix read off the wire.
    pub fn check_frame_len(prefix: [u8; SAMPLE_PREFIX_SIZE]) -> Result<usize, SampleError> {
        let len = u32::from_le_bytes(prefix) as usize;
        if len > MAX_SAMPLE_FRAME {
            return Err(SampleError::TooLarge(len));
        }
        if len < SAMPLE_DURATION_SIZE {
            return Err(SampleError::TooShort(len));
        }
        Ok(len)
    }

    /// Read one complete packet from a blocking reader.
    pub fn read_from(r: &mut impl Read) -> Result<Self, SampleError> {
        let mut prefix = [0u8; SAMPLE_PREFIX_SIZE];
        r.read_exact(&mut prefix)?;
        let len = Self::check_frame_len(prefix)?;
        let mut frame = vec![0u8; len];
        r.read_exact(&mut frame)?;
        Self::decode(&frame)
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), SampleError> {
        w.write_all(&self.encode()?)?;
        Ok(())
    }
}
