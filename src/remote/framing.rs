use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::WireError;

/// Upper bound on a single frame body; anything larger is a protocol error.
pub(crate) const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Writes one `[length][body]` frame, length as 4 little-endian bytes.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), WireError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::Oversized(body.len(), MAX_FRAME_LEN));
    }
    let length = (body.len() as u32).to_le_bytes();
    writer.write_all(&length).await.map_err(WireError::Write)?;
    writer.write_all(body).await.map_err(WireError::Write)?;
    writer.flush().await.map_err(WireError::Write)?;
    Ok(())
}

#[derive(Debug)]
enum ReadState {
    WaitingForLength,
    WaitingForBody { expected_length: u32 },
}

/// Incremental reader for `[length][body]` frames.
#[derive(Debug)]
pub(crate) struct FrameReader<R> {
    reader: BufReader<R>,
    buffer: Vec<u8>,
    state: ReadState,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buffer: Vec::new(),
            state: ReadState::WaitingForLength,
        }
    }

    pub async fn read_frame(&mut self) -> Result<Vec<u8>, WireError> {
        loop {
            match &self.state {
                ReadState::WaitingForLength => {
                    while self.buffer.len() < 4 {
                        self.fill().await?;
                    }
                    let length_bytes: [u8; 4] = self.buffer[..4]
                        .try_into()
                        .map_err(|_| WireError::InvalidHeader(self.buffer.len()))?;
                    let expected_length = u32::from_le_bytes(length_bytes);
                    if expected_length as usize > MAX_FRAME_LEN {
                        return Err(WireError::Oversized(expected_length as usize, MAX_FRAME_LEN));
                    }
                    // Downstream doesn't need the length prefix anymore.
                    self.buffer.drain(..4);
                    self.state = ReadState::WaitingForBody { expected_length };
                }
                ReadState::WaitingForBody { expected_length } => {
                    let expected = *expected_length as usize;
                    while self.buffer.len() < expected {
                        self.fill().await?;
                    }
                    let body = self.buffer[..expected].to_vec();
                    self.buffer.drain(..expected);
                    self.state = ReadState::WaitingForLength;
                    return Ok(body);
                }
            }
        }
    }

    async fn fill(&mut self) -> Result<(), WireError> {
        let mut chunk = [0u8; 1024];
        let bytes_read = self
            .reader
            .read(&mut chunk)
            .await
            .map_err(WireError::Read)?;
        if bytes_read == 0 {
            return Err(WireError::ConnectionClosed);
        }
        self.buffer.extend_from_slice(&chunk[..bytes_read]);
        Ok(())
    }
}
