use crate::packet::read_i32_le;
use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK_LEN: usize = 4096;
const SIZE_FIELD_LEN: usize = std::mem::size_of::<i32>();

/// Splits the first complete frame off the front of `buf`.
///
/// Returns `Ok(None)` if more data is needed, or the frame (including its size field) and the
/// bytes after it. A size field that is negative or larger than `max_size` is an error, since
/// the position of the next frame can't be trusted after it.
pub fn split_frame(buf: &[u8], max_size: usize) -> crate::Result<Option<(&[u8], &[u8])>> {
    if buf.len() < SIZE_FIELD_LEN {
        return Ok(None);
    }

    let size = read_i32_le(buf, 0);
    if size < 0 || size as usize > max_size {
        return Err(crate::Error::malformed(format!(
            "frame size {} outside of 0..={}",
            size, max_size
        )));
    }

    let frame_len = SIZE_FIELD_LEN + size as usize;
    if buf.len() < frame_len {
        return Ok(None);
    }

    Ok(Some(buf.split_at(frame_len)))
}

/// Reads length-prefixed frames from a byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    read: R,
    buffer: Vec<u8>,
    read_offset: usize,
    max_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(read: R, max_size: usize) -> Self {
        FrameReader {
            read,
            buffer: Vec::new(),
            read_offset: 0,
            max_size,
        }
    }

    /// Waits for the next complete frame.
    ///
    /// Returns `Ok(None)` once the peer has closed the stream.
    pub async fn next_frame(&mut self) -> crate::Result<Option<Vec<u8>>> {
        // Repeatedly fetch data from the remote until a frame is complete
        loop {
            if let Some((frame, remaining)) =
                split_frame(&self.buffer[self.read_offset..], self.max_size)?
            {
                let frame = frame.to_vec();

                // Consume the bytes
                self.read_offset = self.buffer.len() - remaining.len();
                return Ok(Some(frame));
            }

            // Move the unconsumed tail to the front so the buffer only ever holds one partial
            // frame plus the next read
            if self.read_offset > 0 {
                self.buffer.drain(..self.read_offset);
                self.read_offset = 0;
            }

            // Add some space to write into
            let write_start = self.buffer.len();
            self.buffer.resize(write_start + READ_CHUNK_LEN, 0);

            let write_len = match self.read.read(&mut self.buffer[write_start..]).await {
                Ok(len) => len,
                Err(err) => {
                    self.buffer.truncate(write_start);
                    return Err(err.into());
                }
            };

            // Shrink the buffer again so it only contains written data
            self.buffer.truncate(write_start + write_len);

            if write_len == 0 {
                let leftover = self.buffer.len() - self.read_offset;
                if leftover > 0 {
                    warn!("Stream closed with {} bytes of an incomplete frame", leftover);
                }
                return Ok(None);
            }
        }
    }

    /// Number of bytes received but not yet returned as part of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.read_offset
    }
}
