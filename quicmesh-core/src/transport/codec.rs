//! Length-prefixed packet frames on a byte stream.
//!
//! ```text
//! +----------------+------------------+
//! | length (u32 BE)|  packet (length) |
//! +----------------+------------------+
//! ```

use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEAD_LEN: usize = 4;
pub const MAX_FRAME_LEN: usize = 65535;

pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    write: &mut W,
    data: &[u8],
) -> io::Result<()> {
    if data.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {}", data.len()),
        ));
    }
    let head: [u8; HEAD_LEN] = (data.len() as u32).to_be_bytes();
    write.write_all(&head).await?;
    write.write_all(data).await?;
    Ok(())
}

/// Read one frame. `Ok(None)` when the stream ends on a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(
    read: &mut R,
    buf: &mut BytesMut,
) -> io::Result<Option<Bytes>> {
    let mut head = [0; HEAD_LEN];
    match read.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(head) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len}"),
        ));
    }
    buf.clear();
    buf.resize(len, 0);
    read.read_exact(&mut buf[..]).await?;
    Ok(Some(buf.split().freeze()))
}
