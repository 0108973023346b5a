use std::{io, time::Duration};

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

#[cfg(test)]
pub(crate) mod mock;
mod scpi;
mod scpi_prologix;
mod scpi_tcp;
pub mod vxi11;

pub use scpi::ScpiProtocol;
pub use scpi_prologix::{GPIB_MAX_ADDRESS, GpibAdapter, ScpiPrologixProtocol};
pub use scpi_tcp::ScpiTcpProtocol;
pub use vxi11::{ScpiVxi11Protocol, portmap::PORTMAP_PORT};

use crate::{
    error::{Error, Result},
    model::ModelInfo,
    resource::AccessMode,
};

#[async_trait]
pub trait Protocol: Send + Sync {
    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    async fn model(&mut self) -> Result<ModelInfo>;
}

/// Parameters a session is opened with
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Lock requested on the instrument
    pub access_mode: AccessMode,
    /// Bound on connection establishment, and on waiting for a device lock
    pub open_timeout: Duration,
    /// Bound on each individual read
    pub io_timeout: Duration,
}

/// Make line terminators visible in log output
pub(crate) fn printable(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .replace('\n', "␤")
        .replace('\r', "␊")
}

/// Read up to and including the next `\n`, but never more than `max_len`
/// bytes
pub(crate) async fn read_line_bounded<R>(
    reader: &mut R,
    max_len: usize,
    io_timeout: Duration,
) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut resp = vec![];
    let mut limited = reader.take(max_len as u64);

    match tokio::time::timeout(io_timeout, limited.read_until(b'\n', &mut resp)).await {
        Err(_) => Err(Error::Timeout(format!(
            "No response within {} ms",
            io_timeout.as_millis()
        ))),
        Ok(Ok(0)) if max_len > 0 => Err(Error::IoError(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        ))),
        Ok(res) => {
            res?;
            Ok(resp)
        }
    }
}

/// Whether a line read ended on a message boundary. After a timeout or a
/// reply cut short at `max_len`, the rest of that reply is still queued and
/// would be taken for the answer to the next query.
pub(crate) fn at_boundary(res: &Result<Vec<u8>>) -> bool {
    matches!(res, Ok(data) if data.ends_with(b"\n"))
}
