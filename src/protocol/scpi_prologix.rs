use std::{fmt::Display, str::FromStr};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tokio_serial::SerialPortBuilderExt;

use crate::{
    error::{Error, Result},
    model::ModelInfo,
};

use super::{
    Protocol, ScpiProtocol, SessionOptions, at_boundary, printable, read_line_bounded,
};

/// TCP port of the Prologix GPIB-ETHERNET controller
pub const PROLOGIX_TCP_PORT: u16 = 1234;
pub const PROLOGIX_DEFAULT_BAUD: u32 = 115200;
/// Highest GPIB primary address
pub const GPIB_MAX_ADDRESS: u8 = 30;

const ESC: u8 = 0x1b;
/// Longest read timeout the adapter accepts
const MAX_ADAPTER_READ_TMO_MS: u128 = 3000;

/// Where a GPIB board is reached
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GpibAdapter {
    /// Prologix GPIB-USB, appears as a serial port
    Serial { port: String, baud: u32 },
    /// Prologix GPIB-ETHERNET
    Tcp { host: String, port: u16 },
}
impl FromStr for GpibAdapter {
    type Err = Error;

    /// Accepts `serial:<path>[?baud=<baud>]` or `tcp://<host>[:<port>]`
    fn from_str(uri: &str) -> Result<Self> {
        if let Some(path) = uri.strip_prefix("serial:") {
            let (port, baud) = match path.split_once("?baud=") {
                Some((port, baud)) => (
                    port,
                    baud.parse().map_err(|e| {
                        Error::InvalidArgument(format!("Bad baud rate in `{uri}`: {e}"))
                    })?,
                ),
                None => (path, PROLOGIX_DEFAULT_BAUD),
            };
            if port.is_empty() {
                return Err(Error::InvalidArgument(format!("No serial port in `{uri}`")));
            }
            Ok(Self::Serial {
                port: port.to_string(),
                baud,
            })
        } else if let Some(addr) = uri.strip_prefix("tcp://") {
            let (host, port) = match addr.rsplit_once(':') {
                Some((host, port)) => (
                    host,
                    port.parse().map_err(|e| {
                        Error::InvalidArgument(format!("Bad port in `{uri}`: {e}"))
                    })?,
                ),
                None => (addr, PROLOGIX_TCP_PORT),
            };
            if host.is_empty() {
                return Err(Error::InvalidArgument(format!("No host in `{uri}`")));
            }
            Ok(Self::Tcp {
                host: host.to_string(),
                port,
            })
        } else {
            Err(Error::InvalidArgument(format!(
                "GPIB adapter `{uri}` is neither serial: nor tcp://"
            )))
        }
    }
}
impl Display for GpibAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial { port, baud } => write!(f, "serial:{port}?baud={baud}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

trait AdapterStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> AdapterStream for T {}

/// SCPI to a GPIB instrument through a Prologix controller in controller
/// mode. Each session owns its adapter and keeps it addressed to one
/// instrument.
pub struct ScpiPrologixProtocol {
    adapter: GpibAdapter,
    address: u8,
    options: SessionOptions,
    stream: Option<BufReader<Box<dyn AdapterStream>>>,
}
impl ScpiPrologixProtocol {
    pub fn new(adapter: GpibAdapter, address: u8, options: SessionOptions) -> Result<Self> {
        if address > GPIB_MAX_ADDRESS {
            return Err(Error::InvalidArgument(format!(
                "GPIB primary address {address} outside 0..={GPIB_MAX_ADDRESS}"
            )));
        }

        Ok(Self {
            adapter,
            address,
            options,
            stream: None,
        })
    }

    async fn open_adapter(&self) -> Result<Box<dyn AdapterStream>> {
        match &self.adapter {
            GpibAdapter::Serial { port, baud } => {
                let serial = tokio_serial::new(port, *baud)
                    .open_native_async()
                    .map_err(|e| Error::Unhandled(e.into()))?;
                Ok(Box::new(serial))
            }
            GpibAdapter::Tcp { host, port } => {
                let connect = TcpStream::connect((host.as_str(), *port));
                match tokio::time::timeout(self.options.open_timeout, connect).await {
                    Err(_) => Err(Error::Timeout(format!(
                        "Connecting to {} for {} ms",
                        self.adapter,
                        self.options.open_timeout.as_millis()
                    ))),
                    Ok(res) => Ok(Box::new(res.map_err(|e| Error::Unhandled(e.into()))?)),
                }
            }
        }
    }

    /// Send an adapter command, these are never forwarded to the bus
    async fn adapter_cmd(&mut self, cmd: &str) -> Result<()> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotConnected);
        };

        debug!("adapter_cmd(): {cmd}");

        stream
            .get_mut()
            .write_all(format!("{cmd}\n").as_bytes())
            .await
            .map_err(|e| Error::Unhandled(e.into()))
    }
}
#[async_trait]
impl Protocol for ScpiPrologixProtocol {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::Unspecified("Already connected".into()));
        }

        self.stream = Some(BufReader::new(self.open_adapter().await?));

        let read_tmo = self
            .options
            .io_timeout
            .as_millis()
            .clamp(1, MAX_ADAPTER_READ_TMO_MS);

        self.adapter_cmd("++savecfg 0").await?;
        self.adapter_cmd("++mode 1").await?;
        self.adapter_cmd("++auto 0").await?;
        /* Messages are terminated by EOI on the last byte, nothing appended */
        self.adapter_cmd("++eoi 1").await?;
        self.adapter_cmd("++eos 3").await?;
        self.adapter_cmd(&format!("++read_tmo_ms {read_tmo}")).await?;
        self.adapter_cmd(&format!("++addr {}", self.address)).await?;

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stream.take();
        Ok(())
    }

    async fn model(&mut self) -> Result<ModelInfo> {
        (self as &mut dyn ScpiProtocol).idn_model().await
    }
}
#[async_trait]
impl ScpiProtocol for ScpiPrologixProtocol {
    async fn int_send(&mut self, data: &[u8]) -> Result<()> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotConnected);
        };

        let to_send = escape(data);
        debug!("int_send(): {}", printable(&to_send));

        stream
            .get_mut()
            .write_all(&to_send)
            .await
            .map_err(|e| Error::Unhandled(e.into()))?;

        Ok(())
    }

    async fn int_recv(&mut self, max_len: usize) -> Result<Vec<u8>> {
        self.adapter_cmd("++read eoi").await?;

        let Some(stream) = &mut self.stream else {
            return Err(Error::NotConnected);
        };

        let res = read_line_bounded(stream, max_len, self.options.io_timeout).await;
        if !at_boundary(&res) {
            warn!(
                "GPIB address {} via {} reply incomplete, dropping the adapter",
                self.address, self.adapter
            );
            self.stream = None;
        }
        res
    }
}

/// Escape bytes the adapter would otherwise interpret, and terminate the
/// adapter line
fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 1);
    for &b in data {
        if matches!(b, b'\r' | b'\n' | ESC | b'+') {
            out.push(ESC);
        }
        out.push(b);
    }
    out.push(b'\n');
    out
}
