use async_trait::async_trait;
use log::{debug, warn};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::TcpStream,
};

use crate::{
    error::{Error, Result},
    model::ModelInfo,
};

use super::{Protocol, ScpiProtocol, SessionOptions, at_boundary, read_line_bounded};

/// SCPI over a raw TCP socket (`TCPIP::<host>::<port>::SOCKET`), messages are
/// terminated with a linefeed in both directions
pub struct ScpiTcpProtocol {
    host: String,
    port: u16,
    options: SessionOptions,
    stream: Option<BufReader<TcpStream>>,
}
impl ScpiTcpProtocol {
    pub fn new(host: &str, port: u16, options: SessionOptions) -> Self {
        Self {
            host: host.to_string(),
            port,
            options,
            stream: None,
        }
    }
}
#[async_trait]
impl Protocol for ScpiTcpProtocol {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::Unspecified("Already connected".into()));
        }

        debug!("connecting to {}:{}", self.host, self.port);

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match tokio::time::timeout(self.options.open_timeout, connect).await {
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "Connecting to {}:{} for {} ms",
                    self.host,
                    self.port,
                    self.options.open_timeout.as_millis()
                )));
            }
            Ok(res) => res.map_err(|e| Error::Unhandled(e.into()))?,
        };
        stream.set_nodelay(true)?;

        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.get_mut().shutdown().await?;
        }
        Ok(())
    }

    async fn model(&mut self) -> Result<ModelInfo> {
        (self as &mut dyn ScpiProtocol).idn_model().await
    }
}
#[async_trait]
impl ScpiProtocol for ScpiTcpProtocol {
    async fn int_send(&mut self, data: &[u8]) -> Result<()> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotConnected);
        };

        let mut to_send = Vec::with_capacity(data.len() + 1);
        to_send.extend_from_slice(data);
        to_send.push(b'\n');

        stream
            .get_mut()
            .write_all(&to_send)
            .await
            .map_err(|e| Error::Unhandled(e.into()))?;

        Ok(())
    }

    async fn int_recv(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotConnected);
        };

        let res = read_line_bounded(stream, max_len, self.options.io_timeout).await;
        if !at_boundary(&res) {
            warn!(
                "{}:{} reply incomplete, dropping the connection",
                self.host, self.port
            );
            self.stream = None;
        }
        res
    }
}
