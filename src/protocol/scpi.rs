use async_trait::async_trait;
use log::debug;

use crate::{error::Result, model::ModelInfo};

use super::{Protocol, printable};

/// Read size used for queries that do not specify their own
pub const DEFAULT_READ_SIZE: usize = 1024;

#[async_trait]
pub trait ScpiProtocol: Protocol + Send + Sync {
    /// Write one complete message. The transport supplies whatever message
    /// termination it needs, `data` is sent as-is.
    async fn int_send(&mut self, data: &[u8]) -> Result<()>;

    /// Read one response of at most `max_len` bytes
    async fn int_recv(&mut self, max_len: usize) -> Result<Vec<u8>>;
}
impl dyn ScpiProtocol {
    pub async fn send(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        debug!("send: {}", printable(data));
        self.int_send(data).await
    }

    pub async fn recv(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let resp = self.int_recv(max_len).await?;
        debug!("recv: {}", printable(&resp));
        Ok(resp)
    }

    pub async fn query(&mut self, data: impl AsRef<[u8]>, max_len: usize) -> Result<Vec<u8>> {
        self.send(data).await?;
        self.recv(max_len).await
    }

    pub async fn identify(&mut self) -> Result<String> {
        let res = self.query("*IDN?", DEFAULT_READ_SIZE).await?;

        Ok(String::from_utf8_lossy(&res).trim().into())
    }

    pub async fn idn_model(&mut self) -> Result<ModelInfo> {
        let idn = self.identify().await?;

        ModelInfo::from_idn(&idn)
    }
}
