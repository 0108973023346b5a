//! VXI-11 protocol, referencing VXI-11 1.0 specification

use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use log::{debug, warn};

use crate::{
    error::{Error, Result},
    model::ModelInfo,
    resource::AccessMode,
};

use self::{
    onc::OncClient,
    portmap::RpcIpProto,
    rpc::{CoreProc, DEVICE_CORE_PROG, DEVICE_CORE_VERS, OperationFlags},
    xdr::XdrPack,
};

use super::{Protocol, ScpiProtocol, SessionOptions};

mod onc;
pub mod portmap;
mod rpc;
mod xdr;

/// Client ID to use, seems arbitrary?
const CLIENT_ID: i32 = 1;
/// Device name of the instrument behind a VXI-11 server
pub const DEFAULT_DEVICE: &str = "inst0";
/// Max amount to read in a single transaction
const READ_SIZE: u32 = 65536;
/// Allowance on top of the device I/O timeout for the RPC round trip
const RPC_SLACK: Duration = Duration::from_secs(1);

/// SCPI over VXI-11, the protocol behind `TCPIP::<host>::INSTR`
pub struct ScpiVxi11Protocol {
    host: String,
    device: String,
    options: SessionOptions,
    link: Option<CoreLink>,
}
impl ScpiVxi11Protocol {
    pub fn new(host: &str, device: Option<&str>, options: SessionOptions) -> Self {
        Self {
            host: host.to_string(),
            device: device.unwrap_or(DEFAULT_DEVICE).to_string(),
            options,
            link: None,
        }
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), portmap::PORTMAP_PORT))
            .await
            .map_err(|e| Error::Unhandled(e.into()))?;

        addrs
            .next()
            .ok_or_else(|| Error::Unspecified(format!("Could not resolve '{}'", self.host)))
    }
}
#[async_trait]
impl Protocol for ScpiVxi11Protocol {
    async fn connect(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Err(Error::Unspecified("Already connected".into()));
        }

        let mut socket = self.resolve().await?;
        let port = portmap::request_port(
            socket,
            DEVICE_CORE_PROG,
            DEVICE_CORE_VERS,
            RpcIpProto::Tcp,
            self.options.open_timeout,
        )
        .await?;
        debug!("VXI-11 core channel of {} on port {port}", self.host);
        socket.set_port(port);

        let onc = OncClient::connect(
            socket,
            self.options.open_timeout,
            self.options.open_timeout.max(self.options.io_timeout) + RPC_SLACK,
        )
        .await?;

        self.link = Some(CoreLink::create(onc, &self.device, &self.options).await?);

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        match self.link.take() {
            Some(link) => link.destroy().await,
            None => Ok(()),
        }
    }

    async fn model(&mut self) -> Result<ModelInfo> {
        (self as &mut dyn ScpiProtocol).idn_model().await
    }
}
#[async_trait]
impl ScpiProtocol for ScpiVxi11Protocol {
    async fn int_send(&mut self, data: &[u8]) -> Result<()> {
        let Some(link) = &mut self.link else {
            return Err(Error::NotConnected);
        };

        link.write(data).await
    }

    async fn int_recv(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let Some(link) = &mut self.link else {
            return Err(Error::NotConnected);
        };

        link.read(max_len).await
    }
}

/// An established link on the core channel
struct CoreLink {
    onc: OncClient,
    lid: i32,
    max_recv_size: u32,
    io_timeout: u32,
}
impl CoreLink {
    async fn create(mut onc: OncClient, device: &str, options: &SessionOptions) -> Result<Self> {
        let parms = rpc::CreateLinkParms {
            client_id: CLIENT_ID,
            lock_device: options.access_mode == AccessMode::ExclusiveLock,
            lock_timeout: millis(options.open_timeout),
            device,
        };
        let resp = call(&mut onc, CoreProc::CreateLink, parms).await?;
        let resp = rpc::CreateLinkResp::unpack(&resp)?;

        debug!(
            "created link {} to {device}, max_recv_size {}",
            resp.lid, resp.max_recv_size
        );

        Ok(Self {
            onc,
            lid: resp.lid,
            /* A device reporting zero would stall the chunking below */
            max_recv_size: resp.max_recv_size.max(1),
            io_timeout: millis(options.io_timeout),
        })
    }

    /// Write data via the link, splitting it up into multiple writes if the
    /// size exceeds the maximum reported chunk size. END is sent with the
    /// last chunk only.
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let chunk_size = self.max_recv_size as usize;
        let mut remaining = data;

        loop {
            let (chunk, rest) = remaining.split_at(remaining.len().min(chunk_size));
            let parms = rpc::DeviceWriteParms {
                lid: self.lid,
                io_timeout: self.io_timeout,
                lock_timeout: 0,
                flags: OperationFlags {
                    end: rest.is_empty(),
                    ..Default::default()
                },
                data: chunk,
            };

            let resp = call(&mut self.onc, CoreProc::DeviceWrite, parms).await?;
            let written = (rpc::unpack_write_resp(&resp)? as usize).min(chunk.len());

            /* Anything the device did not take is offered again */
            remaining = &remaining[written..];
            if remaining.is_empty() {
                return Ok(());
            }
            if written == 0 {
                return Err(Error::Unspecified("Device accepted no data".into()));
            }
        }
    }

    /// Read until the device signals END or `max_len` bytes are collected
    async fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let mut result = vec![];

        while result.len() < max_len {
            let request_size = (max_len - result.len()).min(READ_SIZE as usize) as u32;
            let parms = rpc::DeviceReadParms {
                lid: self.lid,
                request_size,
                io_timeout: self.io_timeout,
                lock_timeout: 0,
                flags: OperationFlags::default(),
                termchr: 0,
            };

            let resp = call(&mut self.onc, CoreProc::DeviceRead, parms).await?;
            let mut resp = rpc::DeviceReadResp::unpack(&resp)?;
            result.append(&mut resp.data);
            if resp.complete {
                break;
            }
        }

        result.truncate(max_len);
        Ok(result)
    }

    async fn destroy(mut self) -> Result<()> {
        let resp = call(&mut self.onc, CoreProc::DestroyLink, self.lid).await;
        match resp.and_then(|resp| rpc::unpack_error_resp(&resp, "destroy_link")) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("destroy_link for link {} failed: {e}", self.lid);
                Err(e)
            }
        }
    }
}

async fn call(onc: &mut OncClient, proc: CoreProc, parms: impl XdrPack + Send) -> Result<Vec<u8>> {
    onc.call(DEVICE_CORE_PROG, DEVICE_CORE_VERS, proc as u32, parms)
        .await
}

fn millis(d: Duration) -> u32 {
    d.as_millis().try_into().unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::{xdr::XdrReader, *};

    fn options(access_mode: AccessMode) -> SessionOptions {
        SessionOptions {
            access_mode,
            open_timeout: Duration::from_millis(1000),
            io_timeout: Duration::from_millis(2000),
        }
    }

    fn words(ws: &[u32]) -> Vec<u8> {
        let mut out = vec![];
        for &w in ws {
            w.pack_xdr(&mut out);
        }
        out
    }

    /// Minimal core channel server, answers each call with the next of
    /// `results` and returns the procedure number and arguments of every
    /// call it saw
    async fn fake_core(listener: TcpListener, results: Vec<Vec<u8>>) -> Vec<(u32, Vec<u8>)> {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut calls = vec![];

        for result in results {
            let header = sock.read_u32().await.unwrap();
            let mut body = vec![0; (header & 0x7fff_ffff) as usize];
            sock.read_exact(&mut body).await.unwrap();

            let mut reader = XdrReader::new(&body);
            let xid = reader.u32().unwrap();
            /* message type, RPC version, program, version */
            for _ in 0..4 {
                reader.u32().unwrap();
            }
            let proc = reader.u32().unwrap();
            for _ in 0..2 {
                reader.u32().unwrap();
                reader.opaque().unwrap();
            }
            calls.push((proc, reader.rest().to_vec()));

            /* accepted, null verifier, success */
            let mut reply = words(&[xid, 1, 0, 0, 0, 0]);
            reply.extend(result);
            let mut record = ((reply.len() as u32) | 0x8000_0000).to_be_bytes().to_vec();
            record.extend(reply);
            sock.write_all(&record).await.unwrap();
        }

        calls
    }

    #[tokio::test]
    async fn link_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut read_result = words(&[0, 1 << 2]);
        b"(@)\n".as_slice().pack_xdr(&mut read_result);

        let server = tokio::spawn(fake_core(
            listener,
            vec![
                /* no error, lid 7, abort port 0, max_recv_size 4 */
                words(&[0, 7, 0, 4]),
                words(&[0, 4]),
                words(&[0, 2]),
                read_result,
                words(&[0]),
            ],
        ));

        let opts = options(AccessMode::ExclusiveLock);
        let onc = OncClient::connect(addr, opts.open_timeout, opts.io_timeout)
            .await
            .unwrap();
        let mut link = CoreLink::create(onc, DEFAULT_DEVICE, &opts).await.unwrap();
        link.write(b"CLOSE?").await.unwrap();
        assert_eq!(link.read(100).await.unwrap(), b"(@)\n");
        link.destroy().await.unwrap();

        let calls = server.await.unwrap();
        let procs: Vec<u32> = calls.iter().map(|(proc, _)| *proc).collect();
        assert_eq!(procs, vec![10, 11, 11, 12, 23]);

        let mut create = XdrReader::new(&calls[0].1);
        assert_eq!(create.i32().unwrap(), CLIENT_ID);
        /* lock_device */
        assert_eq!(create.u32().unwrap(), 1);
        assert_eq!(create.u32().unwrap(), 1000);
        assert_eq!(create.opaque().unwrap(), b"inst0");

        /* Split at max_recv_size, END only on the final chunk */
        for (call, data, flags) in [(&calls[1], &b"CLOS"[..], 0), (&calls[2], &b"E?"[..], 1 << 3)] {
            let mut write = XdrReader::new(&call.1);
            assert_eq!(write.i32().unwrap(), 7);
            assert_eq!(write.u32().unwrap(), 2000);
            write.u32().unwrap();
            assert_eq!(write.u32().unwrap(), flags);
            assert_eq!(write.opaque().unwrap(), data);
        }

        let mut read = XdrReader::new(&calls[3].1);
        assert_eq!(read.i32().unwrap(), 7);
        assert_eq!(read.u32().unwrap(), 100);

        let mut destroy = XdrReader::new(&calls[4].1);
        assert_eq!(destroy.i32().unwrap(), 7);
    }

    #[tokio::test]
    async fn send_before_connect() {
        let mut proto = ScpiVxi11Protocol::new("127.0.0.1", None, options(AccessMode::NoLock));
        assert!(matches!(
            proto.int_send(b"*RST").await,
            Err(Error::NotConnected)
        ));
        assert!(proto.disconnect().await.is_ok());
    }
}
