//! Open Network Computing (ONC) RPC client, RFC5531, over TCP with record
//! marking

use std::{net::SocketAddr, time::Duration};

use log::debug;
use strum_macros::FromRepr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::error::{Error, Result};

use super::xdr::{XdrPack, XdrReader};

pub const RPC_VERSION: u32 = 2;

/// Set in a record marking header on the final fragment of a record
const LAST_FRAGMENT: u32 = 0x8000_0000;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;

const REPLY_ACCEPTED: u32 = 0;
const REPLY_DENIED: u32 = 1;

const AUTH_NONE: u32 = 0;

#[derive(Debug, FromRepr)]
#[repr(u32)]
enum AcceptStat {
    Success = 0,
    ProgUnavail = 1,
    ProgMismatch = 2,
    ProcUnavail = 3,
    GarbageArgs = 4,
    SystemErr = 5,
}

#[derive(Debug, FromRepr)]
#[repr(u32)]
enum RejectStat {
    RpcMismatch = 0,
    AuthError = 1,
}

pub struct OncClient {
    /// Dropped once a call fails partway, the record framing of whatever
    /// follows can no longer be trusted
    stream: Option<TcpStream>,
    xid: u32,
    /// Bound on waiting for each reply
    call_timeout: Duration,
}
impl OncClient {
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self> {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "Connecting to {addr} for {} ms",
                    connect_timeout.as_millis()
                )));
            }
            Ok(res) => res.map_err(|e| Error::Unhandled(e.into()))?,
        };
        stream.set_nodelay(true)?;

        Ok(Self {
            stream: Some(stream),
            xid: 0,
            call_timeout,
        })
    }

    /// Perform a call, returning the XDR encoded results of a successful
    /// reply
    pub async fn call(
        &mut self,
        prog: u32,
        vers: u32,
        proc: u32,
        args: impl XdrPack,
    ) -> Result<Vec<u8>> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotConnected);
        };

        self.xid = self.xid.wrapping_add(1);
        let xid = self.xid;

        /* Header placeholder, filled in once the length is known */
        let mut record = vec![0; 4];
        xid.pack_xdr(&mut record);
        MSG_CALL.pack_xdr(&mut record);
        RPC_VERSION.pack_xdr(&mut record);
        prog.pack_xdr(&mut record);
        vers.pack_xdr(&mut record);
        proc.pack_xdr(&mut record);
        /* Credentials and verifier, both AUTH_NONE */
        for _ in 0..2 {
            AUTH_NONE.pack_xdr(&mut record);
            0u32.pack_xdr(&mut record);
        }
        args.pack_xdr(&mut record);

        let header = (record.len() - 4) as u32 | LAST_FRAGMENT;
        record[..4].copy_from_slice(&header.to_be_bytes());

        let timeout = self.call_timeout;
        let exchange = async {
            stream.write_all(&record).await?;
            read_reply_record(stream, xid).await
        };
        let reply = match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Err(Error::Timeout(format!(
                "No RPC reply to procedure {proc} within {} ms",
                timeout.as_millis()
            ))),
            Ok(res) => res,
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                debug!("dropping RPC connection after failed call: {e}");
                self.stream = None;
                return Err(e);
            }
        };

        /* Past the xid, which read_reply_record already matched */
        parse_reply(XdrReader::new(&reply[4..]))
    }
}

/// Read records until one answers `xid`
async fn read_reply_record(stream: &mut TcpStream, xid: u32) -> Result<Vec<u8>> {
    loop {
        let record = read_record(stream).await?;
        let reply_xid = XdrReader::new(&record).u32()?;
        if reply_xid == xid {
            return Ok(record);
        }
        debug!("discarding reply with stale xid {reply_xid}, expected {xid}");
    }
}

/// Read fragments until the last one of a record
async fn read_record(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut record = vec![];
    loop {
        let header = stream.read_u32().await?;
        let len = (header & !LAST_FRAGMENT) as usize;

        let start = record.len();
        record.resize(start + len, 0);
        stream.read_exact(&mut record[start..]).await?;

        if header & LAST_FRAGMENT != 0 {
            return Ok(record);
        }
    }
}

/// Interpret a reply body following the xid
fn parse_reply(mut reader: XdrReader<'_>) -> Result<Vec<u8>> {
    let mtype = reader.u32()?;
    if mtype != MSG_REPLY {
        return Err(Error::BadResponse(format!(
            "Expected RPC reply, got message type {mtype}"
        )));
    }

    match reader.u32()? {
        REPLY_ACCEPTED => {
            /* Verifier, contents unused with AUTH_NONE */
            reader.u32()?;
            reader.opaque()?;

            let stat = reader.u32()?;
            match AcceptStat::from_repr(stat) {
                Some(AcceptStat::Success) => Ok(reader.rest().to_vec()),
                Some(AcceptStat::ProgMismatch) => {
                    let low = reader.u32()?;
                    let high = reader.u32()?;
                    Err(Error::NotSupported(format!(
                        "RPC program version mismatch, server supports {low}..={high}"
                    )))
                }
                Some(stat) => Err(Error::Unspecified(format!("RPC call failed: {stat:?}"))),
                None => Err(Error::BadResponse(format!("Unknown accept status {stat}"))),
            }
        }
        REPLY_DENIED => {
            let stat = reader.u32()?;
            match RejectStat::from_repr(stat) {
                Some(RejectStat::RpcMismatch) => Err(Error::NotSupported(
                    "RPC version mismatch".into(),
                )),
                Some(RejectStat::AuthError) => Err(Error::Unspecified(format!(
                    "RPC authentication rejected, status {}",
                    reader.u32()?
                ))),
                None => Err(Error::BadResponse(format!("Unknown reject status {stat}"))),
            }
        }
        stat => Err(Error::BadResponse(format!("Unknown reply status {stat}"))),
    }
}
