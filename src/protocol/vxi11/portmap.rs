//! Portmap client, RFC1833

use std::{net::SocketAddr, time::Duration};

use crate::error::{Error, Result};

use super::{
    onc::OncClient,
    xdr::{XdrPack, XdrReader},
};

const PORTMAP_PROG: u32 = 100000;
const PORTMAP_VERS: u32 = 2;
const PMAPPROC_GETPORT: u32 = 3;

pub const PORTMAP_PORT: u16 = 111;

#[allow(unused)]
#[derive(Clone, Copy, Debug)]
#[repr(u32)]
pub enum RpcIpProto {
    Tcp = 6,
    Udp = 17,
}

#[derive(Debug)]
struct Mapping {
    prog: u32,
    vers: u32,
    prot: RpcIpProto,
    /// Ignored by GETPORT
    port: u32,
}
impl XdrPack for Mapping {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.prog.pack_xdr(out);
        self.vers.pack_xdr(out);
        (self.prot as u32).pack_xdr(out);
        self.port.pack_xdr(out);
    }
}

/// Ask the portmapper at `socket` which port serves a program
pub async fn request_port(
    socket: SocketAddr,
    prog: u32,
    vers: u32,
    prot: RpcIpProto,
    timeout: Duration,
) -> Result<u16> {
    let mut client = OncClient::connect(socket, timeout, timeout).await?;

    let mapping = Mapping {
        prog,
        vers,
        prot,
        port: 0,
    };
    let results = client
        .call(PORTMAP_PROG, PORTMAP_VERS, PMAPPROC_GETPORT, mapping)
        .await?;

    let port = XdrReader::new(&results).u32()?;
    match port {
        0 => Err(Error::NotSupported(format!(
            "Program {prog} version {vers} not registered at {socket}"
        ))),
        port => u16::try_from(port).map_err(|_| {
            Error::BadResponse(format!("Port {port} does not represent a 16-bit value"))
        }),
    }
}
