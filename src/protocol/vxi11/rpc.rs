//! RPC methods defined by VXI-11

use std::fmt::Display;

use strum_macros::FromRepr;

use super::xdr::{XdrPack, XdrReader};

use crate::error::{Error, Result};

pub const DEVICE_CORE_PROG: u32 = 395183;
pub const DEVICE_CORE_VERS: u32 = 1;

#[allow(unused)]
#[derive(Clone, Copy, Debug)]
#[repr(u32)]
pub enum CoreProc {
    DeviceAbort = 1,
    CreateLink = 10,
    DeviceWrite = 11,
    DeviceRead = 12,
    DeviceReadStb = 13,
    DeviceTrigger = 14,
    DeviceClear = 15,
    DeviceRemote = 16,
    DeviceLocal = 17,
    DeviceLock = 18,
    DeviceUnlock = 19,
    DeviceEnableSrq = 20,
    DeviceDoCmd = 22,
    DestroyLink = 23,
    CreateIntrChan = 25,
    DestroyIntrChan = 26,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum DeviceErrorCode {
    NoError = 0,
    SyntaxError = 1,
    DeviceNotAccessible = 3,
    InvalidLinkIdentifier = 4,
    ParameterError = 5,
    ChannelNotEstablished = 6,
    OperationNotSupported = 8,
    OutOfResources = 9,
    DeviceLockedByAnotherLink = 11,
    NoLockHeldByThisLink = 12,
    IoTimeout = 15,
    IoError = 17,
    InvalidAddress = 21,
    Abort = 23,
    ChannelAlreadyEstablished = 29,
}
impl Display for DeviceErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, *self as u32)
    }
}

/// Read the leading error word of a response, failing on anything other
/// than `NoError`
fn check_error(reader: &mut XdrReader<'_>, what: &str) -> Result<()> {
    let code = reader.u32()?;
    match DeviceErrorCode::from_repr(code) {
        Some(DeviceErrorCode::NoError) => Ok(()),
        Some(DeviceErrorCode::IoTimeout) => Err(Error::Timeout(format!("{what}: device I/O"))),
        Some(DeviceErrorCode::DeviceLockedByAnotherLink) => Err(Error::Timeout(format!(
            "{what}: device locked by another link"
        ))),
        Some(err) => Err(Error::Unspecified(format!("{what} failed: {err}"))),
        None => Err(Error::BadResponse(format!(
            "{what} failed with unknown error {code}"
        ))),
    }
}

#[derive(Debug, Default)]
pub struct OperationFlags {
    /// Wait for lock even if lock timeout elapses
    pub wait_lock: bool,
    /// On write, send last byte with END indicator
    pub end: bool,
    /// On read, use termchr as termination character
    pub termchr_set: bool,
}
impl XdrPack for OperationFlags {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        let mut flags = 0u32;
        if self.wait_lock {
            flags |= 1 << 0;
        }
        if self.end {
            flags |= 1 << 3;
        }
        if self.termchr_set {
            flags |= 1 << 7;
        }
        flags.pack_xdr(out);
    }
}

#[derive(Debug)]
pub struct CreateLinkParms<'a> {
    pub client_id: i32,
    pub lock_device: bool,
    /// Milliseconds to wait for a lock held elsewhere
    pub lock_timeout: u32,
    /// Device name, `inst0` for the instrument itself
    pub device: &'a str,
}
impl XdrPack for CreateLinkParms<'_> {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.client_id.pack_xdr(out);
        self.lock_device.pack_xdr(out);
        self.lock_timeout.pack_xdr(out);
        self.device.pack_xdr(out);
    }
}

#[allow(unused)]
#[derive(Debug)]
pub struct CreateLinkResp {
    pub lid: i32,
    pub abort_port: u16,
    /// Largest chunk the device accepts per write
    pub max_recv_size: u32,
}
impl CreateLinkResp {
    pub fn unpack(src: &[u8]) -> Result<Self> {
        let mut reader = XdrReader::new(src);
        check_error(&mut reader, "create_link")?;
        Ok(Self {
            lid: reader.i32()?,
            abort_port: reader.u32()? as u16,
            max_recv_size: reader.u32()?,
        })
    }
}

#[derive(Debug)]
pub struct DeviceWriteParms<'a> {
    pub lid: i32,
    pub io_timeout: u32,
    pub lock_timeout: u32,
    pub flags: OperationFlags,
    pub data: &'a [u8],
}
impl XdrPack for DeviceWriteParms<'_> {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.lid.pack_xdr(out);
        self.io_timeout.pack_xdr(out);
        self.lock_timeout.pack_xdr(out);
        self.flags.pack_xdr(out);
        self.data.pack_xdr(out);
    }
}

/// Returns the number of bytes the device accepted
pub fn unpack_write_resp(src: &[u8]) -> Result<u32> {
    let mut reader = XdrReader::new(src);
    check_error(&mut reader, "device_write")?;
    reader.u32()
}

#[derive(Debug)]
pub struct DeviceReadParms {
    pub lid: i32,
    pub request_size: u32,
    pub io_timeout: u32,
    pub lock_timeout: u32,
    pub flags: OperationFlags,
    pub termchr: u8,
}
impl XdrPack for DeviceReadParms {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.lid.pack_xdr(out);
        self.request_size.pack_xdr(out);
        self.io_timeout.pack_xdr(out);
        self.lock_timeout.pack_xdr(out);
        self.flags.pack_xdr(out);
        (self.termchr as u32).pack_xdr(out);
    }
}

#[derive(Debug)]
pub struct DeviceReadResp {
    /// Read ended on an END indicator or the termination character
    pub complete: bool,
    pub data: Vec<u8>,
}
impl DeviceReadResp {
    const REASON_CHR: u32 = 1 << 1;
    const REASON_END: u32 = 1 << 2;

    pub fn unpack(src: &[u8]) -> Result<Self> {
        let mut reader = XdrReader::new(src);
        check_error(&mut reader, "device_read")?;
        let reason = reader.u32()?;
        Ok(Self {
            complete: reason & (Self::REASON_CHR | Self::REASON_END) != 0,
            data: reader.opaque()?.to_vec(),
        })
    }
}

/// Returns `Ok` if the generic error response carries no error
pub fn unpack_error_resp(src: &[u8], what: &str) -> Result<()> {
    check_error(&mut XdrReader::new(src), what)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_parms_layout() {
        let mut out = vec![];
        DeviceWriteParms {
            lid: 3,
            io_timeout: 2000,
            lock_timeout: 0,
            flags: OperationFlags {
                end: true,
                ..Default::default()
            },
            data: b"*RST",
        }
        .pack_xdr(&mut out);

        let mut reader = XdrReader::new(&out);
        assert_eq!(reader.i32().unwrap(), 3);
        assert_eq!(reader.u32().unwrap(), 2000);
        assert_eq!(reader.u32().unwrap(), 0);
        assert_eq!(reader.u32().unwrap(), 1 << 3);
        assert_eq!(reader.opaque().unwrap(), b"*RST");
    }

    #[test]
    fn read_resp_end_flag() {
        let mut out = vec![];
        0u32.pack_xdr(&mut out);
        4u32.pack_xdr(&mut out);
        b"(@1)\n".as_slice().pack_xdr(&mut out);

        let resp = DeviceReadResp::unpack(&out).unwrap();
        assert!(resp.complete);
        assert_eq!(resp.data, b"(@1)\n");
    }

    #[test]
    fn device_errors_map_to_kinds() {
        let mut out = vec![];
        15u32.pack_xdr(&mut out);
        assert!(matches!(
            unpack_write_resp(&out),
            Err(Error::Timeout(_))
        ));

        let mut out = vec![];
        4u32.pack_xdr(&mut out);
        assert!(matches!(
            unpack_error_resp(&out, "destroy_link"),
            Err(Error::Unspecified(_))
        ));
    }
}
