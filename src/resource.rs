//! VISA-style resource addressing and the resource manager that turns a
//! resource string into an open session

use std::{collections::BTreeMap, fmt::Display, str::FromStr, time::Duration};

use async_trait::async_trait;
use log::{debug, info};

use crate::{
    error::{Error, Result},
    protocol::{
        GpibAdapter, ScpiPrologixProtocol, ScpiProtocol, ScpiTcpProtocol, ScpiVxi11Protocol,
        SessionOptions,
    },
};

/// VISA's default I/O timeout
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_millis(2000);

/// Environment variable prefix binding a GPIB board to an adapter,
/// `S46_GPIB0=serial:/dev/ttyUSB0`
pub const GPIB_BOARD_VAR: &str = "S46_GPIB";
/// Environment variable overriding the I/O timeout, in milliseconds
pub const IO_TIMEOUT_VAR: &str = "S46_IO_TIMEOUT_MS";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccessMode {
    /// Share the instrument with other sessions
    #[default]
    NoLock,
    /// Hold an exclusive lock for the lifetime of the session
    ExclusiveLock,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    /// `GPIB<board>::<address>[::INSTR]`
    Gpib { board: u32, address: u8 },
    /// `TCPIP[<board>]::<host>[::<device>]::INSTR`, served over VXI-11
    TcpipInstr {
        board: Option<u32>,
        host: String,
        device: Option<String>,
    },
    /// `TCPIP[<board>]::<host>::<port>::SOCKET`
    TcpipSocket {
        board: Option<u32>,
        host: String,
        port: u16,
    },
}
impl Resource {
    pub fn gpib(board: u32, address: u8) -> Self {
        Self::Gpib { board, address }
    }

    pub fn tcpip_instr(host: &str) -> Self {
        Self::TcpipInstr {
            board: None,
            host: host.to_string(),
            device: None,
        }
    }
}
impl FromStr for Resource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidArgument(format!("Resource `{s}`: {why}"));

        let parts: Vec<&str> = s.trim().split("::").collect();
        let interface = parts[0].to_ascii_uppercase();
        let instr = parts
            .last()
            .is_some_and(|p| p.eq_ignore_ascii_case("INSTR"));
        let socket = parts
            .last()
            .is_some_and(|p| p.eq_ignore_ascii_case("SOCKET"));

        if let Some(board) = interface.strip_prefix("GPIB") {
            let board = parse_board(board).map_err(|_| invalid("bad board number"))?;
            let address = match parts.as_slice() {
                [_, addr] | [_, addr, _] if parts.len() == 2 || instr => addr,
                _ => return Err(invalid("expected GPIB<board>::<address>[::INSTR]")),
            };
            let address: u8 = address
                .parse()
                .map_err(|_| invalid("bad primary address"))?;
            if address > crate::protocol::GPIB_MAX_ADDRESS {
                return Err(invalid("primary address outside 0..=30"));
            }

            Ok(Self::Gpib {
                board: board.unwrap_or(0),
                address,
            })
        } else if let Some(board) = interface.strip_prefix("TCPIP") {
            let board = parse_board(board).map_err(|_| invalid("bad board number"))?;
            match parts.as_slice() {
                [_, host, _] if instr => Ok(Self::TcpipInstr {
                    board,
                    host: host.to_string(),
                    device: None,
                }),
                [_, host, device, _] if instr => {
                    if !device.to_ascii_lowercase().starts_with("inst") {
                        return Err(Error::NotSupported(format!(
                            "Resource `{s}`: only VXI-11 devices are supported"
                        )));
                    }
                    Ok(Self::TcpipInstr {
                        board,
                        host: host.to_string(),
                        device: Some(device.to_string()),
                    })
                }
                [_, host, port, _] if socket => Ok(Self::TcpipSocket {
                    board,
                    host: host.to_string(),
                    port: port.parse().map_err(|_| invalid("bad port"))?,
                }),
                _ => Err(invalid(
                    "expected TCPIP::<host>::INSTR or TCPIP::<host>::<port>::SOCKET",
                )),
            }
        } else {
            Err(Error::NotSupported(format!(
                "Resource `{s}`: interface {} not supported",
                parts[0]
            )))
        }
    }
}
impl Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gpib { board, address } => write!(f, "GPIB{board}::{address}"),
            Self::TcpipInstr {
                board,
                host,
                device,
            } => {
                write_tcpip(f, *board)?;
                write!(f, "::{host}")?;
                if let Some(device) = device {
                    write!(f, "::{device}")?;
                }
                write!(f, "::INSTR")
            }
            Self::TcpipSocket { board, host, port } => {
                write_tcpip(f, *board)?;
                write!(f, "::{host}::{port}::SOCKET")
            }
        }
    }
}

fn write_tcpip(f: &mut std::fmt::Formatter<'_>, board: Option<u32>) -> std::fmt::Result {
    match board {
        Some(board) => write!(f, "TCPIP{board}"),
        None => write!(f, "TCPIP"),
    }
}

/// Board suffix of an interface name, empty means unspecified
fn parse_board(s: &str) -> std::result::Result<Option<u32>, std::num::ParseIntError> {
    if s.is_empty() {
        Ok(None)
    } else {
        s.parse().map(Some)
    }
}

/// Opens sessions to instruments by resource string
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Open and connect a session. `timeout` bounds connection setup and,
    /// with [`AccessMode::ExclusiveLock`], the wait for the lock.
    async fn open(
        &self,
        resource: &str,
        mode: AccessMode,
        timeout: Duration,
    ) -> Result<Box<dyn ScpiProtocol>>;
}

/// Resource manager backed by the transports in this crate
#[derive(Clone, Debug)]
pub struct DefaultRM {
    gpib_boards: BTreeMap<u32, GpibAdapter>,
    io_timeout: Duration,
}
impl Default for DefaultRM {
    fn default() -> Self {
        Self {
            gpib_boards: BTreeMap::new(),
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}
impl DefaultRM {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `GPIB<board>::...` resources through `adapter`
    pub fn bind_gpib(mut self, board: u32, adapter: GpibAdapter) -> Self {
        self.gpib_boards.insert(board, adapter);
        self
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn gpib_adapter(&self, board: u32) -> Option<&GpibAdapter> {
        self.gpib_boards.get(&board)
    }

    /// Configure from the process environment, see [`DefaultRM::from_vars`]
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Configure from `S46_GPIB<n>=<adapter uri>` and
    /// `S46_IO_TIMEOUT_MS=<ms>` pairs, other variables are ignored
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut rm = Self::default();

        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());

            if key == IO_TIMEOUT_VAR {
                let ms: u64 = value.parse().map_err(|e| {
                    Error::InvalidArgument(format!("{IO_TIMEOUT_VAR}=`{value}`: {e}"))
                })?;
                if ms == 0 {
                    return Err(Error::InvalidArgument(format!(
                        "{IO_TIMEOUT_VAR} must be non-zero"
                    )));
                }
                rm.io_timeout = Duration::from_millis(ms);
            } else if let Some(board) = key.strip_prefix(GPIB_BOARD_VAR) {
                let Ok(board) = board.parse() else {
                    continue;
                };
                let adapter: GpibAdapter = value.parse()?;
                debug!("GPIB{board} bound to {adapter}");
                rm.gpib_boards.insert(board, adapter);
            }
        }

        Ok(rm)
    }

    /// Build the unconnected session for a resource
    pub fn session(
        &self,
        resource: &Resource,
        options: SessionOptions,
    ) -> Result<Box<dyn ScpiProtocol>> {
        /* Only VXI-11 links can hold a device lock */
        if options.access_mode == AccessMode::ExclusiveLock
            && !matches!(resource, Resource::TcpipInstr { .. })
        {
            return Err(Error::NotSupported(format!(
                "{resource} cannot be opened with an exclusive lock"
            )));
        }

        Ok(match resource {
            Resource::Gpib { board, address } => {
                let Some(adapter) = self.gpib_boards.get(board) else {
                    return Err(Error::InvalidArgument(format!(
                        "No adapter bound to GPIB{board}, set {GPIB_BOARD_VAR}{board}"
                    )));
                };
                Box::new(ScpiPrologixProtocol::new(
                    adapter.clone(),
                    *address,
                    options,
                )?)
            }
            Resource::TcpipInstr { host, device, .. } => Box::new(ScpiVxi11Protocol::new(
                host,
                device.as_deref(),
                options,
            )),
            Resource::TcpipSocket { host, port, .. } => {
                Box::new(ScpiTcpProtocol::new(host, *port, options))
            }
        })
    }
}
#[async_trait]
impl ResourceManager for DefaultRM {
    async fn open(
        &self,
        resource: &str,
        mode: AccessMode,
        timeout: Duration,
    ) -> Result<Box<dyn ScpiProtocol>> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument("Open timeout must be non-zero".into()));
        }
        if self.io_timeout.is_zero() {
            return Err(Error::InvalidArgument("I/O timeout must be non-zero".into()));
        }

        let parsed: Resource = resource.parse()?;
        let options = SessionOptions {
            access_mode: mode,
            open_timeout: timeout,
            io_timeout: self.io_timeout,
        };

        let mut session = self.session(&parsed, options)?;
        session.connect().await?;
        info!(resource:% = parsed, mode:? = mode; "session opened");

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpib_resources() {
        assert_eq!(
            "GPIB0::14".parse::<Resource>().unwrap(),
            Resource::gpib(0, 14)
        );
        assert_eq!(
            "gpib2::7::INSTR".parse::<Resource>().unwrap(),
            Resource::gpib(2, 7)
        );
        assert_eq!(
            "GPIB::3".parse::<Resource>().unwrap(),
            Resource::gpib(0, 3)
        );
        assert_eq!(Resource::gpib(0, 14).to_string(), "GPIB0::14");

        assert!(matches!(
            "GPIB0::31".parse::<Resource>(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            "GPIB0::14::96::INSTR".parse::<Resource>(),
            Err(Error::InvalidArgument(_))
        ));
        assert!("GPIBx::14".parse::<Resource>().is_err());
    }

    #[test]
    fn tcpip_resources() {
        assert_eq!(
            "TCPIP::192.168.1.5::INSTR".parse::<Resource>().unwrap(),
            Resource::tcpip_instr("192.168.1.5")
        );
        assert_eq!(
            Resource::tcpip_instr("192.168.1.5").to_string(),
            "TCPIP::192.168.1.5::INSTR"
        );
        assert_eq!(
            "TCPIP0::switch.lab::5025::SOCKET"
                .parse::<Resource>()
                .unwrap(),
            Resource::TcpipSocket {
                board: Some(0),
                host: "switch.lab".into(),
                port: 5025
            }
        );
        assert!(matches!(
            "TCPIP::10.0.0.2::hislip0::INSTR".parse::<Resource>(),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            "ASRL1::INSTR".parse::<Resource>(),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn resources_round_trip() {
        for name in [
            "GPIB1::22",
            "TCPIP::10.1.2.3::INSTR",
            "TCPIP1::10.1.2.3::inst1::INSTR",
            "TCPIP::10.1.2.3::5025::SOCKET",
        ] {
            let parsed: Resource = name.parse().unwrap();
            assert_eq!(parsed.to_string(), name);
        }
    }

    #[test]
    fn config_from_vars() {
        let rm = DefaultRM::from_vars([
            ("S46_GPIB0", "serial:/dev/ttyUSB0"),
            ("S46_GPIB3", "tcp://gpib-eth:1234"),
            ("S46_IO_TIMEOUT_MS", "750"),
            ("S46_GPIB_NOTES", "ignored"),
            ("PATH", "/usr/bin"),
        ])
        .unwrap();

        assert_eq!(rm.io_timeout(), Duration::from_millis(750));
        assert_eq!(
            rm.gpib_adapter(0),
            Some(&GpibAdapter::Serial {
                port: "/dev/ttyUSB0".into(),
                baud: 115200
            })
        );
        assert_eq!(
            rm.gpib_adapter(3),
            Some(&GpibAdapter::Tcp {
                host: "gpib-eth".into(),
                port: 1234
            })
        );
        assert!(rm.gpib_adapter(1).is_none());

        assert!(DefaultRM::from_vars([("S46_IO_TIMEOUT_MS", "soon")]).is_err());
        assert!(DefaultRM::from_vars([("S46_GPIB0", "usb:0")]).is_err());
    }

    #[tokio::test]
    async fn unbound_gpib_board() {
        let rm = DefaultRM::new();
        let res = rm
            .open("GPIB4::14", AccessMode::NoLock, Duration::from_secs(1))
            .await;
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn zero_io_timeout_rejected() {
        assert!(matches!(
            DefaultRM::from_vars([("S46_IO_TIMEOUT_MS", "0")]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn zero_io_timeout_from_builder() {
        let rm = DefaultRM::new().with_io_timeout(Duration::ZERO);
        let res = rm
            .open("TCPIP::127.0.0.1::INSTR", AccessMode::NoLock, Duration::from_secs(1))
            .await;
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn exclusive_lock_needs_vxi11() {
        let rm = DefaultRM::new().bind_gpib(
            0,
            GpibAdapter::Tcp {
                host: "127.0.0.1".into(),
                port: 1,
            },
        );

        for resource in ["GPIB0::14", "TCPIP::127.0.0.1::5025::SOCKET"] {
            let res = rm
                .open(resource, AccessMode::ExclusiveLock, Duration::from_secs(1))
                .await;
            assert!(
                matches!(res, Err(Error::NotSupported(_))),
                "{resource} accepted a lock"
            );
        }
    }

    #[tokio::test]
    async fn zero_open_timeout() {
        let rm = DefaultRM::new();
        let res = rm
            .open("TCPIP::127.0.0.1::INSTR", AccessMode::NoLock, Duration::ZERO)
            .await;
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
    }
}
