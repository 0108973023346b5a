use std::time::Duration;

use log::{info, warn};
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    equipment::rf_switch::{Channel, GroupSafety, Relay, RfSwitchEquipment},
    error::{Error, Result},
    model::ModelInfo,
    protocol::ScpiProtocol,
    resource::{AccessMode, ResourceManager},
};

/// Largest `CLOSE?` response read back
pub const QUERY_READ_SIZE: usize = 100;

/// Environment variable selecting the [`GroupSafety`] policy
pub const GROUP_SAFETY_VAR: &str = "S46_GROUP_SAFETY";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct S46Config {
    pub group_safety: GroupSafety,
}
impl S46Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Read `S46_GROUP_SAFETY=best-effort|strict`, other variables are
    /// ignored
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();

        for (key, value) in vars {
            if key.as_ref() == GROUP_SAFETY_VAR {
                let value = value.as_ref();
                config.group_safety = value.parse().map_err(|_| {
                    Error::InvalidArgument(format!(
                        "{GROUP_SAFETY_VAR}=`{value}`, expected best-effort or strict"
                    ))
                })?;
            }
        }

        Ok(config)
    }
}

enum SessionState {
    Disconnected,
    Connected(Mutex<Box<dyn ScpiProtocol>>),
}

/// Keithley S46 RF switch
pub struct KeithleyS46 {
    state: SessionState,
    config: S46Config,
}
impl Default for KeithleyS46 {
    fn default() -> Self {
        Self::new()
    }
}
impl KeithleyS46 {
    pub fn new() -> Self {
        Self::with_config(S46Config::default())
    }

    pub fn with_config(config: S46Config) -> Self {
        Self {
            state: SessionState::Disconnected,
            config,
        }
    }

    /// Wrap an already connected session
    pub fn from_session(proto: Box<dyn ScpiProtocol>, config: S46Config) -> Self {
        Self {
            state: SessionState::Connected(Mutex::new(proto)),
            config,
        }
    }

    pub fn config(&self) -> S46Config {
        self.config
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected(_))
    }

    /// Open `GPIB<board>::<address>`
    pub async fn open_gpib(
        &mut self,
        rm: &dyn ResourceManager,
        board: u32,
        address: u32,
        mode: AccessMode,
        timeout: Duration,
    ) -> Result<()> {
        self.open_resource(rm, &format!("GPIB{board}::{address}"), mode, timeout)
            .await
    }

    /// Open `TCPIP::<ip>::INSTR`
    pub async fn open_tcp(
        &mut self,
        rm: &dyn ResourceManager,
        ip: &str,
        mode: AccessMode,
        timeout: Duration,
    ) -> Result<()> {
        self.open_resource(rm, &format!("TCPIP::{ip}::INSTR"), mode, timeout)
            .await
    }

    pub async fn open_resource(
        &mut self,
        rm: &dyn ResourceManager,
        resource: &str,
        mode: AccessMode,
        timeout: Duration,
    ) -> Result<()> {
        if self.is_connected() {
            return Err(Error::Unspecified("Already connected".into()));
        }

        let proto = rm.open(resource, mode, timeout).await?;
        self.state = SessionState::Connected(Mutex::new(proto));
        info!("S46 at {resource} connected");

        Ok(())
    }

    /// Release the session. Closing an unconnected switch does nothing.
    pub async fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, SessionState::Disconnected) {
            SessionState::Disconnected => Ok(()),
            SessionState::Connected(proto) => proto.into_inner().disconnect().await,
        }
    }

    async fn session(&self) -> Result<MutexGuard<'_, Box<dyn ScpiProtocol>>> {
        match &self.state {
            SessionState::Connected(proto) => Ok(proto.lock().await),
            SessionState::Disconnected => Err(Error::NotConnected),
        }
    }

    async fn send(&self, cmd: impl AsRef<[u8]> + Send) -> Result<()> {
        self.session().await?.send(cmd).await
    }
}

fn open_cmd(channel: Channel) -> String {
    format!("OPEN (@{channel})")
}

#[async_trait::async_trait]
impl RfSwitchEquipment for KeithleyS46 {
    async fn reset(&self) -> Result<()> {
        self.send("*RST").await
    }

    async fn open_channel(&self, channel: u32) -> Result<()> {
        let channel = Channel::new(channel)?;
        self.send(open_cmd(channel)).await
    }

    async fn open_all_channels(&self) -> Result<()> {
        self.send("OPEN:ALL").await
    }

    async fn close_channel(&self, channel: u32) -> Result<()> {
        let channel = Channel::new(channel)?;
        /* Held until the close is sent, so no other command lands between
         * opening the relay's paths and closing this one */
        let mut proto = self.session().await?;

        if let Relay::MultiPole(relay) = channel.relay() {
            for sibling in relay.channels() {
                let Err(e) = proto.send(open_cmd(sibling)).await else {
                    continue;
                };

                match self.config.group_safety {
                    GroupSafety::Strict => return Err(e),
                    GroupSafety::BestEffort => warn!(
                        "Could not open channel {sibling} before closing {channel} on {}: {e}",
                        channel.relay()
                    ),
                }
            }
        }

        proto.send(format!("CLOSE (@{channel})")).await
    }

    async fn closed_channel_list(&self) -> Result<String> {
        let mut proto = self.session().await?;

        proto.send("CLOSE?").await?;
        let resp = proto.recv(QUERY_READ_SIZE).await?;

        Ok(String::from_utf8_lossy(&resp)
            .trim_end_matches(['\r', '\n'])
            .to_string())
    }

    async fn identify(&self) -> Result<ModelInfo> {
        self.session().await?.idn_model().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.close().await
    }
}
