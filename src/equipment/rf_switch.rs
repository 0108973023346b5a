use std::{collections::BTreeSet, fmt::Display, ops::RangeInclusive, str::FromStr};

use async_trait::async_trait;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    error::{Error, Result},
    model::ModelInfo,
};

/// Valid channel numbers of the S46
pub const CHANNELS: RangeInclusive<u32> = 1..=32;
/// Channels on each multi-pole relay
pub const MULTI_POLE_WIDTH: u8 = 6;
/// Last channel served by a multi-pole relay, the rest are 2-pole
const LAST_MULTI_POLE_CHANNEL: u8 = 4 * MULTI_POLE_WIDTH;

/// A single relay channel, 1 through 32
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(u8);
impl Channel {
    pub fn new(number: u32) -> Result<Self> {
        if !CHANNELS.contains(&number) {
            return Err(Error::InvalidArgument(format!(
                "Channel {number} outside {}..={}",
                CHANNELS.start(),
                CHANNELS.end()
            )));
        }

        Ok(Self(number as u8))
    }

    pub fn number(&self) -> u8 {
        self.0
    }

    /// Relay this channel is a path of
    pub fn relay(&self) -> Relay {
        if self.0 <= LAST_MULTI_POLE_CHANNEL {
            Relay::MultiPole(match (self.0 - 1) / MULTI_POLE_WIDTH {
                0 => MultiPoleRelay::A,
                1 => MultiPoleRelay::B,
                2 => MultiPoleRelay::C,
                _ => MultiPoleRelay::D,
            })
        } else {
            Relay::TwoPole(self.0 - LAST_MULTI_POLE_CHANNEL)
        }
    }
}
impl TryFrom<u32> for Channel {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}
impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let number = s
            .trim()
            .parse()
            .map_err(|e| Error::InvalidArgument(format!("Channel `{s}`: {e}")))?;
        Self::new(number)
    }
}
impl Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The four 6-channel relays, at most one path of each may be closed
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display, EnumIter)]
pub enum MultiPoleRelay {
    A,
    B,
    C,
    D,
}
impl MultiPoleRelay {
    /// Every channel of this relay, in order
    pub fn channels(self) -> impl Iterator<Item = Channel> {
        let base = self as u8 * MULTI_POLE_WIDTH;
        (base + 1..=base + MULTI_POLE_WIDTH).map(Channel)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relay {
    MultiPole(MultiPoleRelay),
    /// Independent SPDT relay, numbered 1 through 8
    TwoPole(u8),
}
impl Display for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Relay::MultiPole(relay) => write!(f, "relay {relay}"),
            Relay::TwoPole(idx) => write!(f, "2-pole relay {idx}"),
        }
    }
}

/// Channels reported closed by `CLOSE?`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClosedChannels(BTreeSet<Channel>);
impl ClosedChannels {
    pub fn contains(&self, channel: Channel) -> bool {
        self.0.contains(&channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Multi-pole relays with more than one path closed
    pub fn conflicting_relays(&self) -> Vec<MultiPoleRelay> {
        use strum::IntoEnumIterator;

        MultiPoleRelay::iter()
            .filter(|relay| relay.channels().filter(|ch| self.contains(*ch)).count() > 1)
            .collect()
    }
}
impl FromIterator<Channel> for ClosedChannels {
    fn from_iter<T: IntoIterator<Item = Channel>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
impl FromStr for ClosedChannels {
    type Err = Error;

    /// Parse a channel list such as `(@1,3,7)`, `(@1:3)` or `(@)`
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::BadResponse(format!("Not a channel list: `{}`", s.trim()));

        let list = s
            .trim()
            .strip_prefix("(@")
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(bad)?
            .trim();

        let mut channels = BTreeSet::new();
        if list.is_empty() {
            return Ok(Self(channels));
        }

        for item in list.split(',') {
            let parse = |n: &str| -> Result<Channel> {
                let n: u32 = n.trim().parse().map_err(|_| bad())?;
                Channel::new(n).map_err(|_| bad())
            };

            match item.split_once(':') {
                Some((first, last)) => {
                    let (first, last) = (parse(first)?, parse(last)?);
                    let (lo, hi) = (first.min(last).0, first.max(last).0);
                    channels.extend((lo..=hi).map(Channel));
                }
                None => {
                    channels.insert(parse(item)?);
                }
            }
        }

        Ok(Self(channels))
    }
}
impl Display for ClosedChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(@")?;
        for (idx, ch) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{ch}")?;
        }
        write!(f, ")")
    }
}

/// What closing a multi-pole channel does when opening a sibling fails
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum GroupSafety {
    /// Log the failure and carry on with the close
    #[default]
    BestEffort,
    /// Return the failure without closing the channel
    Strict,
}

#[async_trait]
pub trait RfSwitchEquipment: Send + Sync {
    async fn reset(&self) -> Result<()>;

    /// Open (disconnect) a single channel
    async fn open_channel(&self, channel: u32) -> Result<()>;

    async fn open_all_channels(&self) -> Result<()>;

    /// Close (connect) a single channel, opening the other paths of its
    /// relay first where it has any
    async fn close_channel(&self, channel: u32) -> Result<()>;

    /// Closed channels as reported by the instrument, e.g. `(@1,3,7)`
    async fn closed_channel_list(&self) -> Result<String>;

    async fn closed_channels(&self) -> Result<ClosedChannels> {
        self.closed_channel_list().await?.parse()
    }

    async fn identify(&self) -> Result<ModelInfo>;

    /// Release the session, further operations fail with
    /// [`Error::NotConnected`]
    async fn disconnect(&mut self) -> Result<()>;
}
