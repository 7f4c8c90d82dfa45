use std::fmt;

use serde::{Deserialize, Serialize};

/// Firewall category. The numeric mapping is fixed at collection time and
/// shared by every dataset and model artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FirewallLabel {
    NoFirewall = 0,
    Stateless = 1,
    Stateful = 2,
    Proxy = 3,
}

impl FirewallLabel {
    pub const COUNT: usize = 4;

    pub const ALL: [FirewallLabel; Self::COUNT] = [
        FirewallLabel::NoFirewall,
        FirewallLabel::Stateless,
        FirewallLabel::Stateful,
        FirewallLabel::Proxy,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            FirewallLabel::NoFirewall => "No Firewall",
            FirewallLabel::Stateless => "Stateless",
            FirewallLabel::Stateful => "Stateful",
            FirewallLabel::Proxy => "Proxy",
        }
    }
}

impl TryFrom<u8> for FirewallLabel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_index(value as usize)
            .ok_or_else(|| format!("label {} outside 0..={}", value, Self::COUNT - 1))
    }
}

impl From<FirewallLabel> for u8 {
    fn from(label: FirewallLabel) -> Self {
        label as u8
    }
}

impl fmt::Display for FirewallLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
