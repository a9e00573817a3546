//! Distribution targets and their one-byte bitfield encoding

use std::fmt;
use std::str::FromStr;

use crate::error::{PatchError, Result};

/// A deployment target that may carry its own baseline content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Distribution {
    Client,
    Server,
    Joined,
}

impl Distribution {
    /// All distributions in bit order.
    pub const ALL: [Distribution; 3] = [
        Distribution::Client,
        Distribution::Server,
        Distribution::Joined,
    ];

    pub const fn bit(self) -> u8 {
        match self {
            Distribution::Client => 0b001,
            Distribution::Server => 0b010,
            Distribution::Joined => 0b100,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Distribution::Client => "client",
            Distribution::Server => "server",
            Distribution::Joined => "joined",
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Distribution {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self> {
        Distribution::ALL
            .into_iter()
            .find(|d| d.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| PatchError::Usage(format!("Unknown distribution: {s}")))
    }
}

/// Set of distributions packed into the low three bits of a byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DistributionSet(u8);

impl DistributionSet {
    /// Every bit a distribution can occupy.
    pub const MASK: u8 = 0b111;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(Self::MASK)
    }

    pub const fn single(dist: Distribution) -> Self {
        Self(dist.bit())
    }

    /// Decode a bitfield, rejecting bits no distribution owns.
    pub fn from_bitfield(bits: u8) -> Result<Self> {
        if bits & !Self::MASK != 0 {
            return Err(PatchError::Format(format!(
                "Unknown distribution bits in {bits:#010b}"
            )));
        }
        Ok(Self(bits))
    }

    /// Decode a bitfield, dropping bits no distribution owns.
    pub const fn from_bitfield_masked(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }

    pub const fn to_bitfield(self) -> u8 {
        self.0
    }

    pub fn insert(&mut self, dist: Distribution) {
        self.0 |= dist.bit();
    }

    pub const fn contains(self, dist: Distribution) -> bool {
        self.0 & dist.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_subset_of(self, other: DistributionSet) -> bool {
        self.0 & !other.0 == 0
    }

    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = Distribution> {
        Distribution::ALL.into_iter().filter(move |d| self.contains(*d))
    }
}

impl FromIterator<Distribution> for DistributionSet {
    fn from_iter<I: IntoIterator<Item = Distribution>>(iter: I) -> Self {
        let mut set = DistributionSet::empty();
        for dist in iter {
            set.insert(dist);
        }
        set
    }
}

impl fmt::Display for DistributionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.iter().map(Distribution::name).collect();
        f.write_str(&names.join("+"))
    }
}
