use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Labels a prediction can carry. The first three are model outputs in
/// class-index order; `NotAShoe` is the rejection sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShoeClass {
    Boot,
    Sandal,
    Shoe,
    #[serde(rename = "Not a Shoe")]
    NotAShoe,
}

/// Model output classes, indexed by output neuron.
pub const CLASSES: [ShoeClass; 3] = [ShoeClass::Boot, ShoeClass::Sandal, ShoeClass::Shoe];

pub const NUM_CLASSES: usize = CLASSES.len();

impl ShoeClass {
    pub fn from_index(index: usize) -> Option<Self> {
        CLASSES.get(index).copied()
    }

    /// Output-neuron index; `None` for the sentinel.
    pub fn index(self) -> Option<usize> {
        CLASSES.iter().position(|c| *c == self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShoeClass::Boot => "Boot",
            ShoeClass::Sandal => "Sandal",
            ShoeClass::Shoe => "Shoe",
            ShoeClass::NotAShoe => "Not a Shoe",
        }
    }
}

impl fmt::Display for ShoeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
#[error("unknown label '{0}'")]
pub struct UnknownLabel(pub String);

impl FromStr for ShoeClass {
    type Err = UnknownLabel;

    /// Parses a trainable label (folder names are matched case-insensitively).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CLASSES
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}
