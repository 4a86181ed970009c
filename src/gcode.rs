// src/gcode.rs - axis words and the small relative-move dialect spoken to the controller
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Linear and rotary axis words accepted for manual motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
    A,
    B,
    C,
    U,
    V,
    W,
}

impl Axis {
    pub const ALL: [Axis; 9] = [
        Axis::X,
        Axis::Y,
        Axis::Z,
        Axis::A,
        Axis::B,
        Axis::C,
        Axis::U,
        Axis::V,
        Axis::W,
    ];

    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::A => 'A',
            Axis::B => 'B',
            Axis::C => 'C',
            Axis::U => 'U',
            Axis::V => 'V',
            Axis::W => 'W',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized axis word: {0:?}")]
pub struct UnknownAxis(pub String);

impl FromStr for Axis {
    type Err = UnknownAxis;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut chars = trimmed.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Axis::try_from(c).map_err(|_| UnknownAxis(trimmed.to_string())),
            _ => Err(UnknownAxis(trimmed.to_string())),
        }
    }
}

impl TryFrom<char> for Axis {
    type Error = UnknownAxis;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        match c.to_ascii_uppercase() {
            'X' => Ok(Axis::X),
            'Y' => Ok(Axis::Y),
            'Z' => Ok(Axis::Z),
            'A' => Ok(Axis::A),
            'B' => Ok(Axis::B),
            'C' => Ok(Axis::C),
            'U' => Ok(Axis::U),
            'V' => Ok(Axis::V),
            'W' => Ok(Axis::W),
            _ => Err(UnknownAxis(c.to_string())),
        }
    }
}

impl Serialize for Axis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_char(self.letter())
    }
}

impl<'de> Deserialize<'de> for Axis {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// One line of the motion dialect. Distances always render with five decimal
/// places and feed rates with three, which is what the controller's parser
/// expects from a host.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// `G91` - switch to relative positioning.
    Relative,
    /// `G91 F<feed>` - relative positioning plus a feed rate for the moves that follow.
    RelativeFeed { feed: f64 },
    /// `G1 <axis><distance>` with an optional inline `F<feed>` word.
    Feed {
        axis: Axis,
        distance: f64,
        feed: Option<f64>,
    },
    /// `G0 <axis><distance>` - rapid traverse at the machine's default rate.
    Rapid { axis: Axis, distance: f64 },
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Relative => write!(f, "G91"),
            Directive::RelativeFeed { feed } => write!(f, "G91 F{feed:.3}"),
            Directive::Feed {
                axis,
                distance,
                feed: None,
            } => write!(f, "G1 {axis}{distance:.5}"),
            Directive::Feed {
                axis,
                distance,
                feed: Some(feed),
            } => write!(f, "G1 {axis}{distance:.5} F{feed:.3}"),
            Directive::Rapid { axis, distance } => write!(f, "G0 {axis}{distance:.5}"),
        }
    }
}
