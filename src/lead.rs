use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// One of the 15 standard lead names. Declaration order is the conventional
/// reporting order, so `Ord` gives deterministic iteration in maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lead {
    I,
    II,
    III,
    AVR,
    AVL,
    AVF,
    V1,
    V2,
    V3,
    V4,
    V5,
    V6,
    V3R,
    V4R,
    V7,
}

impl Lead {
    /// The 12 leads of a standard adult ECG, in reporting order.
    pub const STANDARD_12: [Lead; 12] = [
        Lead::I,
        Lead::II,
        Lead::III,
        Lead::AVR,
        Lead::AVL,
        Lead::AVF,
        Lead::V1,
        Lead::V2,
        Lead::V3,
        Lead::V4,
        Lead::V5,
        Lead::V6,
    ];

    /// Display name with conventional casing (aVR, not AVR).
    pub fn name(&self) -> &'static str {
        match self {
            Lead::I => "I",
            Lead::II => "II",
            Lead::III => "III",
            Lead::AVR => "aVR",
            Lead::AVL => "aVL",
            Lead::AVF => "aVF",
            Lead::V1 => "V1",
            Lead::V2 => "V2",
            Lead::V3 => "V3",
            Lead::V4 => "V4",
            Lead::V5 => "V5",
            Lead::V6 => "V6",
            Lead::V3R => "V3R",
            Lead::V4R => "V4R",
            Lead::V7 => "V7",
        }
    }

    /// Tolerant parse of oracle / label text: case-insensitive, strips a
    /// leading "lead" word and surrounding punctuation, maps roman and
    /// augmented spellings ("avr", "AVL", "Lead II") to the canonical lead.
    pub fn parse(text: &str) -> Option<Lead> {
        let cleaned: String = text
            .trim()
            .trim_start_matches("lead ")
            .trim_start_matches("Lead ")
            .trim_start_matches("LEAD ")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        match cleaned.as_str() {
            "I" | "1" => Some(Lead::I),
            "II" | "2" => Some(Lead::II),
            "III" | "3" => Some(Lead::III),
            "AVR" => Some(Lead::AVR),
            "AVL" => Some(Lead::AVL),
            "AVF" => Some(Lead::AVF),
            "V1" => Some(Lead::V1),
            "V2" => Some(Lead::V2),
            "V3" => Some(Lead::V3),
            "V4" => Some(Lead::V4),
            "V5" => Some(Lead::V5),
            "V6" => Some(Lead::V6),
            "V3R" => Some(Lead::V3R),
            "V4R" => Some(Lead::V4R),
            "V7" => Some(Lead::V7),
            _ => None,
        }
    }

}

impl fmt::Display for Lead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Lead {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Lead {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LeadVisitor;
        impl Visitor<'_> for LeadVisitor {
            type Value = Lead;
            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an ECG lead name")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<Lead, E> {
                Lead::parse(v).ok_or_else(|| E::custom(format!("unknown lead '{v}'")))
            }
        }
        deserializer.deserialize_str(LeadVisitor)
    }
}
