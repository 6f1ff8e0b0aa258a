use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// One unit of the logical clock.
pub type Tick = u64;

/// Raw materials a supplier stocks and a machine consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Material {
    Flour,
    Sugar,
    Butter,
}

impl Material {
    pub const ALL: [Material; 3] = [Material::Flour, Material::Sugar, Material::Butter];
}

impl std::fmt::Display for Material {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Flour => "flour",
            Self::Sugar => "sugar",
            Self::Butter => "butter",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Material {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flour" => Ok(Self::Flour),
            "sugar" => Ok(Self::Sugar),
            "butter" => Ok(Self::Butter),
            other => Err(ProtocolError::UnknownMaterial(other.to_string())),
        }
    }
}

/// Quantities of each material. Used for order batches, supplier stock and
/// per-order capacity ceilings alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Batch {
    pub flour: u32,
    pub sugar: u32,
    pub butter: u32,
}

impl Batch {
    pub const fn new(flour: u32, sugar: u32, butter: u32) -> Self {
        Self { flour, sugar, butter }
    }

    pub fn get(&self, material: Material) -> u32 {
        match material {
            Material::Flour => self.flour,
            Material::Sugar => self.sugar,
            Material::Butter => self.butter,
        }
    }

    fn slot(&mut self, material: Material) -> &mut u32 {
        match material {
            Material::Flour => &mut self.flour,
            Material::Sugar => &mut self.sugar,
            Material::Butter => &mut self.butter,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Material, u32)> + '_ {
        Material::ALL.into_iter().map(move |m| (m, self.get(m)))
    }

    pub fn total(&self) -> u64 {
        self.iter().map(|(_, q)| q as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// True when every material in `self` is at least the quantity in `other`.
    pub fn covers(&self, other: &Batch) -> bool {
        self.iter().all(|(m, q)| q >= other.get(m))
    }

    /// First material where `self` exceeds `ceiling`, as
    /// `(material, requested, ceiling)`.
    pub fn exceeding(&self, ceiling: &Batch) -> Option<(Material, u32, u32)> {
        self.iter()
            .find(|(m, q)| *q > ceiling.get(*m))
            .map(|(m, q)| (m, q, ceiling.get(m)))
    }

    /// Subtract `other`, or `None` if any material would go negative.
    pub fn checked_sub(&self, other: &Batch) -> Option<Batch> {
        let mut out = *self;
        for (m, q) in other.iter() {
            *out.slot(m) = self.get(m).checked_sub(q)?;
        }
        Some(out)
    }

    pub fn saturating_add(&self, other: &Batch) -> Batch {
        let mut out = *self;
        for (m, q) in other.iter() {
            *out.slot(m) = self.get(m).saturating_add(q);
        }
        out
    }

    /// Smallest per-material quantity.
    pub fn min_level(&self) -> u32 {
        self.iter().map(|(_, q)| q).min().unwrap_or(0)
    }
}

impl std::fmt::Display for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "flour={}, sugar={}, butter={}",
            self.flour, self.sugar, self.butter
        )
    }
}

/// A production stage. Declaration order is the canonical pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Cutting,
    Mixing,
    Baking,
    Packaging,
}

impl Stage {
    /// The full canonical pipeline.
    pub const CANONICAL: [Stage; 4] = [
        Stage::Cutting,
        Stage::Mixing,
        Stage::Baking,
        Stage::Packaging,
    ];

    /// Position of the stage in the canonical pipeline.
    pub fn rank(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cutting => "cutting",
            Self::Mixing => "mixing",
            Self::Baking => "baking",
            Self::Packaging => "packaging",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Stage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cutting" => Ok(Self::Cutting),
            "mixing" => Ok(Self::Mixing),
            "baking" => Ok(Self::Baking),
            "packaging" => Ok(Self::Packaging),
            other => Err(ProtocolError::UnknownStage(other.to_string())),
        }
    }
}

/// Canonical pipeline filtered to the given capabilities, in canonical order.
pub fn pipeline_for(capabilities: &BTreeSet<Stage>) -> Vec<Stage> {
    Stage::CANONICAL
        .into_iter()
        .filter(|s| capabilities.contains(s))
        .collect()
}
