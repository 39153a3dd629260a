//! Input configuration for a simulation run.
//!
//! Configuration files are TOML with one table per subsystem (`[time]`,
//! `[mesh]`, `[meshblock]`) and an array of tables for static refinement
//! regions (`[[refinement]]`). Field names and defaults follow the historical
//! input-file schema; validation beyond type checking happens during mesh
//! construction so that every diagnostic carries mesh context.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Time-integration window and step control.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeConfig {
    #[serde(default)]
    pub start_time: f64,
    pub tlim: f64,
    pub cfl_number: f64,
    /// Cycle limit; negative means unlimited.
    #[serde(default = "default_nlim")]
    pub nlim: i64,
}

fn default_nlim() -> i64 {
    -1
}

/// Refinement mode of the mesh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefinementKind {
    #[default]
    Static,
    Adaptive,
}

/// Root-grid geometry and boundary tags.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default = "default_threads")]
    pub num_threads: usize,
    pub nx1: usize,
    #[serde(default = "default_nx")]
    pub nx2: usize,
    #[serde(default = "default_nx")]
    pub nx3: usize,
    pub x1min: f64,
    pub x1max: f64,
    pub x2min: f64,
    pub x2max: f64,
    pub x3min: f64,
    pub x3max: f64,
    #[serde(default = "default_rat")]
    pub x1rat: f64,
    #[serde(default = "default_rat")]
    pub x2rat: f64,
    #[serde(default = "default_rat")]
    pub x3rat: f64,
    /// Integer boundary tags per face; 0 is accepted as outflow.
    #[serde(default)]
    pub ix1_bc: i32,
    #[serde(default)]
    pub ox1_bc: i32,
    #[serde(default)]
    pub ix2_bc: i32,
    #[serde(default)]
    pub ox2_bc: i32,
    #[serde(default)]
    pub ix3_bc: i32,
    #[serde(default)]
    pub ox3_bc: i32,
    #[serde(default)]
    pub refinement: RefinementKind,
    #[serde(default = "default_maxlevel")]
    pub maxlevel: i32,
}

fn default_threads() -> usize {
    1
}

fn default_nx() -> usize {
    1
}

fn default_rat() -> f64 {
    1.0
}

fn default_maxlevel() -> i32 {
    1
}

/// Cell counts of a single block; unset axes default to the whole mesh.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MeshBlockConfig {
    pub nx1: Option<usize>,
    pub nx2: Option<usize>,
    pub nx3: Option<usize>,
}

/// One statically refined region. Extents on unused axes may be omitted and
/// then cover the whole mesh.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefinementConfig {
    pub x1min: f64,
    pub x1max: f64,
    pub x2min: Option<f64>,
    pub x2max: Option<f64>,
    pub x3min: Option<f64>,
    pub x3max: Option<f64>,
    /// Physical refinement level relative to the root grid; must be >= 1.
    pub level: i32,
}

/// The full input configuration of a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub time: TimeConfig,
    pub mesh: MeshConfig,
    #[serde(default)]
    pub meshblock: MeshBlockConfig,
    #[serde(default, rename = "refinement")]
    pub refinements: Vec<RefinementConfig>,
}

impl Config {
    /// Loads a configuration from a TOML file.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let string = std::fs::read_to_string(path)?;
        toml::from_str(&string).map_err(std::io::Error::other)
    }

    pub fn from_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    pub fn adaptive(&self) -> bool {
        self.mesh.refinement == RefinementKind::Adaptive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_defaults() {
        let cfg = Config::from_str(
            r#"
            [time]
            tlim = 1.0
            cfl_number = 0.3

            [mesh]
            nx1 = 16
            nx2 = 16
            nx3 = 16
            x1min = 0.0
            x1max = 1.0
            x2min = 0.0
            x2max = 1.0
            x3min = 0.0
            x3max = 1.0
            ix1_bc = 4
            ox1_bc = 4

            [meshblock]
            nx1 = 8
            nx2 = 8
            nx3 = 8

            [[refinement]]
            x1min = 0.25
            x1max = 0.75
            level = 1
            "#,
        )
        .unwrap();

        assert_eq!(cfg.time.start_time, 0.0);
        assert_eq!(cfg.time.nlim, -1);
        assert_eq!(cfg.mesh.num_threads, 1);
        assert_eq!(cfg.mesh.x1rat, 1.0);
        assert_eq!(cfg.mesh.refinement, RefinementKind::Static);
        assert_eq!(cfg.meshblock.nx1, Some(8));
        assert_eq!(cfg.refinements.len(), 1);
        assert_eq!(cfg.refinements[0].x2min, None);
    }
}
