//! Fix validity evaluation

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{GpsFix, FIX_TYPE_3D};
use crate::utils::config::GpsConfig;

/// Thresholds a fix must meet to be usable
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixRequirements {
    pub min_satellites: u32,
    pub max_hdop: f64,
    pub require_3d: bool,
}

impl Default for FixRequirements {
    fn default() -> Self {
        Self::from(&GpsConfig::default())
    }
}

impl From<&GpsConfig> for FixRequirements {
    fn from(config: &GpsConfig) -> Self {
        Self {
            min_satellites: config.min_satellites,
            max_hdop: config.max_hdop,
            require_3d: config.require_3d_fix,
        }
    }
}

/// First failing check, in priority order
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FixRejection {
    #[error("no position data")]
    NoPosition,
    #[error("too few satellites ({have}/{need})")]
    TooFewSatellites { have: u32, need: u32 },
    #[error("HDOP too high ({hdop:.1}/{max:.1})")]
    HdopTooHigh { hdop: f64, max: f64 },
    #[error("no 3D fix (fix type {fix_type})")]
    No3dFix { fix_type: u8 },
}

/// Check `fix` against `requirements`
pub fn evaluate_fix(fix: &GpsFix, requirements: &FixRequirements) -> Result<(), FixRejection> {
    if fix.latitude.is_none() || fix.longitude.is_none() {
        return Err(FixRejection::NoPosition);
    }
    if fix.satellites < requirements.min_satellites {
        return Err(FixRejection::TooFewSatellites {
            have: fix.satellites,
            need: requirements.min_satellites,
        });
    }
    if fix.hdop > requirements.max_hdop {
        return Err(FixRejection::HdopTooHigh {
            hdop: fix.hdop,
            max: requirements.max_hdop,
        });
    }
    if requirements.require_3d && fix.fix_type < FIX_TYPE_3D {
        return Err(FixRejection::No3dFix {
            fix_type: fix.fix_type,
        });
    }
    Ok(())
}
