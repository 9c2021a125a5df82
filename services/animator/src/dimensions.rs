//! Output size selection for the image edit API.
//!
//! The API only renders three canvases. Inputs are mapped to the canvas whose
//! aspect ratio is closest, with special handling for panoramic extremes.

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::debug;

const DEFAULT_TOLERANCE: f64 = 0.1;
const EXTREME_RATIO_THRESHOLD: f64 = 2.0;
const MAX_REASONABLE_DIMENSION: u32 = 10_000;

const SQUARE_RATIO: f64 = 1.0;
const LANDSCAPE_RATIO: f64 = 1536.0 / 1024.0;
const PORTRAIT_RATIO: f64 = 1024.0 / 1536.0;

/// Canvas sizes supported by the edit endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CanvasSize {
    #[serde(rename = "1024x1024")]
    Square,
    #[serde(rename = "1536x1024")]
    Landscape,
    #[serde(rename = "1024x1536")]
    Portrait,
}

impl CanvasSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanvasSize::Square => "1024x1024",
            CanvasSize::Landscape => "1536x1024",
            CanvasSize::Portrait => "1024x1536",
        }
    }

    fn ratio(&self) -> f64 {
        match self {
            CanvasSize::Square => SQUARE_RATIO,
            CanvasSize::Landscape => LANDSCAPE_RATIO,
            CanvasSize::Portrait => PORTRAIT_RATIO,
        }
    }
}

impl fmt::Display for CanvasSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DimensionError {
    #[error("Invalid dimensions {width}x{height}: must be positive")]
    NonPositive { width: u32, height: u32 },

    #[error("Dimensions too large: {width}x{height}, maximum {max}x{max}")]
    TooLarge { width: u32, height: u32, max: u32 },
}

/// Aspect ratio analysis of an input image
#[derive(Debug, Clone, PartialEq)]
pub struct AspectInfo {
    pub ratio: f64,
    pub category: CanvasSize,
    pub is_extreme: bool,
    /// How well the ratio matches its category (0-1)
    pub confidence: f64,
}

/// Chosen canvas with the reasoning behind it
#[derive(Debug, Clone, PartialEq)]
pub struct SizeDecision {
    pub size: CanvasSize,
    pub input_ratio: f64,
    pub target_ratio: f64,
    pub confidence: f64,
    pub reasoning: String,
}

pub fn validate_dimensions(width: u32, height: u32) -> Result<(), DimensionError> {
    if width == 0 || height == 0 {
        return Err(DimensionError::NonPositive { width, height });
    }
    if width > MAX_REASONABLE_DIMENSION || height > MAX_REASONABLE_DIMENSION {
        return Err(DimensionError::TooLarge {
            width,
            height,
            max: MAX_REASONABLE_DIMENSION,
        });
    }
    Ok(())
}

/// Classify an aspect ratio against the three canvases
pub fn analyze_aspect(width: u32, height: u32, tolerance: f64) -> Result<AspectInfo, DimensionError> {
    validate_dimensions(width, height)?;

    let ratio = width as f64 / height as f64;
    let (category, distance) = [CanvasSize::Square, CanvasSize::Landscape, CanvasSize::Portrait]
        .into_iter()
        .map(|size| (size, (ratio - size.ratio()).abs()))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((CanvasSize::Square, 0.0));

    let is_extreme = ratio > EXTREME_RATIO_THRESHOLD || ratio < 1.0 / EXTREME_RATIO_THRESHOLD;
    let mut confidence = (1.0 - distance / tolerance).max(0.0);
    if is_extreme {
        confidence *= 0.7;
    }

    Ok(AspectInfo {
        ratio,
        category,
        is_extreme,
        confidence: confidence.clamp(0.0, 1.0),
    })
}

fn extreme_decision(ratio: f64) -> SizeDecision {
    let (size, confidence, reasoning) = if ratio > 2.5 {
        (CanvasSize::Landscape, 0.6, format!("Ultra-wide ratio {ratio:.2}:1 mapped to landscape"))
    } else if ratio < 0.4 {
        (CanvasSize::Portrait, 0.6, format!("Ultra-tall ratio {ratio:.2}:1 mapped to portrait"))
    } else if ratio > EXTREME_RATIO_THRESHOLD {
        (CanvasSize::Landscape, 0.8, format!("Wide ratio {ratio:.2}:1 mapped to landscape"))
    } else {
        (CanvasSize::Portrait, 0.8, format!("Tall ratio {ratio:.2}:1 mapped to portrait"))
    };

    SizeDecision {
        size,
        input_ratio: ratio,
        target_ratio: size.ratio(),
        confidence,
        reasoning,
    }
}

/// Pick the canvas for an input of the given dimensions.
///
/// Never fails: invalid dimensions fall back to a square canvas with zero
/// confidence.
pub fn select_canvas(width: u32, height: u32) -> SizeDecision {
    let decision = match analyze_aspect(width, height, DEFAULT_TOLERANCE) {
        Ok(info) if info.is_extreme => extreme_decision(info.ratio),
        Ok(info) => SizeDecision {
            size: info.category,
            input_ratio: info.ratio,
            target_ratio: info.category.ratio(),
            confidence: info.confidence,
            reasoning: format!(
                "Ratio {:.2}:1 closest to {} (confidence {:.0}%)",
                info.ratio,
                info.category,
                info.confidence * 100.0
            ),
        },
        Err(e) => SizeDecision {
            size: CanvasSize::Square,
            input_ratio: 1.0,
            target_ratio: SQUARE_RATIO,
            confidence: 0.0,
            reasoning: format!("Dimension analysis failed, defaulting to square: {e}"),
        },
    };

    debug!(
        input = %format!("{width}x{height}"),
        size = %decision.size,
        confidence = decision.confidence,
        reasoning = %decision.reasoning,
        "Selected output canvas"
    );

    decision
}
