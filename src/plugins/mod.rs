//! Built-in capability plugins.
//!
//! Each plugin is a thin wrapper over local libraries behind the
//! `{descriptor, invoke}` contract. Heavy model work (diffusion, neural
//! translation) sits behind backend traits with deterministic local
//! defaults, so the platform runs end to end without model weights.

pub mod calculators;
pub mod document_analysis;
pub mod image_generation;
pub mod qr_code;
pub mod translation;

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::ToolError;
use crate::registry::Plugin;

/// The standard plugin set, registered at startup.
pub fn default_plugins() -> Vec<Arc<dyn Plugin>> {
    vec![
        Arc::new(image_generation::ImageGenerationPlugin::default()),
        Arc::new(document_analysis::DocumentAnalysisPlugin),
        Arc::new(translation::TranslationPlugin::default()),
        Arc::new(qr_code::QrCodePlugin),
        Arc::new(calculators::CalculatorPlugin),
    ]
}

// Argument accessors. The dispatcher has already validated and defaulted
// arguments against the schema; these guard the direct-invocation path.

pub(crate) fn require_str<'a>(args: &'a Map<String, Value>, name: &str) -> Result<&'a str, ToolError> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::invalid_argument(name, "missing required parameter"))
}

pub(crate) fn opt_str<'a>(args: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

pub(crate) fn int_or(args: &Map<String, Value>, name: &str, default: i64) -> Result<i64, ToolError> {
    match args.get(name) {
        None => Ok(default),
        Some(v) => v
            .as_i64()
            .ok_or_else(|| ToolError::invalid_argument(name, "expected integer")),
    }
}

pub(crate) fn float_or(args: &Map<String, Value>, name: &str, default: f64) -> Result<f64, ToolError> {
    match args.get(name) {
        None => Ok(default),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| ToolError::invalid_argument(name, "expected number")),
    }
}

pub(crate) fn opt_float(args: &Map<String, Value>, name: &str) -> Result<Option<f64>, ToolError> {
    match args.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| ToolError::invalid_argument(name, "expected number")),
    }
}

pub(crate) fn bool_or(args: &Map<String, Value>, name: &str, default: bool) -> Result<bool, ToolError> {
    match args.get(name) {
        None => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| ToolError::invalid_argument(name, "expected boolean")),
    }
}
