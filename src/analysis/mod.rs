//! Feature-effect analysis: method selection, the engine seam and its
//! built-in implementation.

mod binning;
mod engine;
mod plot;

use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::{data::NumericTable, model::Predict};

pub use binning::{BinEffect, BinStats, MeanBinEffect};
pub use engine::{BuiltinEngine, EngineSettings};
pub use plot::{Curve, render_png};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Method {
    #[default]
    Pdp,
    Rhale,
    RegionalPdp,
    RegionalRhale,
    ShapDependence,
}

impl Method {
    pub fn name(self) -> &'static str {
        match self {
            Method::Pdp => "pdp",
            Method::Rhale => "rhale",
            Method::RegionalPdp => "regional_pdp",
            Method::RegionalRhale => "regional_rhale",
            Method::ShapDependence => "shap_dp",
        }
    }

    /// Key of the rendered plot in the response envelope.
    pub fn plot_key(self) -> String {
        format!("{}_plot", self.name())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pdp" => Ok(Method::Pdp),
            "rhale" => Ok(Method::Rhale),
            "regional_pdp" => Ok(Method::RegionalPdp),
            "regional_rhale" => Ok(Method::RegionalRhale),
            "shap_dp" | "shap" => Ok(Method::ShapDependence),
            other => Err(format!("unknown method `{other}`")),
        }
    }
}

/// Validated parameters of one analysis.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub method: Method,
    pub feature: usize,
    pub target_name: String,
    pub node_idx: Option<usize>,
}

/// Rendered PNGs keyed by plot name.
#[derive(Debug, Clone, Default)]
pub struct PlotSet(BTreeMap<String, Vec<u8>>);

impl PlotSet {
    pub fn insert(&mut self, key: impl Into<String>, png: Vec<u8>) {
        self.0.insert(key.into(), png);
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Computes and renders feature effects for a loaded model.
///
/// The bin-effect strategy is supplied per call rather than configured
/// globally.
pub trait EffectEngine: Send + Sync {
    fn run(
        &self,
        table: &NumericTable,
        model: &dyn Predict,
        job: &AnalysisJob,
        bin_effect: &dyn BinEffect,
    ) -> anyhow::Result<PlotSet>;
}
