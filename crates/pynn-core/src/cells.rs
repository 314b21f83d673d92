//! Standard cell types and their default parameters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::recording::Variable;
use crate::{PynnError, Result};

/// A cell parameter: most are scalars, spike sources carry time vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl ParameterValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(x) => Some(*x),
            Self::Vector(_) => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            Self::Scalar(_) => None,
            Self::Vector(v) => Some(v),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(x: f64) -> Self {
        Self::Scalar(x)
    }
}

impl From<Vec<f64>> for ParameterValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Vector(v)
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(x) => write!(f, "{}", x),
            Self::Vector(v) => write!(f, "{:?}", v),
        }
    }
}

/// Parameter name -> value
pub type Parameters = BTreeMap<String, ParameterValue>;

/// How synaptic input acts on the membrane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynapseKind {
    Current,
    Conductance,
}

/// Time course of a single synaptic event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynapseShape {
    Exponential,
    Alpha,
}

/// Cell model understood by every backend, or a backend-specific template
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellType {
    #[serde(rename = "IF_curr_alpha")]
    IfCurrAlpha,
    #[serde(rename = "IF_curr_exp")]
    IfCurrExp,
    #[serde(rename = "IF_cond_alpha")]
    IfCondAlpha,
    #[serde(rename = "IF_cond_exp")]
    IfCondExp,
    SpikeSourceArray,
    SpikeSourcePoisson,
    /// Name of a model only the backend knows about
    Native(String),
}

impl CellType {
    pub const STANDARD: [CellType; 6] = [
        CellType::IfCurrAlpha,
        CellType::IfCurrExp,
        CellType::IfCondAlpha,
        CellType::IfCondExp,
        CellType::SpikeSourceArray,
        CellType::SpikeSourcePoisson,
    ];

    pub fn name(&self) -> &str {
        match self {
            Self::IfCurrAlpha => "IF_curr_alpha",
            Self::IfCurrExp => "IF_curr_exp",
            Self::IfCondAlpha => "IF_cond_alpha",
            Self::IfCondExp => "IF_cond_exp",
            Self::SpikeSourceArray => "SpikeSourceArray",
            Self::SpikeSourcePoisson => "SpikeSourcePoisson",
            Self::Native(name) => name,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native(_))
    }

    pub fn is_spike_source(&self) -> bool {
        matches!(self, Self::SpikeSourceArray | Self::SpikeSourcePoisson)
    }

    pub fn synapse_kind(&self) -> Option<SynapseKind> {
        match self {
            Self::IfCurrAlpha | Self::IfCurrExp => Some(SynapseKind::Current),
            Self::IfCondAlpha | Self::IfCondExp => Some(SynapseKind::Conductance),
            _ => None,
        }
    }

    pub fn synapse_shape(&self) -> Option<SynapseShape> {
        match self {
            Self::IfCurrAlpha | Self::IfCondAlpha => Some(SynapseShape::Alpha),
            Self::IfCurrExp | Self::IfCondExp => Some(SynapseShape::Exponential),
            _ => None,
        }
    }

    /// Variables a recorder may ask for
    pub fn recordable(&self) -> Vec<Variable> {
        match self {
            Self::IfCurrAlpha | Self::IfCurrExp => vec![Variable::Spikes, Variable::V],
            Self::IfCondAlpha | Self::IfCondExp => vec![
                Variable::Spikes,
                Variable::V,
                Variable::GsynExc,
                Variable::GsynInh,
            ],
            Self::SpikeSourceArray | Self::SpikeSourcePoisson => vec![Variable::Spikes],
            // No way to know in advance, the backend validates.
            Self::Native(_) => vec![
                Variable::Spikes,
                Variable::V,
                Variable::GsynExc,
                Variable::GsynInh,
            ],
        }
    }

    pub fn default_parameters(&self) -> Parameters {
        let scalars: &[(&str, f64)] = match self {
            Self::IfCurrAlpha => &[
                ("cm", 1.0),
                ("tau_m", 20.0),
                ("tau_refrac", 0.1),
                ("tau_syn_E", 0.5),
                ("tau_syn_I", 0.5),
                ("v_rest", -65.0),
                ("v_thresh", -50.0),
                ("v_reset", -65.0),
                ("i_offset", 0.0),
                ("v_init", -65.0),
            ],
            Self::IfCurrExp => &[
                ("cm", 1.0),
                ("tau_m", 20.0),
                ("tau_refrac", 0.1),
                ("tau_syn_E", 5.0),
                ("tau_syn_I", 5.0),
                ("v_rest", -65.0),
                ("v_thresh", -50.0),
                ("v_reset", -65.0),
                ("i_offset", 0.0),
                ("v_init", -65.0),
            ],
            Self::IfCondAlpha => &[
                ("cm", 1.0),
                ("tau_m", 20.0),
                ("tau_refrac", 0.1),
                ("tau_syn_E", 0.3),
                ("tau_syn_I", 0.5),
                ("e_rev_E", 0.0),
                ("e_rev_I", -70.0),
                ("v_rest", -65.0),
                ("v_thresh", -50.0),
                ("v_reset", -65.0),
                ("i_offset", 0.0),
                ("v_init", -65.0),
            ],
            Self::IfCondExp => &[
                ("cm", 1.0),
                ("tau_m", 20.0),
                ("tau_refrac", 0.1),
                ("tau_syn_E", 5.0),
                ("tau_syn_I", 5.0),
                ("e_rev_E", 0.0),
                ("e_rev_I", -70.0),
                ("v_rest", -65.0),
                ("v_thresh", -50.0),
                ("v_reset", -65.0),
                ("i_offset", 0.0),
                ("v_init", -65.0),
            ],
            Self::SpikeSourceArray => &[],
            Self::SpikeSourcePoisson => &[("rate", 1.0), ("start", 0.0), ("duration", 1e10)],
            Self::Native(_) => &[],
        };

        let mut params: Parameters = scalars
            .iter()
            .map(|(name, value)| (name.to_string(), ParameterValue::Scalar(*value)))
            .collect();
        if *self == Self::SpikeSourceArray {
            params.insert("spike_times".into(), ParameterValue::Vector(vec![]));
        }
        params
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CellType {
    type Err = PynnError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "IF_curr_alpha" => Self::IfCurrAlpha,
            "IF_curr_exp" => Self::IfCurrExp,
            "IF_cond_alpha" => Self::IfCondAlpha,
            "IF_cond_exp" => Self::IfCondExp,
            "SpikeSourceArray" => Self::SpikeSourceArray,
            "SpikeSourcePoisson" => Self::SpikeSourcePoisson,
            other => Self::Native(other.to_string()),
        })
    }
}

/// Cell type plus the full parameter set used to build each cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSpec {
    pub cell_type: CellType,
    pub parameters: Parameters,
}

impl CellSpec {
    /// Checks supplied parameters and fills in defaults for the rest.
    pub fn new(cell_type: CellType, overrides: Parameters) -> Result<Self> {
        let mut parameters = cell_type.default_parameters();
        for (name, value) in overrides {
            if !cell_type.is_native() {
                match parameters.get(&name) {
                    None => {
                        return Err(PynnError::InvalidArgument(format!(
                            "{} has no parameter '{}'",
                            cell_type, name
                        )))
                    }
                    Some(default) if std::mem::discriminant(default) != std::mem::discriminant(&value) => {
                        return Err(PynnError::InvalidParameterValue(format!(
                            "{}.{} expects a {} value, got {}",
                            cell_type,
                            name,
                            if default.as_scalar().is_some() { "scalar" } else { "vector" },
                            value
                        )))
                    }
                    Some(_) => {}
                }
            }
            parameters.insert(name, value);
        }
        Ok(Self {
            cell_type,
            parameters,
        })
    }

    pub fn standard(cell_type: CellType) -> Self {
        Self {
            parameters: cell_type.default_parameters(),
            cell_type,
        }
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).and_then(ParameterValue::as_scalar)
    }
}
