//! # pynn-rs Core
//!
//! Simulator-independent layer for describing spiking network models.
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`identity`] | Globally unique cell ids, round-robin ownership across nodes |
//! | [`population`] | Shaped collections of cells, bulk parameter access |
//! | [`projection`] | Synaptic connections between two populations |
//! | [`recording`] | Per-variable recorders and time-aligned segments |
//!
//! The actual integration of membrane equations is delegated to a
//! [`backend::Backend`] implementation (see `pynn-neuron` and `pynn-brian`).
//!
//! ## Execution model
//!
//! One [`Simulation`] per worker process. Each process owns the cells whose
//! id satisfies `id % num_processes == rank`; nothing in this crate exchanges
//! messages between processes.

pub mod backend;
pub mod cells;
pub mod connectors;
pub mod identity;
pub mod plasticity;
pub mod population;
pub mod projection;
pub mod random;
pub mod recording;
pub mod segment;
pub mod state;

use thiserror::Error;

pub use backend::{AdjusterHandle, Backend, CellHandle, Clock, ConnectionHandle, DeviceHandle, SynapseTarget};
pub use cells::{CellSpec, CellType, ParameterValue, Parameters};
pub use connectors::{
    AllToAllConnector, ConnectionRecord, ConnectionValue, Connector, FixedProbabilityConnector,
    FromFileConnector, FromListConnector, OneToOneConnector, SynapseValues,
};
pub use identity::{CellId, IdRange, IdentitySpace};
pub use plasticity::{SpikePairRule, StdpMechanism, SynapseDynamics, TsodyksMarkram, WeightDependence};
pub use population::{Address, CellValues, Layout, Population, RecordSelection};
pub use projection::{
    Connection, ConnectionBuilder, ConnectionData, ConnectionValues, MatrixFormat, Projection, ProjectionOptions,
};
pub use random::{Distribution, RandomDistribution, SeededRng};
pub use recording::{DeviceState, Recorder, RecorderSource, Variable};
pub use segment::{AnalogSignalArray, Segment, SpikeTrain, Unit};
pub use state::{CreatedCells, SetupParams, Simulation};

/// Common errors
#[derive(Debug, Error)]
pub enum PynnError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Invalid parameter value: {0}")]
    InvalidParameterValue(String),

    #[error("Index error: {0}")]
    IndexError(String),

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PynnError>;

/// Time point (ms)
pub type Time = f64;

/// Synaptic weight (nA for current-based, uS for conductance-based synapses)
pub type Weight = f64;

/// Synaptic delay (ms)
pub type Delay = f64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = PynnError::ConstraintViolation("delay 0.05 < 0.1".into());
        assert_eq!(err.to_string(), "Constraint violation: delay 0.05 < 0.1");

        let io: PynnError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(io, PynnError::Io(_)));
    }
}
