//! Contract between the core and a simulation engine.
//!
//! The core never integrates anything itself. It creates cells, devices and
//! connections through this trait and reads recorded data back out of it.
//! All handles are opaque indices owned by the backend.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cells::{CellSpec, ParameterValue};
use crate::identity::CellId;
use crate::plasticity::{StdpMechanism, TsodyksMarkram};
use crate::recording::Variable;
use crate::segment::Unit;
use crate::{Delay, PynnError, Result, Time, Weight};

/// Backend cell instance (only exists for locally owned ids)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellHandle(pub usize);

/// Recording device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle(pub usize);

/// One directed synaptic connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle(pub usize);

/// Weight-adjusting mechanism attached to a plastic connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdjusterHandle(pub usize);

/// Which synapse on the postsynaptic cell receives the input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynapseTarget {
    #[default]
    Excitatory,
    Inhibitory,
}

impl fmt::Display for SynapseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Excitatory => f.write_str("excitatory"),
            Self::Inhibitory => f.write_str("inhibitory"),
        }
    }
}

impl FromStr for SynapseTarget {
    type Err = PynnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "excitatory" => Ok(Self::Excitatory),
            "inhibitory" => Ok(Self::Inhibitory),
            other => Err(PynnError::InvalidArgument(format!(
                "unknown synapse target '{}'",
                other
            ))),
        }
    }
}

/// Global clock fields, identical on every node at any point queried
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Clock {
    pub t: Time,
    pub dt: Time,
    pub t_start: Time,
    pub min_delay: Delay,
    pub max_delay: Delay,
    pub rank: usize,
    pub num_processes: usize,
}

impl Clock {
    /// Number of whole steps taken so far
    pub fn steps(&self) -> usize {
        (self.t / self.dt).round() as usize
    }
}

/// A simulation engine the core can drive
pub trait Backend {
    /// Short engine name, used in descriptions and log lines
    fn name(&self) -> &'static str;

    /// Instantiate one cell. Unknown native models fail with `InvalidModel`.
    fn create_cell(&mut self, gid: CellId, spec: &CellSpec) -> Result<CellHandle>;

    fn get_parameter(&self, cell: CellHandle, name: &str) -> Result<ParameterValue>;

    fn set_parameter(&mut self, cell: CellHandle, name: &str, value: &ParameterValue) -> Result<()>;

    /// New device for `variable`, tracking no cells yet
    fn create_device(&mut self, variable: &Variable) -> Result<DeviceHandle>;

    /// Replace the device's tracked cells
    fn set_device_cells(&mut self, device: DeviceHandle, cells: &[CellHandle]) -> Result<()>;

    /// Values sampled at the start of each step, shape `[steps, tracked]`,
    /// columns in tracked order, in [`Backend::native_unit`].
    fn device_samples(&self, device: DeviceHandle) -> Result<Array2<f64>>;

    /// Current value of every tracked cell
    fn device_live_values(&self, device: DeviceHandle) -> Result<Vec<f64>>;

    /// Spike times of one tracked cell, in [`Backend::native_unit`]
    fn device_spike_times(&self, device: DeviceHandle, cell: CellHandle) -> Result<Vec<Time>>;

    /// Unit the engine stores `variable` in
    fn native_unit(&self, variable: &Variable) -> Unit;

    /// Connect presynaptic cell `pre` (by gid, may be remote) to a local cell
    fn connect(
        &mut self,
        pre: CellId,
        post: CellHandle,
        target: SynapseTarget,
        weight: Weight,
        delay: Delay,
    ) -> Result<ConnectionHandle>;

    fn weight(&self, connection: ConnectionHandle) -> Result<Weight>;

    fn set_weight(&mut self, connection: ConnectionHandle, weight: Weight) -> Result<()>;

    fn delay(&self, connection: ConnectionHandle) -> Result<Delay>;

    fn set_delay(&mut self, connection: ConnectionHandle, delay: Delay) -> Result<()>;

    /// Switch the `target` synapse of `post` to Tsodyks-Markram dynamics.
    /// Must happen before any connection to that synapse is made.
    fn use_short_term_plasticity(
        &mut self,
        post: CellHandle,
        target: SynapseTarget,
        params: &TsodyksMarkram,
    ) -> Result<()>;

    /// Attach a weight adjuster fed by a pre link and a post link
    fn use_stdp(
        &mut self,
        connection: ConnectionHandle,
        mechanism: &StdpMechanism,
        pre_delay: Delay,
        post_delay: Delay,
    ) -> Result<AdjusterHandle>;

    fn set_stdp_delays(&mut self, adjuster: AdjusterHandle, pre_delay: Delay, post_delay: Delay) -> Result<()>;

    /// `(pre_delay, post_delay)` of the adjuster's two links
    fn stdp_delays(&self, adjuster: AdjusterHandle) -> Result<(Delay, Delay)>;

    /// Advance by one step, from `clock.t` to `clock.t + clock.dt`
    fn advance(&mut self, clock: &Clock) -> Result<()>;

    /// Drop every cell, device and connection
    fn reset(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parsing() {
        assert_eq!("inhibitory".parse::<SynapseTarget>().unwrap(), SynapseTarget::Inhibitory);
        assert!("gaba".parse::<SynapseTarget>().is_err());
        assert_eq!(SynapseTarget::default().to_string(), "excitatory");
    }

    #[test]
    fn test_clock_steps() {
        let clock = Clock {
            t: 1.0,
            dt: 0.1,
            t_start: 0.0,
            min_delay: 0.1,
            max_delay: 10.0,
            rank: 0,
            num_processes: 1,
        };
        assert_eq!(clock.steps(), 10);
    }
}
