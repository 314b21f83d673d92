//! Recorders: which cells have a variable captured, and how the backend's
//! device output is turned into segments.

use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::backend::{CellHandle, DeviceHandle};
use crate::identity::CellId;
use crate::segment::{AnalogSignalArray, Segment, SpikeTrain, Unit};
use crate::state::Simulation;
use crate::{PynnError, Result};

/// A recordable quantity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Variable {
    Spikes,
    V,
    GsynExc,
    GsynInh,
    Other(String),
}

impl Variable {
    pub fn name(&self) -> &str {
        match self {
            Self::Spikes => "spikes",
            Self::V => "v",
            Self::GsynExc => "gsyn_exc",
            Self::GsynInh => "gsyn_inh",
            Self::Other(name) => name,
        }
    }

    /// Spikes are events, everything else is sampled every step
    pub fn is_event(&self) -> bool {
        matches!(self, Self::Spikes)
    }

    /// Unit recorded data is reported in
    pub fn units(&self) -> Unit {
        match self {
            Self::Spikes => Unit::Millisecond,
            Self::V => Unit::Millivolt,
            Self::GsynExc | Self::GsynInh => Unit::Microsiemens,
            Self::Other(_) => Unit::Dimensionless,
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<String> for Variable {
    fn from(s: String) -> Self {
        match s.as_str() {
            "spikes" => Self::Spikes,
            "v" => Self::V,
            "gsyn_exc" => Self::GsynExc,
            "gsyn_inh" => Self::GsynInh,
            _ => Self::Other(s),
        }
    }
}

impl From<Variable> for String {
    fn from(v: Variable) -> Self {
        v.name().to_string()
    }
}

impl FromStr for Variable {
    type Err = PynnError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(PynnError::InvalidArgument("empty variable name".into()));
        }
        Ok(Self::from(s.to_string()))
    }
}

/// Where a recorder's cells come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderSource {
    pub label: String,
    pub description: String,
    /// Channel indexes are offsets from this id
    pub first_id: CellId,
}

/// Lifecycle of the backend device behind a recorder
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceState {
    Uncreated,
    /// Device exists but tracks no cells
    Attached(DeviceHandle),
    Accumulating {
        device: DeviceHandle,
        /// Column order of the device output
        tracked: Vec<CellHandle>,
    },
}

impl DeviceState {
    pub fn device(&self) -> Option<DeviceHandle> {
        match self {
            Self::Uncreated => None,
            Self::Attached(device) | Self::Accumulating { device, .. } => Some(*device),
        }
    }
}

/// Records one variable for a set of local cells
#[derive(Debug, Clone)]
pub struct Recorder {
    variable: Variable,
    source: Option<RecorderSource>,
    recorded: BTreeSet<CellId>,
    device: DeviceState,
}

impl Recorder {
    /// Recorder not tied to any population
    pub fn new(variable: Variable) -> Self {
        Self {
            variable,
            source: None,
            recorded: BTreeSet::new(),
            device: DeviceState::Uncreated,
        }
    }

    pub fn for_population(variable: Variable, source: RecorderSource) -> Self {
        Self {
            source: Some(source),
            ..Self::new(variable)
        }
    }

    pub fn variable(&self) -> &Variable {
        &self.variable
    }

    pub fn source(&self) -> Option<&RecorderSource> {
        self.source.as_ref()
    }

    pub fn device_state(&self) -> &DeviceState {
        &self.device
    }

    pub fn recorded(&self) -> &BTreeSet<CellId> {
        &self.recorded
    }

    /// Add cells to the recorded set. Remote ids are ignored.
    pub fn record(&mut self, sim: &mut Simulation, ids: impl IntoIterator<Item = CellId>) -> Result<()> {
        let before = self.recorded.len();
        for id in ids {
            if sim.is_local(id) {
                if sim.handle(id).is_none() {
                    return Err(PynnError::IndexError(format!("cell {} does not exist", id)));
                }
                self.recorded.insert(id);
            }
        }
        debug!(
            "Recording {} from {} local cells ({} new)",
            self.variable,
            self.recorded.len(),
            self.recorded.len() - before
        );
        self.sync_device(sim)
    }

    /// Create the device on first use, else extend the cells it tracks.
    fn sync_device(&mut self, sim: &mut Simulation) -> Result<()> {
        let device = match self.device.device() {
            Some(device) => device,
            None => {
                let device = sim.backend_mut().create_device(&self.variable)?;
                self.device = DeviceState::Attached(device);
                device
            }
        };
        let tracked = self
            .recorded
            .iter()
            .map(|&id| sim.handle(id).ok_or_else(|| PynnError::IndexError(format!("cell {} is not local", id))))
            .collect::<Result<Vec<_>>>()?;
        if tracked.is_empty() {
            return Ok(());
        }
        sim.backend_mut().set_device_cells(device, &tracked)?;
        self.device = DeviceState::Accumulating { device, tracked };
        Ok(())
    }

    /// Recorded ids, restricted to `filter` when given
    pub fn filter_recorded(&self, filter: Option<&[CellId]>) -> Vec<CellId> {
        match filter {
            None => self.recorded.iter().copied().collect(),
            Some(filter) => {
                let filter: BTreeSet<CellId> = filter.iter().copied().collect();
                self.recorded.intersection(&filter).copied().collect()
            }
        }
    }

    fn label(&self) -> String {
        self.source.as_ref().map(|s| s.label.clone()).unwrap_or_default()
    }

    fn channel_index(&self, id: CellId) -> usize {
        let first = self.source.as_ref().map_or(0, |s| s.first_id.0);
        (id.0 - first) as usize
    }

    /// Build a fresh segment from everything recorded so far
    pub fn get_current_segment(&self, sim: &Simulation, filter: Option<&[CellId]>) -> Result<Segment> {
        let label = self.label();
        let description = self.source.as_ref().map(|s| s.description.clone()).unwrap_or_default();
        let ids = self.filter_recorded(filter);

        let (device, tracked) = match &self.device {
            DeviceState::Accumulating { device, tracked } => (*device, tracked),
            _ => return Ok(Segment::new(label, description, vec![], vec![])),
        };
        let backend = sim.backend();
        let factor = backend.native_unit(&self.variable).factor_to(self.variable.units())?;

        if self.variable.is_event() {
            let spiketrains = ids
                .iter()
                .map(|&id| {
                    let handle = self.handle_of(sim, id)?;
                    let times = backend.device_spike_times(device, handle)?;
                    Ok(SpikeTrain {
                        times: times.into_iter().map(|t| t * factor).collect(),
                        t_start: sim.clock().t_start,
                        t_stop: sim.t(),
                        units: self.variable.units(),
                        source_population: label.clone(),
                        source_id: id,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            return Ok(Segment::new(label, description, spiketrains, vec![]));
        }

        let samples = backend.device_samples(device)?;
        let live = backend.device_live_values(device)?;
        if samples.ncols() != tracked.len() || live.len() != tracked.len() {
            return Err(PynnError::Backend(format!(
                "device for {} returned {} columns and {} live values for {} cells",
                self.variable,
                samples.ncols(),
                live.len(),
                tracked.len()
            )));
        }
        let columns = ids
            .iter()
            .map(|&id| {
                let handle = self.handle_of(sim, id)?;
                tracked
                    .iter()
                    .position(|&h| h == handle)
                    .ok_or_else(|| PynnError::Backend(format!("cell {} is not tracked by its device", id)))
            })
            .collect::<Result<Vec<_>>>()?;

        let n_rows = samples.nrows() + 1;
        let mut signal = Array2::zeros((n_rows, columns.len()));
        for (out, &col) in columns.iter().enumerate() {
            for row in 0..samples.nrows() {
                signal[[row, out]] = samples[[row, col]] * factor;
            }
            signal[[n_rows - 1, out]] = live[col] * factor;
        }

        let signal = AnalogSignalArray {
            name: self.variable.name().to_string(),
            signal,
            units: self.variable.units(),
            t_start: sim.clock().t_start,
            sampling_period: sim.dt(),
            source_population: label.clone(),
            channel_indexes: ids.iter().map(|&id| self.channel_index(id)).collect(),
            source_ids: ids,
        };
        Ok(Segment::new(label, description, vec![], vec![signal]))
    }

    /// Spike count of every recorded cell
    pub fn local_count(&self, sim: &Simulation, filter: Option<&[CellId]>) -> Result<BTreeMap<CellId, usize>> {
        if !self.variable.is_event() {
            return Err(PynnError::InvalidArgument(format!(
                "only spikes can be counted, not {}",
                self.variable
            )));
        }
        let ids = self.filter_recorded(filter);
        let Some(device) = self.device.device() else {
            return Ok(ids.into_iter().map(|id| (id, 0)).collect());
        };
        ids.into_iter()
            .map(|id| {
                let handle = self.handle_of(sim, id)?;
                Ok((id, sim.backend().device_spike_times(device, handle)?.len()))
            })
            .collect()
    }

    /// Recording state can only be cleared by a full simulation reset.
    pub fn reset(&mut self) -> Result<()> {
        Err(PynnError::UnsupportedConfiguration(
            "recorders cannot be reset independently of the simulation".into(),
        ))
    }

    fn handle_of(&self, sim: &Simulation, id: CellId) -> Result<CellHandle> {
        sim.handle(id)
            .ok_or_else(|| PynnError::IndexError(format!("cell {} is not local", id)))
    }
}
