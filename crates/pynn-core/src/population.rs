//! Populations: shaped groups of cells of one type.

use log::{debug, info};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::backend::CellHandle;
use crate::cells::{CellSpec, CellType, ParameterValue, Parameters};
use crate::identity::CellId;
use crate::random::RandomDistribution;
use crate::recording::{Recorder, RecorderSource, Variable};
use crate::segment::Segment;
use crate::state::Simulation;
use crate::{PynnError, Result};

/// Position of a cell inside a population, one index per dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub Vec<usize>);

impl From<Vec<usize>> for Address {
    fn from(v: Vec<usize>) -> Self {
        Self(v)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(usize::to_string).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

impl FromStr for Address {
    type Err = PynnError;

    /// Parses `[i]`, `[i, j]` or `[i, j, k]`
    fn from_str(s: &str) -> Result<Self> {
        let inner = s
            .trim()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| PynnError::Parse(format!("'{}' is not a bracketed address", s)))?;
        inner
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<usize>()
                    .map_err(|e| PynnError::Parse(format!("bad index '{}' in address '{}': {}", part, s, e)))
            })
            .collect::<Result<Vec<_>>>()
            .map(Address)
    }
}

/// Shape plus first id: everything needed to turn ids into addresses and back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    shape: Vec<usize>,
    first_id: CellId,
}

impl Layout {
    pub fn new(shape: Vec<usize>, first_id: CellId) -> Self {
        Self { shape, first_id }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn first_id(&self) -> CellId {
        self.first_id
    }

    pub fn last_id(&self) -> CellId {
        CellId(self.first_id.0 + self.size() as u64 - 1)
    }

    pub fn contains(&self, id: CellId) -> bool {
        id >= self.first_id && id <= self.last_id()
    }

    /// Flat (row-major) index of `id`
    pub fn offset(&self, id: CellId) -> Option<usize> {
        self.contains(id).then(|| (id.0 - self.first_id.0) as usize)
    }

    /// Id at a flat index
    pub fn id_at(&self, index: usize) -> Option<CellId> {
        (index < self.size()).then(|| CellId(self.first_id.0 + index as u64))
    }

    /// Address of `id`, inverting row-major flattening
    pub fn locate(&self, id: CellId) -> Result<Address> {
        if self.ndim() > 3 {
            return Err(PynnError::InvalidDimensions(format!(
                "cannot locate cells in a {}-dimensional population",
                self.ndim()
            )));
        }
        let offset = self.offset(id).ok_or_else(|| {
            PynnError::IndexError(format!(
                "id {} is outside {}..={}",
                id,
                self.first_id,
                self.last_id()
            ))
        })?;
        let address = match self.shape.as_slice() {
            [_] => vec![offset],
            [_, cols] => vec![offset / cols, offset % cols],
            [_, rows, cols] => vec![offset / (rows * cols), (offset % (rows * cols)) / cols, offset % cols],
            _ => {
                return Err(PynnError::InvalidDimensions(
                    "population has no dimensions".into(),
                ))
            }
        };
        Ok(Address(address))
    }

    /// Flat index of an address, bounds-checked
    pub fn flat_index(&self, address: &Address) -> Result<usize> {
        if address.0.len() != self.ndim() {
            return Err(PynnError::InvalidDimensions(format!(
                "address {} has {} indices, population has {} dimensions",
                address,
                address.0.len(),
                self.ndim()
            )));
        }
        let mut index = 0;
        for (&i, &n) in address.0.iter().zip(&self.shape) {
            if i >= n {
                return Err(PynnError::IndexError(format!(
                    "address {} is out of bounds for shape {:?}",
                    address, self.shape
                )));
            }
            index = index * n + i;
        }
        Ok(index)
    }
}

/// Value(s) for a bulk parameter assignment
#[derive(Debug, Clone, PartialEq)]
pub enum CellValues {
    /// Same value on every local cell
    Scalar(ParameterValue),
    /// Individual values keyed by cell id
    PerCell(BTreeMap<CellId, ParameterValue>),
}

impl From<f64> for CellValues {
    fn from(x: f64) -> Self {
        Self::Scalar(ParameterValue::Scalar(x))
    }
}

/// Which cells to record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSelection {
    All,
    /// Random subset drawn from a permutation of all cells
    Count(usize),
    Cells(Vec<CellId>),
}

/// A shaped collection of cells of one type
#[derive(Debug)]
pub struct Population {
    label: String,
    spec: CellSpec,
    layout: Layout,
    all_cells: ArrayD<CellId>,
    handles: Vec<Option<CellHandle>>,
    local_cells: Vec<CellId>,
    recorders: BTreeMap<Variable, Recorder>,
}

impl Population {
    /// Create the cells of a new population; the ones owned by this node are
    /// instantiated in the backend straight away.
    pub fn new(
        sim: &mut Simulation,
        shape: &[usize],
        cell_type: CellType,
        parameters: Parameters,
        label: Option<&str>,
    ) -> Result<Self> {
        if shape.is_empty() {
            return Err(PynnError::InvalidDimensions("population shape is empty".into()));
        }
        let spec = CellSpec::new(cell_type, parameters)?;
        let size: usize = shape.iter().product();
        let created = sim.create(&spec, size)?;

        let ids: Vec<CellId> = created.ids().collect();
        let all_cells = ArrayD::from_shape_vec(IxDyn(shape), ids)
            .map_err(|e| PynnError::InvalidDimensions(e.to_string()))?;
        let local_cells: Vec<CellId> = created.local_ids().collect();
        let label = match label {
            Some(label) => label.to_string(),
            None => sim.next_population_label(),
        };
        let layout = Layout::new(shape.to_vec(), created.range.first);

        let mut population = Self {
            label,
            spec,
            layout,
            all_cells,
            handles: created.handles,
            local_cells,
            recorders: BTreeMap::new(),
        };
        for variable in [Variable::Spikes, Variable::V] {
            population.recorder_mut(variable);
        }
        info!(
            "Created population '{}' of {} {} cells ({} local)",
            population.label,
            size,
            population.spec.cell_type,
            population.local_cells.len()
        );
        Ok(population)
    }

    fn recorder_mut(&mut self, variable: Variable) -> &mut Recorder {
        let source = RecorderSource {
            label: self.label.clone(),
            description: self.describe(),
            first_id: self.layout.first_id(),
        };
        self.recorders
            .entry(variable.clone())
            .or_insert_with(|| Recorder::for_population(variable, source))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cell_type(&self) -> &CellType {
        &self.spec.cell_type
    }

    pub fn spec(&self) -> &CellSpec {
        &self.spec
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    pub fn ndim(&self) -> usize {
        self.layout.ndim()
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn first_id(&self) -> CellId {
        self.layout.first_id()
    }

    pub fn last_id(&self) -> CellId {
        self.layout.last_id()
    }

    /// Every cell, local or not, in row-major order
    pub fn all(&self) -> impl Iterator<Item = CellId> + '_ {
        self.all_cells.iter().copied()
    }

    pub fn local_cells(&self) -> &[CellId] {
        &self.local_cells
    }

    pub fn is_local(&self, id: CellId) -> bool {
        self.handle(id).is_some()
    }

    /// Backend handle of a local cell of this population
    pub fn handle(&self, id: CellId) -> Option<CellHandle> {
        self.layout.offset(id).and_then(|i| self.handles[i])
    }

    pub fn recorder(&self, variable: &Variable) -> Option<&Recorder> {
        self.recorders.get(variable)
    }

    pub fn locate(&self, id: CellId) -> Result<Address> {
        self.layout.locate(id)
    }

    /// Cell at `address`
    pub fn get(&self, address: &Address) -> Result<CellId> {
        self.layout.flat_index(address)?;
        let id = self.all_cells[IxDyn(&address.0)];
        if self.locate(id)? != *address {
            return Err(PynnError::IndexError(format!(
                "cell {} found at {} but locates to {}",
                id,
                address,
                self.locate(id)?
            )));
        }
        Ok(id)
    }

    /// Cell at flat index `n`
    pub fn index(&self, n: usize) -> Result<CellId> {
        self.layout.id_at(n).ok_or_else(|| {
            PynnError::IndexError(format!("index {} out of range for population of {}", n, self.size()))
        })
    }

    /// Addresses of the local cells
    pub fn addresses(&self) -> Result<Vec<Address>> {
        self.local_cells.iter().map(|&id| self.locate(id)).collect()
    }

    pub fn describe(&self) -> String {
        format!(
            "Population \"{}\"\n    Dimensions: {:?}\n    Local cells: {}\n    Cell type: {}\n    ID range: {}-{}",
            self.label,
            self.layout.shape(),
            self.local_cells.len(),
            self.spec.cell_type,
            self.first_id(),
            self.last_id()
        )
    }

    /// Value of `name` on every local cell
    pub fn get_parameter(&self, sim: &Simulation, name: &str) -> Result<Vec<ParameterValue>> {
        self.local_handles()
            .map(|(_, handle)| sim.backend().get_parameter(handle, name))
            .collect()
    }

    fn local_handles(&self) -> impl Iterator<Item = (CellId, CellHandle)> + '_ {
        self.local_cells
            .iter()
            .filter_map(|&id| self.handle(id).map(|h| (id, h)))
    }

    fn check_value(&self, name: &str, value: &ParameterValue) -> Result<()> {
        if self.spec.cell_type.is_native() {
            return Ok(());
        }
        match self.spec.parameters.get(name) {
            None => Err(PynnError::InvalidParameterValue(format!(
                "{} has no parameter '{}'",
                self.spec.cell_type, name
            ))),
            Some(current) if std::mem::discriminant(current) != std::mem::discriminant(value) => {
                Err(PynnError::InvalidParameterValue(format!(
                    "unsupported value {} for {}.{}",
                    value, self.spec.cell_type, name
                )))
            }
            Some(_) => Ok(()),
        }
    }

    /// Set a parameter on all local cells
    pub fn set(&mut self, sim: &mut Simulation, name: &str, values: CellValues) -> Result<()> {
        let assignments: Vec<(CellHandle, ParameterValue)> = match values {
            CellValues::Scalar(value) => {
                self.check_value(name, &value)?;
                self.local_handles().map(|(_, h)| (h, value.clone())).collect()
            }
            CellValues::PerCell(map) => {
                let mut out = Vec::new();
                for (id, value) in map {
                    if !self.layout.contains(id) {
                        return Err(PynnError::InvalidParameterValue(format!(
                            "cell {} is not in population '{}'",
                            id, self.label
                        )));
                    }
                    self.check_value(name, &value)?;
                    if let Some(handle) = self.handle(id) {
                        out.push((handle, value));
                    }
                }
                out
            }
        };
        for (handle, value) in &assignments {
            sim.backend_mut().set_parameter(*handle, name, value)?;
        }
        debug!("Set {} on {} cells of '{}'", name, assignments.len(), self.label);
        Ok(())
    }

    /// Set several parameters, each broadcast to every local cell
    pub fn set_parameters(&mut self, sim: &mut Simulation, parameters: &Parameters) -> Result<()> {
        for (name, value) in parameters {
            self.set(sim, name, CellValues::Scalar(value.clone()))?;
        }
        Ok(())
    }

    /// Topographic set: `values` has the population's shape, optionally with
    /// one trailing dimension for vector-valued parameters.
    pub fn tset(&mut self, sim: &mut Simulation, name: &str, values: &ArrayD<f64>) -> Result<()> {
        let shape = self.layout.shape();
        let width = if values.shape() == shape {
            None
        } else if values.ndim() == shape.len() + 1 && &values.shape()[..shape.len()] == shape {
            Some(values.shape()[shape.len()])
        } else {
            return Err(PynnError::InvalidDimensions(format!(
                "value array has shape {:?}, population has shape {:?}",
                values.shape(),
                shape
            )));
        };

        let flat: Vec<f64> = values.iter().copied().collect();
        let mut per_cell = BTreeMap::new();
        for &id in &self.local_cells {
            let i = self.layout.offset(id).ok_or_else(|| PynnError::IndexError(id.to_string()))?;
            let value = match width {
                None => ParameterValue::Scalar(flat[i]),
                Some(k) => ParameterValue::Vector(flat[i * k..(i + 1) * k].to_vec()),
            };
            per_cell.insert(id, value);
        }
        self.set(sim, name, CellValues::PerCell(per_cell))
    }

    /// Random set: one draw per cell of the whole population, so every node
    /// consumes the stream identically, then only local cells are assigned.
    pub fn rset(&mut self, sim: &mut Simulation, name: &str, distribution: &mut RandomDistribution) -> Result<()> {
        let draws = distribution.next_n(self.size());
        let per_cell = self
            .local_cells
            .iter()
            .filter_map(|&id| self.layout.offset(id).map(|i| (id, ParameterValue::Scalar(draws[i]))))
            .collect();
        self.set(sim, name, CellValues::PerCell(per_cell))
    }

    /// Randomise initial membrane potentials
    pub fn random_init(&mut self, sim: &mut Simulation, distribution: &mut RandomDistribution) -> Result<()> {
        self.rset(sim, "v_init", distribution)
    }

    fn resolve_selection(&self, sim: &mut Simulation, selection: RecordSelection) -> Result<Vec<CellId>> {
        match selection {
            RecordSelection::All => Ok(self.all().collect()),
            RecordSelection::Count(n) => {
                if n > self.size() {
                    return Err(PynnError::InvalidArgument(format!(
                        "cannot record {} cells from a population of {}",
                        n,
                        self.size()
                    )));
                }
                let all: Vec<CellId> = self.all().collect();
                let mut rng = sim.next_stream();
                let mut chosen = rng.permutation(&all);
                chosen.truncate(n / sim.num_processes());
                Ok(chosen)
            }
            RecordSelection::Cells(ids) => {
                if let Some(id) = ids.iter().find(|&&id| !self.layout.contains(id)) {
                    return Err(PynnError::IndexError(format!(
                        "cell {} is not in population '{}'",
                        id, self.label
                    )));
                }
                Ok(ids)
            }
        }
    }

    fn record_variable(&mut self, sim: &mut Simulation, variable: Variable, selection: RecordSelection) -> Result<()> {
        if !self.spec.cell_type.recordable().contains(&variable) {
            return Err(PynnError::InvalidArgument(format!(
                "{} cannot record {}",
                self.spec.cell_type, variable
            )));
        }
        let ids = self.resolve_selection(sim, selection)?;
        self.recorder_mut(variable).record(sim, ids)
    }

    /// Record spikes
    pub fn record(&mut self, sim: &mut Simulation, selection: RecordSelection) -> Result<()> {
        self.record_variable(sim, Variable::Spikes, selection)
    }

    /// Record the membrane potential
    pub fn record_v(&mut self, sim: &mut Simulation, selection: RecordSelection) -> Result<()> {
        self.record_variable(sim, Variable::V, selection)
    }

    /// Record both synaptic conductances
    pub fn record_gsyn(&mut self, sim: &mut Simulation, selection: RecordSelection) -> Result<()> {
        let ids = self.resolve_selection(sim, selection)?;
        self.record_variable(sim, Variable::GsynExc, RecordSelection::Cells(ids.clone()))?;
        self.record_variable(sim, Variable::GsynInh, RecordSelection::Cells(ids))
    }

    /// Everything recorded so far for `variables`, optionally restricted to `filter`
    pub fn get_data(&self, sim: &Simulation, variables: &[Variable], filter: Option<&[CellId]>) -> Result<Segment> {
        let parts = variables
            .iter()
            .filter_map(|v| self.recorders.get(v))
            .map(|rec| rec.get_current_segment(sim, filter))
            .collect::<Result<Vec<_>>>()?;
        Ok(Segment::combine(self.label.clone(), self.describe(), parts))
    }

    /// Spike count of every recorded local cell
    pub fn get_spike_counts(&self, sim: &Simulation, filter: Option<&[CellId]>) -> Result<BTreeMap<CellId, usize>> {
        match self.recorders.get(&Variable::Spikes) {
            Some(rec) => rec.local_count(sim, filter),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Mean number of spikes per recorded local cell
    pub fn mean_spike_count(&self, sim: &Simulation) -> Result<f64> {
        let counts = self.get_spike_counts(sim, None)?;
        if counts.is_empty() {
            return Ok(0.0);
        }
        Ok(counts.values().sum::<usize>() as f64 / counts.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_2d() {
        let layout = Layout::new(vec![3, 4], CellId(10));
        assert_eq!(layout.locate(CellId(10)).unwrap(), Address(vec![0, 0]));
        assert_eq!(layout.locate(CellId(17)).unwrap(), Address(vec![1, 3]));
        assert_eq!(layout.locate(CellId(21)).unwrap(), Address(vec![2, 3]));
        assert!(matches!(layout.locate(CellId(22)), Err(PynnError::IndexError(_))));
    }

    #[test]
    fn test_locate_3d_inverts_flat_index() {
        let layout = Layout::new(vec![2, 3, 4], CellId(0));
        for id in 0..24 {
            let addr = layout.locate(CellId(id)).unwrap();
            assert_eq!(layout.flat_index(&addr).unwrap(), id as usize);
        }
        assert_eq!(layout.locate(CellId(13)).unwrap(), Address(vec![1, 0, 1]));
    }

    #[test]
    fn test_locate_rejects_high_rank() {
        let layout = Layout::new(vec![2, 2, 2, 2], CellId(0));
        assert!(matches!(layout.locate(CellId(0)), Err(PynnError::InvalidDimensions(_))));
    }

    #[test]
    fn test_flat_index_errors() {
        let layout = Layout::new(vec![3, 4], CellId(0));
        assert!(matches!(layout.flat_index(&Address(vec![1])), Err(PynnError::InvalidDimensions(_))));
        assert!(matches!(layout.flat_index(&Address(vec![3, 0])), Err(PynnError::IndexError(_))));
    }

    #[test]
    fn test_address_format() {
        assert_eq!(Address(vec![4]).to_string(), "[4]");
        assert_eq!(Address(vec![1, 2, 3]).to_string(), "[1, 2, 3]");
        assert_eq!("[1, 2]".parse::<Address>().unwrap(), Address(vec![1, 2]));
        assert!("(1, 2)".parse::<Address>().is_err());
        assert!("[a]".parse::<Address>().is_err());
    }
}
