//! # pynn-brian
//!
//! Clock-driven backend in the style of Brian.
//!
//! Cells of the same type live in one [`NeuronGroup`] whose state is kept in
//! SI units and advanced in parallel each step. Synaptic events go through a
//! ring-buffer spike queue; recording is done by [`StateMonitor`]s (sampling
//! at the start of every step) and [`SpikeMonitor`]s.
//!
//! Only the standard cell types are supported.

use log::{debug, trace};
use ndarray::Array2;
use pynn_core::cells::{SynapseKind, SynapseShape};
use pynn_core::plasticity::{ShortTermState, WeightAdjuster};
use pynn_core::{
    AdjusterHandle, Backend, CellHandle, CellId, CellSpec, CellType, Clock, ConnectionHandle, Delay,
    DeviceHandle, ParameterValue, Parameters, PynnError, Result, StdpMechanism, SynapseTarget, Time,
    TsodyksMarkram, Unit, Variable, Weight,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::f64::consts::E;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrianError {
    #[error("no cell with handle {0}")]
    UnknownCell(usize),
    #[error("no monitor with handle {0}")]
    UnknownMonitor(usize),
    #[error("no synapse with handle {0}")]
    UnknownSynapse(usize),
    #[error("no STDP synapse with handle {0}")]
    UnknownStdp(usize),
    #[error("{group} has no state variable '{variable}'")]
    UnknownVariable { group: String, variable: String },
    #[error("{target} synapses of cell {gid} are already connected")]
    SynapseInUse { gid: CellId, target: SynapseTarget },
}

impl From<BrianError> for PynnError {
    fn from(e: BrianError) -> Self {
        PynnError::Backend(e.to_string())
    }
}

// ============================================================================
// UNITS
// ============================================================================

/// Unit a standard parameter is given in
fn parameter_unit(name: &str) -> Option<Unit> {
    match name {
        "cm" => Some(Unit::Nanofarad),
        "tau_m" | "tau_refrac" | "tau_syn_E" | "tau_syn_I" | "spike_times" | "start" | "duration" => {
            Some(Unit::Millisecond)
        }
        "v_rest" | "v_thresh" | "v_reset" | "v_init" | "e_rev_E" | "e_rev_I" => Some(Unit::Millivolt),
        "i_offset" => Some(Unit::Nanoampere),
        "rate" => Some(Unit::Hertz),
        _ => None,
    }
}

/// SI counterpart of a prefixed unit
fn si_unit(unit: Unit) -> Unit {
    match unit {
        Unit::Millisecond => Unit::Second,
        Unit::Millivolt => Unit::Volt,
        Unit::Nanoampere => Unit::Ampere,
        Unit::Microsiemens => Unit::Siemens,
        Unit::Nanofarad => Unit::Farad,
        other => other,
    }
}

fn scale(value: &ParameterValue, factor: f64) -> ParameterValue {
    match value {
        ParameterValue::Scalar(x) => ParameterValue::Scalar(x * factor),
        ParameterValue::Vector(v) => ParameterValue::Vector(v.iter().map(|x| x * factor).collect()),
    }
}

fn to_si(name: &str, value: &ParameterValue) -> Result<ParameterValue> {
    let unit = parameter_unit(name)
        .ok_or_else(|| PynnError::InvalidArgument(format!("unknown parameter '{}'", name)))?;
    Ok(scale(value, unit.factor_to(si_unit(unit))?))
}

fn from_si(name: &str, value: &ParameterValue) -> Result<ParameterValue> {
    let unit = parameter_unit(name)
        .ok_or_else(|| PynnError::InvalidArgument(format!("unknown parameter '{}'", name)))?;
    Ok(scale(value, si_unit(unit).factor_to(unit)?))
}

fn scalar(params: &Parameters, name: &str) -> Result<f64> {
    params
        .get(name)
        .and_then(ParameterValue::as_scalar)
        .ok_or_else(|| PynnError::InvalidParameterValue(format!("missing scalar parameter '{}'", name)))
}

/// Weights are nA for current synapses, uS for conductance synapses
fn weight_unit(kind: Option<SynapseKind>) -> Unit {
    match kind {
        Some(SynapseKind::Conductance) => Unit::Microsiemens,
        _ => Unit::Nanoampere,
    }
}

// ============================================================================
// NEURON GROUP
// ============================================================================

/// Integrate-and-fire parameters, SI
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LifParams {
    cm: f64,
    tau_m: f64,
    tau_refrac: f64,
    tau_syn_e: f64,
    tau_syn_i: f64,
    e_rev_e: f64,
    e_rev_i: f64,
    v_rest: f64,
    v_thresh: f64,
    v_reset: f64,
    i_offset: f64,
}

impl LifParams {
    fn from_si(p: &Parameters, kind: SynapseKind) -> Result<Self> {
        let (e_rev_e, e_rev_i) = match kind {
            SynapseKind::Conductance => (scalar(p, "e_rev_E")?, scalar(p, "e_rev_I")?),
            SynapseKind::Current => (0.0, 0.0),
        };
        Ok(Self {
            cm: scalar(p, "cm")?,
            tau_m: scalar(p, "tau_m")?,
            tau_refrac: scalar(p, "tau_refrac")?,
            tau_syn_e: scalar(p, "tau_syn_E")?,
            tau_syn_i: scalar(p, "tau_syn_I")?,
            e_rev_e,
            e_rev_i,
            v_rest: scalar(p, "v_rest")?,
            v_thresh: scalar(p, "v_thresh")?,
            v_reset: scalar(p, "v_reset")?,
            i_offset: scalar(p, "i_offset")?,
        })
    }
}

/// One synaptic conductance/current with its kernel state
#[derive(Debug, Clone, Copy, Default)]
struct SynapticInput {
    g: f64,
    y: f64,
}

impl SynapticInput {
    fn receive(&mut self, amount: f64, shape: SynapseShape) {
        match shape {
            SynapseShape::Exponential => self.g += amount,
            SynapseShape::Alpha => self.y += amount * E,
        }
    }

    fn step(&mut self, dt: f64, tau: f64, shape: SynapseShape) {
        match shape {
            SynapseShape::Exponential => self.g -= self.g / tau * dt,
            SynapseShape::Alpha => {
                self.g += (self.y - self.g) / tau * dt;
                self.y -= self.y / tau * dt;
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Element {
    Lif {
        p: LifParams,
        v: f64,
        inputs: [SynapticInput; 2],
        refractory_until: f64,
        tm: [Option<TsodyksMarkram>; 2],
        n_connections: [usize; 2],
    },
    Generator {
        times: Vec<f64>,
        next: usize,
    },
    Poisson {
        rate: f64,
        start: f64,
        stop: f64,
        rng: ChaCha8Rng,
    },
}

fn input_index(target: SynapseTarget) -> usize {
    match target {
        SynapseTarget::Excitatory => 0,
        SynapseTarget::Inhibitory => 1,
    }
}

impl Element {
    /// Advance from `t` to `t + dt` (seconds), returning spike times
    fn step(&mut self, t: f64, dt: f64, kind: Option<SynapseKind>, shape: Option<SynapseShape>) -> Vec<f64> {
        match self {
            Element::Lif {
                p,
                v,
                inputs,
                refractory_until,
                ..
            } => {
                let shape = shape.unwrap_or(SynapseShape::Exponential);
                if t < *refractory_until {
                    *v = p.v_reset;
                } else {
                    let [exc, inh] = *inputs;
                    let i_syn = match kind {
                        Some(SynapseKind::Conductance) => exc.g * (p.e_rev_e - *v) + inh.g * (p.e_rev_i - *v),
                        _ => exc.g - inh.g,
                    };
                    *v += ((p.v_rest - *v) / p.tau_m + (p.i_offset + i_syn) / p.cm) * dt;
                }
                inputs[0].step(dt, p.tau_syn_e, shape);
                inputs[1].step(dt, p.tau_syn_i, shape);
                if *v >= p.v_thresh {
                    *v = p.v_reset;
                    *refractory_until = t + dt + p.tau_refrac;
                    vec![t + dt]
                } else {
                    vec![]
                }
            }
            Element::Generator { times, next } => {
                let mut out = Vec::new();
                while *next < times.len() && times[*next] < t + dt {
                    out.push(times[*next]);
                    *next += 1;
                }
                out
            }
            Element::Poisson { rate, start, stop, rng } => {
                if t >= *start && t < *stop && rng.gen::<f64>() < *rate * dt {
                    vec![t]
                } else {
                    vec![]
                }
            }
        }
    }

    fn state(&self, variable: &Variable) -> Option<f64> {
        match (self, variable) {
            (Element::Lif { v, .. }, Variable::V) => Some(*v),
            (Element::Lif { inputs, .. }, Variable::GsynExc) => Some(inputs[0].g),
            (Element::Lif { inputs, .. }, Variable::GsynInh) => Some(inputs[1].g),
            _ => None,
        }
    }
}

/// A group of cells of one standard type
#[derive(Debug, Clone)]
pub struct NeuronGroup {
    pub name: String,
    pub cell_type: CellType,
    handles: Vec<CellHandle>,
    gids: Vec<CellId>,
    /// Per-cell parameters, SI
    params: Vec<Parameters>,
    elements: Vec<Element>,
}

impl NeuronGroup {
    pub fn new(cell_type: CellType) -> Self {
        Self {
            name: format!("neurongroup_{}", cell_type.name().to_lowercase()),
            cell_type,
            handles: Vec::new(),
            gids: Vec::new(),
            params: Vec::new(),
            elements: Vec::new(),
        }
    }

    pub fn n(&self) -> usize {
        self.elements.len()
    }

    fn add(&mut self, handle: CellHandle, gid: CellId, params: Parameters, seed: u64, t: f64) -> Result<usize> {
        let element = match self.cell_type {
            CellType::SpikeSourceArray => Element::Generator { times: vec![], next: 0 },
            CellType::SpikeSourcePoisson => Element::Poisson {
                rate: 0.0,
                start: 0.0,
                stop: 0.0,
                rng: ChaCha8Rng::seed_from_u64(seed.wrapping_add(gid.0)),
            },
            _ => {
                let kind = self.cell_type.synapse_kind().unwrap_or(SynapseKind::Current);
                Element::Lif {
                    p: LifParams::from_si(&params, kind)?,
                    v: scalar(&params, "v_init")?,
                    inputs: Default::default(),
                    refractory_until: f64::NEG_INFINITY,
                    tm: [None; 2],
                    n_connections: [0; 2],
                }
            }
        };
        self.handles.push(handle);
        self.gids.push(gid);
        self.params.push(params);
        self.elements.push(element);
        let index = self.n() - 1;
        self.refresh(index, t)?;
        Ok(index)
    }

    /// Push the parameter table of cell `i` into its running state
    fn refresh(&mut self, i: usize, t: f64) -> Result<()> {
        let params = &self.params[i];
        match &mut self.elements[i] {
            Element::Lif { p, v, .. } => {
                let kind = self.cell_type.synapse_kind().unwrap_or(SynapseKind::Current);
                *p = LifParams::from_si(params, kind)?;
                if t == 0.0 {
                    *v = scalar(params, "v_init")?;
                }
            }
            Element::Generator { times, next } => {
                let mut new_times = params
                    .get("spike_times")
                    .and_then(ParameterValue::as_vector)
                    .map(<[f64]>::to_vec)
                    .unwrap_or_default();
                new_times.sort_by(f64::total_cmp);
                *next = new_times.partition_point(|&s| s < t);
                *times = new_times;
            }
            Element::Poisson { rate, start, stop, .. } => {
                *rate = scalar(params, "rate")?;
                *start = scalar(params, "start")?;
                *stop = *start + scalar(params, "duration")?;
            }
        }
        Ok(())
    }

    /// Step every cell in parallel, returning `(handle, spike_time)` pairs
    fn step(&mut self, t: f64, dt: f64) -> Vec<(CellHandle, f64)> {
        let kind = self.cell_type.synapse_kind();
        let shape = self.cell_type.synapse_shape();
        self.elements
            .par_iter_mut()
            .zip(self.handles.par_iter())
            .flat_map_iter(|(element, &h)| element.step(t, dt, kind, shape).into_iter().map(move |s| (h, s)))
            .collect()
    }
}

// ============================================================================
// SYNAPSES
// ============================================================================

#[derive(Debug, Clone)]
struct Synapse {
    pre: CellId,
    post: CellHandle,
    target: SynapseTarget,
    /// SI (A or S)
    w: f64,
    /// Seconds
    delay: f64,
    stp: Option<ShortTermState>,
}

#[derive(Debug, Clone)]
struct StdpSynapse {
    synapse: usize,
    mechanism: StdpMechanism,
    state: WeightAdjuster,
    pre_delay: f64,
    post_delay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueuedEvent {
    Transmit(usize),
    PreToStdp(usize),
    PostToStdp(usize),
}

/// Events bucketed by the step they are due in
#[derive(Debug, Clone, Default)]
struct SpikeQueue {
    /// Step held by `slots[0]`
    offset: u64,
    slots: VecDeque<Vec<QueuedEvent>>,
}

impl SpikeQueue {
    fn push(&mut self, step: u64, event: QueuedEvent) {
        let step = step.max(self.offset);
        let index = (step - self.offset) as usize;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, Vec::new);
        }
        self.slots[index].push(event);
    }

    /// Everything due at or before `step`
    fn pop_due(&mut self, step: u64) -> Vec<QueuedEvent> {
        let mut due = Vec::new();
        while self.offset <= step {
            match self.slots.pop_front() {
                Some(events) => due.extend(events),
                None => {
                    self.offset = step + 1;
                    break;
                }
            }
            self.offset += 1;
        }
        due
    }
}

// ============================================================================
// MONITORS
// ============================================================================

/// Samples a state variable at the start of every step
#[derive(Debug, Clone)]
pub struct StateMonitor {
    pub variable: Variable,
    pub record_indices: Vec<CellHandle>,
    /// Per-cell samples, SI; cells added late are NaN-padded
    values: HashMap<CellHandle, Vec<f64>>,
    rows: usize,
}

/// Exposes the spikes of a set of cells emitted since they were added
#[derive(Debug, Clone)]
pub struct SpikeMonitor {
    pub record_indices: Vec<CellHandle>,
    since: HashMap<CellHandle, f64>,
}

#[derive(Debug, Clone)]
enum Monitor {
    State(StateMonitor),
    Spike(SpikeMonitor),
}

// ============================================================================
// BACKEND
// ============================================================================

/// Brian-style network
#[derive(Debug)]
pub struct BrianBackend {
    seed: u64,
    /// Current time (s)
    t: f64,
    groups: Vec<NeuronGroup>,
    group_of: HashMap<CellType, usize>,
    /// handle -> (group, index in group)
    cells: Vec<(usize, usize)>,
    spikes: Vec<Vec<f64>>,
    synapses: Vec<Synapse>,
    by_pre: HashMap<CellId, Vec<usize>>,
    stdp: Vec<StdpSynapse>,
    stdp_by_post: HashMap<CellHandle, Vec<usize>>,
    monitors: Vec<Monitor>,
    queue: SpikeQueue,
}

impl BrianBackend {
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// `seed` drives the Poisson groups
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            t: 0.0,
            groups: Vec::new(),
            group_of: HashMap::new(),
            cells: Vec::new(),
            spikes: Vec::new(),
            synapses: Vec::new(),
            by_pre: HashMap::new(),
            stdp: Vec::new(),
            stdp_by_post: HashMap::new(),
            monitors: Vec::new(),
            queue: SpikeQueue::default(),
        }
    }

    pub fn groups(&self) -> &[NeuronGroup] {
        &self.groups
    }

    fn locate(&self, cell: CellHandle) -> Result<(usize, usize)> {
        self.cells
            .get(cell.0)
            .copied()
            .ok_or_else(|| BrianError::UnknownCell(cell.0).into())
    }

    fn element(&self, cell: CellHandle) -> Result<&Element> {
        let (g, i) = self.locate(cell)?;
        Ok(&self.groups[g].elements[i])
    }

    fn synapse(&self, connection: ConnectionHandle) -> Result<&Synapse> {
        self.synapses
            .get(connection.0)
            .ok_or_else(|| BrianError::UnknownSynapse(connection.0).into())
    }

    /// SI factor of weights onto `cell`
    fn weight_factor(&self, cell: CellHandle) -> Result<f64> {
        let (g, _) = self.locate(cell)?;
        let unit = weight_unit(self.groups[g].cell_type.synapse_kind());
        unit.factor_to(si_unit(unit))
    }

    fn monitor(&self, device: DeviceHandle) -> Result<&Monitor> {
        self.monitors
            .get(device.0)
            .ok_or_else(|| BrianError::UnknownMonitor(device.0).into())
    }

    fn schedule(&mut self, at: f64, dt: f64, event: QueuedEvent) {
        let step = (at / dt).round().max(0.0) as u64;
        self.queue.push(step, event);
    }

    fn process(&mut self, event: QueuedEvent, t: f64) -> Result<()> {
        let t_ms = t * 1e3;
        match event {
            QueuedEvent::Transmit(s) => {
                let (g, i) = self.locate(self.synapses[s].post)?;
                let group = &mut self.groups[g];
                let shape = group.cell_type.synapse_shape().unwrap_or(SynapseShape::Exponential);
                let synapse = &mut self.synapses[s];
                if let Element::Lif { inputs, tm, .. } = &mut group.elements[i] {
                    let k = input_index(synapse.target);
                    let mut amount = match synapse.target {
                        SynapseTarget::Excitatory => synapse.w,
                        SynapseTarget::Inhibitory => synapse.w.abs(),
                    };
                    if let (Some(tm), Some(state)) = (tm[k], synapse.stp.as_mut()) {
                        amount *= state.on_spike(&tm, t_ms);
                    }
                    inputs[k].receive(amount, shape);
                }
            }
            QueuedEvent::PreToStdp(a) | QueuedEvent::PostToStdp(a) => {
                let s = self.stdp[a].synapse;
                let factor = self.weight_factor(self.synapses[s].post)?;
                let rule = &mut self.stdp[a];
                let w = self.synapses[s].w / factor;
                let w = if matches!(event, QueuedEvent::PreToStdp(_)) {
                    rule.state.on_pre(&rule.mechanism, t_ms, w)
                } else {
                    rule.state.on_post(&rule.mechanism, t_ms, w)
                };
                self.synapses[s].w = w * factor;
            }
        }
        Ok(())
    }
}

impl Default for BrianBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for BrianBackend {
    fn name(&self) -> &'static str {
        "brian"
    }

    fn create_cell(&mut self, gid: CellId, spec: &CellSpec) -> Result<CellHandle> {
        if spec.cell_type.is_native() {
            return Err(PynnError::InvalidModel(format!(
                "'{}' is not a standard cell type, the Brian backend supports only {:?}",
                spec.cell_type,
                CellType::STANDARD.iter().map(CellType::name).collect::<Vec<_>>()
            )));
        }
        let params = spec
            .parameters
            .iter()
            .map(|(name, value)| Ok((name.clone(), to_si(name, value)?)))
            .collect::<Result<Parameters>>()?;

        let g = match self.group_of.get(&spec.cell_type) {
            Some(&g) => g,
            None => {
                self.groups.push(NeuronGroup::new(spec.cell_type.clone()));
                let g = self.groups.len() - 1;
                self.group_of.insert(spec.cell_type.clone(), g);
                debug!("Created {}", self.groups[g].name);
                g
            }
        };
        let handle = CellHandle(self.cells.len());
        let i = self.groups[g].add(handle, gid, params, self.seed, self.t)?;
        self.cells.push((g, i));
        self.spikes.push(Vec::new());
        trace!("gid {} is cell {} of {}", gid, i, self.groups[g].name);
        Ok(handle)
    }

    fn get_parameter(&self, cell: CellHandle, name: &str) -> Result<ParameterValue> {
        let (g, i) = self.locate(cell)?;
        let group = &self.groups[g];
        let value = group.params[i].get(name).ok_or_else(|| BrianError::UnknownVariable {
            group: group.name.clone(),
            variable: name.to_string(),
        })?;
        from_si(name, value)
    }

    fn set_parameter(&mut self, cell: CellHandle, name: &str, value: &ParameterValue) -> Result<()> {
        let (g, i) = self.locate(cell)?;
        let value = to_si(name, value)?;
        let t = self.t;
        let group = &mut self.groups[g];
        group.params[i].insert(name.to_string(), value);
        group.refresh(i, t)
    }

    fn create_device(&mut self, variable: &Variable) -> Result<DeviceHandle> {
        let monitor = match variable {
            Variable::Spikes => Monitor::Spike(SpikeMonitor {
                record_indices: Vec::new(),
                since: HashMap::new(),
            }),
            Variable::V | Variable::GsynExc | Variable::GsynInh => Monitor::State(StateMonitor {
                variable: variable.clone(),
                record_indices: Vec::new(),
                values: HashMap::new(),
                rows: 0,
            }),
            Variable::Other(name) => {
                return Err(PynnError::InvalidArgument(format!("Brian backend cannot record '{}'", name)))
            }
        };
        self.monitors.push(monitor);
        Ok(DeviceHandle(self.monitors.len() - 1))
    }

    fn set_device_cells(&mut self, device: DeviceHandle, cells: &[CellHandle]) -> Result<()> {
        if let Monitor::State(m) = self.monitor(device)? {
            for &h in cells {
                if self.element(h)?.state(&m.variable).is_none() {
                    let (g, _) = self.locate(h)?;
                    return Err(BrianError::UnknownVariable {
                        group: self.groups[g].name.clone(),
                        variable: m.variable.to_string(),
                    }
                    .into());
                }
            }
        } else {
            for &h in cells {
                self.locate(h)?;
            }
        }
        let t = self.t;
        match &mut self.monitors[device.0] {
            Monitor::State(m) => {
                for &h in cells {
                    let rows = m.rows;
                    m.values.entry(h).or_insert_with(|| vec![f64::NAN; rows]);
                }
                m.record_indices = cells.to_vec();
            }
            Monitor::Spike(m) => {
                for &h in cells {
                    m.since.entry(h).or_insert(t);
                }
                m.record_indices = cells.to_vec();
            }
        }
        Ok(())
    }

    fn device_samples(&self, device: DeviceHandle) -> Result<Array2<f64>> {
        match self.monitor(device)? {
            Monitor::State(m) => {
                let columns: Vec<&Vec<f64>> = m.record_indices.iter().filter_map(|h| m.values.get(h)).collect();
                Ok(Array2::from_shape_fn((m.rows, columns.len()), |(r, c)| columns[c][r]))
            }
            Monitor::Spike(m) => Ok(Array2::zeros((0, m.record_indices.len()))),
        }
    }

    fn device_live_values(&self, device: DeviceHandle) -> Result<Vec<f64>> {
        match self.monitor(device)? {
            Monitor::State(m) => m
                .record_indices
                .iter()
                .map(|&h| Ok(self.element(h)?.state(&m.variable).unwrap_or(f64::NAN)))
                .collect(),
            Monitor::Spike(m) => Ok(vec![f64::NAN; m.record_indices.len()]),
        }
    }

    fn device_spike_times(&self, device: DeviceHandle, cell: CellHandle) -> Result<Vec<Time>> {
        let since = match self.monitor(device)? {
            Monitor::Spike(m) => m.since.get(&cell).copied().unwrap_or(0.0),
            Monitor::State(_) => {
                return Err(PynnError::InvalidArgument("state monitors do not record spikes".into()))
            }
        };
        let spikes = self.spikes.get(cell.0).ok_or(BrianError::UnknownCell(cell.0))?;
        Ok(spikes.iter().copied().filter(|&s| s >= since).collect())
    }

    fn native_unit(&self, variable: &Variable) -> Unit {
        match variable {
            Variable::Spikes => Unit::Second,
            Variable::V => Unit::Volt,
            Variable::GsynExc | Variable::GsynInh => Unit::Siemens,
            Variable::Other(_) => Unit::Dimensionless,
        }
    }

    fn connect(&mut self, pre: CellId, post: CellHandle, target: SynapseTarget, weight: Weight, delay: Delay) -> Result<ConnectionHandle> {
        let factor = self.weight_factor(post)?;
        let (g, i) = self.locate(post)?;
        let group = &mut self.groups[g];
        let stp = match &mut group.elements[i] {
            Element::Lif { tm, n_connections, .. } => {
                let k = input_index(target);
                n_connections[k] += 1;
                tm[k].as_ref().map(ShortTermState::new)
            }
            _ => {
                return Err(PynnError::InvalidArgument(format!(
                    "{} cells cannot receive connections",
                    group.cell_type
                )))
            }
        };
        self.synapses.push(Synapse {
            pre,
            post,
            target,
            w: weight * factor,
            delay: delay * 1e-3,
            stp,
        });
        let s = self.synapses.len() - 1;
        self.by_pre.entry(pre).or_default().push(s);
        Ok(ConnectionHandle(s))
    }

    fn weight(&self, connection: ConnectionHandle) -> Result<Weight> {
        let synapse = self.synapse(connection)?;
        Ok(synapse.w / self.weight_factor(synapse.post)?)
    }

    fn set_weight(&mut self, connection: ConnectionHandle, weight: Weight) -> Result<()> {
        let factor = self.weight_factor(self.synapse(connection)?.post)?;
        self.synapses[connection.0].w = weight * factor;
        Ok(())
    }

    fn delay(&self, connection: ConnectionHandle) -> Result<Delay> {
        Ok(self.synapse(connection)?.delay * 1e3)
    }

    fn set_delay(&mut self, connection: ConnectionHandle, delay: Delay) -> Result<()> {
        self.synapse(connection)?;
        self.synapses[connection.0].delay = delay * 1e-3;
        Ok(())
    }

    fn use_short_term_plasticity(&mut self, post: CellHandle, target: SynapseTarget, params: &TsodyksMarkram) -> Result<()> {
        let (g, i) = self.locate(post)?;
        let gid = self.groups[g].gids[i];
        match &mut self.groups[g].elements[i] {
            Element::Lif { tm, n_connections, .. } => {
                let k = input_index(target);
                if n_connections[k] > 0 {
                    return Err(BrianError::SynapseInUse { gid, target }.into());
                }
                tm[k] = Some(*params);
                Ok(())
            }
            _ => Err(PynnError::InvalidArgument(format!("cell {} has no synapses", gid))),
        }
    }

    fn use_stdp(&mut self, connection: ConnectionHandle, mechanism: &StdpMechanism, pre_delay: Delay, post_delay: Delay) -> Result<AdjusterHandle> {
        let post = self.synapse(connection)?.post;
        self.stdp.push(StdpSynapse {
            synapse: connection.0,
            mechanism: *mechanism,
            state: WeightAdjuster::default(),
            pre_delay: pre_delay * 1e-3,
            post_delay: post_delay * 1e-3,
        });
        let a = self.stdp.len() - 1;
        self.stdp_by_post.entry(post).or_default().push(a);
        Ok(AdjusterHandle(a))
    }

    fn set_stdp_delays(&mut self, adjuster: AdjusterHandle, pre_delay: Delay, post_delay: Delay) -> Result<()> {
        let rule = self
            .stdp
            .get_mut(adjuster.0)
            .ok_or(BrianError::UnknownStdp(adjuster.0))?;
        rule.pre_delay = pre_delay * 1e-3;
        rule.post_delay = post_delay * 1e-3;
        Ok(())
    }

    fn stdp_delays(&self, adjuster: AdjusterHandle) -> Result<(Delay, Delay)> {
        let rule = self.stdp.get(adjuster.0).ok_or(BrianError::UnknownStdp(adjuster.0))?;
        Ok((rule.pre_delay * 1e3, rule.post_delay * 1e3))
    }

    fn advance(&mut self, clock: &Clock) -> Result<()> {
        let (t, dt) = (clock.t * 1e-3, clock.dt * 1e-3);
        let step = clock.steps() as u64;
        self.t = t;

        // when = 'start'
        for monitor in &mut self.monitors {
            if let Monitor::State(m) = monitor {
                for &h in &m.record_indices {
                    let (g, i) = self.cells[h.0];
                    let value = self.groups[g].elements[i].state(&m.variable).unwrap_or(f64::NAN);
                    m.values.entry(h).or_default().push(value);
                }
                m.rows += 1;
            }
        }

        for event in self.queue.pop_due(step) {
            self.process(event, t)?;
        }

        let spikes: Vec<(CellHandle, f64)> = self.groups.iter_mut().flat_map(|g| g.step(t, dt)).collect();

        for (h, s) in spikes {
            self.spikes[h.0].push(s);
            let (g, i) = self.cells[h.0];
            let gid = self.groups[g].gids[i];
            let outgoing: Vec<usize> = self.by_pre.get(&gid).cloned().unwrap_or_default();
            for syn in outgoing {
                let delay = self.synapses[syn].delay;
                self.schedule(s + delay, dt, QueuedEvent::Transmit(syn));
            }
            let pre_rules: Vec<(usize, f64)> = self
                .stdp
                .iter()
                .enumerate()
                .filter(|(_, r)| self.synapses[r.synapse].pre == gid)
                .map(|(a, r)| (a, r.pre_delay))
                .collect();
            for (a, d) in pre_rules {
                self.schedule(s + d, dt, QueuedEvent::PreToStdp(a));
            }
            let post_rules: Vec<(usize, f64)> = self
                .stdp_by_post
                .get(&h)
                .map(|rules| rules.iter().map(|&a| (a, self.stdp[a].post_delay)).collect())
                .unwrap_or_default();
            for (a, d) in post_rules {
                self.schedule(s + d, dt, QueuedEvent::PostToStdp(a));
            }
        }
        self.t = t + dt;
        Ok(())
    }

    fn reset(&mut self) {
        *self = Self::with_seed(self.seed);
    }
}

// ============================================================================
// TESTS
// ============================================================================
