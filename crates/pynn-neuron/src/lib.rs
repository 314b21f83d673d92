//! # pynn-neuron
//!
//! Compartmental backend in the style of NEURON.
//!
//! ## Key Concepts
//!
//! - **Sections**: every cell is a single-compartment soma
//! - **Templates**: `StandardIF`, `VectorSpikeSource`, `RandomSpikeSource`
//! - **NetCons**: delayed event connections from a presynaptic gid to a
//!   synapse on a local cell
//! - **Weight adjusters**: STDP mechanisms fed by a `pre2wa` and a `post2wa`
//!   link, each carrying part of the connection delay
//! - **Vectors**: recording devices sampling at the start of each step
//!
//! Parameters are stored under NEURON names and translated to and from the
//! standard cell-type names at the boundary.

use log::{debug, trace};
use ndarray::Array2;
use pynn_core::cells::{SynapseKind, SynapseShape};
use pynn_core::plasticity::{ShortTermState, WeightAdjuster};
use pynn_core::{
    AdjusterHandle, Backend, CellHandle, CellId, CellSpec, CellType, Clock, ConnectionHandle, Delay,
    DeviceHandle, ParameterValue, PynnError, Result, StdpMechanism, SynapseTarget, Time, TsodyksMarkram, Unit,
    Variable, Weight,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::f64::consts::{E, PI};
use thiserror::Error;

/// Backend-specific failures, surfaced as [`PynnError::Backend`]
#[derive(Debug, Error)]
pub enum NeuronError {
    #[error("no cell with handle {0}")]
    UnknownCell(usize),

    #[error("no recording device with handle {0}")]
    UnknownDevice(usize),

    #[error("no NetCon with handle {0}")]
    UnknownNetCon(usize),

    #[error("no weight adjuster with handle {0}")]
    UnknownAdjuster(usize),

    #[error("{template} cell {gid} has no '{variable}' to record")]
    NotRecordable {
        template: &'static str,
        gid: CellId,
        variable: String,
    },

    #[error("{target} synapse of cell {gid} already has connections")]
    SynapseInUse { gid: CellId, target: SynapseTarget },
}

impl From<NeuronError> for PynnError {
    fn from(e: NeuronError) -> Self {
        PynnError::Backend(e.to_string())
    }
}

/// Parameters under their NEURON names
pub type NativeParameters = BTreeMap<String, ParameterValue>;

// =============================================================================
// SECTIONS
// =============================================================================

/// Single cable section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    /// Length (um)
    pub length: f64,
    /// Diameter (um)
    pub diam: f64,
    /// Specific membrane capacitance (uF/cm^2)
    pub cm: f64,
    /// Membrane potential (mV)
    pub v: f64,
}

impl Section {
    /// Soma with a membrane area of exactly 1e-3 cm^2
    pub fn soma() -> Self {
        Self {
            name: "soma".to_string(),
            length: 100.0,
            diam: 1000.0 / PI,
            cm: 1.0,
            v: -65.0,
        }
    }

    /// Surface area (cm^2)
    pub fn area(&self) -> f64 {
        PI * self.diam * self.length * 1e-8
    }

    /// Total capacitance (nF)
    pub fn capacitance(&self) -> f64 {
        self.cm * self.area() * 1e3
    }

    pub fn set_capacitance(&mut self, nf: f64) {
        self.cm = nf * 1e-3 / self.area();
    }
}

// =============================================================================
// TEMPLATES AND PARAMETER TRANSLATION
// =============================================================================

/// Cell templates this backend can instantiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Template {
    StandardIF,
    VectorSpikeSource,
    RandomSpikeSource,
}

impl Template {
    pub const ALL: [Template; 3] = [Template::StandardIF, Template::VectorSpikeSource, Template::RandomSpikeSource];

    pub fn name(&self) -> &'static str {
        match self {
            Template::StandardIF => "StandardIF",
            Template::VectorSpikeSource => "VectorSpikeSource",
            Template::RandomSpikeSource => "RandomSpikeSource",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| PynnError::InvalidModel(format!("unknown NEURON template '{}'", name)))
    }

    pub fn for_cell_type(cell_type: &CellType) -> Result<Self> {
        match cell_type {
            CellType::IfCurrAlpha | CellType::IfCurrExp | CellType::IfCondAlpha | CellType::IfCondExp => {
                Ok(Template::StandardIF)
            }
            CellType::SpikeSourceArray => Ok(Template::VectorSpikeSource),
            CellType::SpikeSourcePoisson => Ok(Template::RandomSpikeSource),
            CellType::Native(name) => Self::from_name(name),
        }
    }

    pub fn default_parameters(&self) -> NativeParameters {
        let scalars: &[(&str, f64)] = match self {
            Template::StandardIF => &[
                ("CM", 1.0),
                ("tau_m", 20.0),
                ("t_refrac", 0.0),
                ("tau_e", 5.0),
                ("tau_i", 5.0),
                ("e_e", 0.0),
                ("e_i", -70.0),
                ("v_rest", -65.0),
                ("v_thresh", -55.0),
                ("v_reset", -65.0),
                ("i_offset", 0.0),
                ("v_init", -65.0),
                ("syn_type", 0.0),
                ("syn_shape", 0.0),
            ],
            Template::VectorSpikeSource => &[],
            Template::RandomSpikeSource => &[("interval", 1e3), ("start", 0.0), ("duration", 1e10)],
        };
        let mut params: NativeParameters = scalars
            .iter()
            .map(|(k, v)| (k.to_string(), ParameterValue::Scalar(*v)))
            .collect();
        if *self == Template::VectorSpikeSource {
            params.insert("spiketimes".into(), ParameterValue::Vector(vec![]));
        }
        params
    }
}

/// Standard name -> NEURON name, for parameters that map one to one
const TRANSLATIONS: &[(&str, &str)] = &[
    ("cm", "CM"),
    ("tau_m", "tau_m"),
    ("tau_refrac", "t_refrac"),
    ("tau_syn_E", "tau_e"),
    ("tau_syn_I", "tau_i"),
    ("e_rev_E", "e_e"),
    ("e_rev_I", "e_i"),
    ("v_rest", "v_rest"),
    ("v_thresh", "v_thresh"),
    ("v_reset", "v_reset"),
    ("i_offset", "i_offset"),
    ("v_init", "v_init"),
    ("spike_times", "spiketimes"),
    ("start", "start"),
    ("duration", "duration"),
];

/// Translate one standard parameter to its NEURON name and value
fn to_native(name: &str, value: &ParameterValue) -> Result<(String, ParameterValue)> {
    if name == "rate" {
        let rate = value
            .as_scalar()
            .ok_or_else(|| PynnError::InvalidParameterValue(format!("rate must be a scalar, got {}", value)))?;
        let interval = if rate > 0.0 { 1000.0 / rate } else { f64::INFINITY };
        return Ok(("interval".into(), ParameterValue::Scalar(interval)));
    }
    TRANSLATIONS
        .iter()
        .find(|(standard, _)| *standard == name)
        .map(|(_, native)| (native.to_string(), value.clone()))
        .ok_or_else(|| PynnError::InvalidArgument(format!("no NEURON translation for '{}'", name)))
}

/// Read a standard parameter back out of NEURON names
fn from_native(name: &str, params: &NativeParameters) -> Result<ParameterValue> {
    if name == "rate" {
        let interval = scalar(params, "interval")?;
        return Ok(ParameterValue::Scalar(if interval.is_finite() { 1000.0 / interval } else { 0.0 }));
    }
    let native = TRANSLATIONS
        .iter()
        .find(|(standard, _)| *standard == name)
        .map(|(_, native)| *native)
        .ok_or_else(|| PynnError::InvalidArgument(format!("no NEURON translation for '{}'", name)))?;
    params
        .get(native)
        .cloned()
        .ok_or_else(|| PynnError::InvalidArgument(format!("cell has no parameter '{}'", name)))
}

fn scalar(params: &NativeParameters, name: &str) -> Result<f64> {
    params
        .get(name)
        .and_then(ParameterValue::as_scalar)
        .ok_or_else(|| PynnError::InvalidParameterValue(format!("missing scalar parameter '{}'", name)))
}

// =============================================================================
// CELLS
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct IfParams {
    tau_m: f64,
    t_refrac: f64,
    tau_e: f64,
    tau_i: f64,
    e_e: f64,
    e_i: f64,
    v_rest: f64,
    v_thresh: f64,
    v_reset: f64,
    i_offset: f64,
    kind: SynapseKind,
    shape: SynapseShape,
}

impl IfParams {
    fn from_native(p: &NativeParameters) -> Result<Self> {
        Ok(Self {
            tau_m: scalar(p, "tau_m")?,
            t_refrac: scalar(p, "t_refrac")?,
            tau_e: scalar(p, "tau_e")?,
            tau_i: scalar(p, "tau_i")?,
            e_e: scalar(p, "e_e")?,
            e_i: scalar(p, "e_i")?,
            v_rest: scalar(p, "v_rest")?,
            v_thresh: scalar(p, "v_thresh")?,
            v_reset: scalar(p, "v_reset")?,
            i_offset: scalar(p, "i_offset")?,
            kind: if scalar(p, "syn_type")? > 0.5 { SynapseKind::Conductance } else { SynapseKind::Current },
            shape: if scalar(p, "syn_shape")? > 0.5 { SynapseShape::Alpha } else { SynapseShape::Exponential },
        })
    }
}

/// Synaptic point process on the soma
#[derive(Debug, Clone, Default)]
struct Synapse {
    /// Conductance (uS) or current (nA)
    g: f64,
    /// Rising state of the alpha kernel
    y: f64,
    tm: Option<TsodyksMarkram>,
    n_connections: usize,
}

impl Synapse {
    fn receive(&mut self, amount: f64, shape: SynapseShape) {
        match shape {
            SynapseShape::Exponential => self.g += amount,
            SynapseShape::Alpha => self.y += amount * E,
        }
    }

    fn step(&mut self, dt: Time, tau: f64, shape: SynapseShape) {
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
enum Dynamics {
    If {
        params: IfParams,
        refractory_until: Time,
        synapses: [Synapse; 2],
    },
    Vector {
        times: Vec<Time>,
        next: usize,
    },
    Random {
        interval: f64,
        stop: Time,
        rng: ChaCha8Rng,
        next_spike: Time,
    },
}

fn synapse_index(target: SynapseTarget) -> usize {
    match target {
        SynapseTarget::Excitatory => 0,
        SynapseTarget::Inhibitory => 1,
    }
}

/// One instantiated template
#[derive(Debug, Clone)]
pub struct NeuronCell {
    pub gid: CellId,
    pub template: Template,
    pub soma: Section,
    /// Set when created from a standard cell type
    standard: Option<CellType>,
    params: NativeParameters,
    dynamics: Dynamics,
    pub spike_times: Vec<Time>,
}

impl NeuronCell {
    fn new(gid: CellId, template: Template, standard: Option<CellType>, params: NativeParameters, seed: u64, t: Time) -> Result<Self> {
        let dynamics = match template {
            Template::StandardIF => Dynamics::If {
                params: IfParams::from_native(&params)?,
                refractory_until: f64::NEG_INFINITY,
                synapses: Default::default(),
            },
            Template::VectorSpikeSource => Dynamics::Vector { times: vec![], next: 0 },
            Template::RandomSpikeSource => Dynamics::Random {
                interval: f64::INFINITY,
                stop: 0.0,
                rng: ChaCha8Rng::seed_from_u64(seed.wrapping_add(gid.0)),
                next_spike: f64::INFINITY,
            },
        };
        let mut cell = Self {
            gid,
            template,
            soma: Section::soma(),
            standard,
            params,
            dynamics,
            spike_times: Vec::new(),
        };
        cell.refresh(t)?;
        Ok(cell)
    }

    /// Re-read the parameter table into the running model
    fn refresh(&mut self, t: Time) -> Result<()> {
        match &mut self.dynamics {
            Dynamics::If { params, .. } => {
                *params = IfParams::from_native(&self.params)?;
                self.soma.set_capacitance(scalar(&self.params, "CM")?);
                if t == 0.0 {
                    self.soma.v = scalar(&self.params, "v_init")?;
                }
            }
            Dynamics::Vector { times, next } => {
                let mut new_times = self
                    .params
                    .get("spiketimes")
                    .and_then(ParameterValue::as_vector)
                    .map(<[f64]>::to_vec)
                    .unwrap_or_default();
                new_times.sort_by(f64::total_cmp);
                *next = new_times.partition_point(|&s| s < t);
                *times = new_times;
            }
            Dynamics::Random {
                interval,
                stop,
                rng,
                next_spike,
            } => {
                let start = scalar(&self.params, "start")?;
                *interval = scalar(&self.params, "interval")?;
                *stop = start + scalar(&self.params, "duration")?;
                *next_spike = start.max(t) + draw_interval(rng, *interval);
            }
        }
        Ok(())
    }

    fn get_parameter(&self, name: &str) -> Result<ParameterValue> {
        match self.standard {
            Some(_) => from_native(name, &self.params),
            None => self
                .params
                .get(name)
                .cloned()
                .ok_or_else(|| PynnError::InvalidArgument(format!("{} has no parameter '{}'", self.template.name(), name))),
        }
    }

    fn set_parameter(&mut self, name: &str, value: &ParameterValue, t: Time) -> Result<()> {
        let (native, value) = match self.standard {
            Some(_) => to_native(name, value)?,
            None => (name.to_string(), value.clone()),
        };
        self.params.insert(native, value);
        self.refresh(t)
    }

    /// Current value of a sampled variable
    fn value(&self, variable: &Variable) -> Option<f64> {
        let Dynamics::If { params, synapses, .. } = &self.dynamics else {
            return None;
        };
        match variable {
            Variable::V => Some(self.soma.v),
            Variable::GsynExc if params.kind == SynapseKind::Conductance => Some(synapses[0].g),
            Variable::GsynInh if params.kind == SynapseKind::Conductance => Some(synapses[1].g),
            _ => None,
        }
    }

    fn synapse_mut(&mut self, target: SynapseTarget) -> Option<&mut Synapse> {
        match &mut self.dynamics {
            Dynamics::If { synapses, .. } => Some(&mut synapses[synapse_index(target)]),
            _ => None,
        }
    }

    fn receive(&mut self, target: SynapseTarget, amount: f64) {
        if let Dynamics::If { params, synapses, .. } = &mut self.dynamics {
            let amount = match target {
                SynapseTarget::Excitatory => amount,
                SynapseTarget::Inhibitory => amount.abs(),
            };
            synapses[synapse_index(target)].receive(amount, params.shape);
        }
    }

    /// Integrate from `t` to `t + dt`, returning any spike times
    fn step(&mut self, t: Time, dt: Time) -> Vec<Time> {
        match &mut self.dynamics {
            Dynamics::If {
                params: p,
                refractory_until,
                synapses,
            } => {
                let v = self.soma.v;
                if t < *refractory_until {
                    self.soma.v = p.v_reset;
                } else {
                    let [exc, inh] = &*synapses;
                    let i_syn = match p.kind {
                        SynapseKind::Current => exc.g - inh.g,
                        SynapseKind::Conductance => exc.g * (p.e_e - v) + inh.g * (p.e_i - v),
                    };
                    let c_m = self.soma.capacitance();
                    self.soma.v += ((p.v_rest - v) / p.tau_m + (p.i_offset + i_syn) / c_m) * dt;
                }
                synapses[0].step(dt, p.tau_e, p.shape);
                synapses[1].step(dt, p.tau_i, p.shape);

                if self.soma.v >= p.v_thresh {
                    let spike = t + dt;
                    self.soma.v = p.v_reset;
                    *refractory_until = spike + p.t_refrac;
                    vec![spike]
                } else {
                    vec![]
                }
            }
            Dynamics::Vector { times, next } => {
                let mut out = Vec::new();
                while *next < times.len() && times[*next] < t + dt {
                    out.push(times[*next]);
                    *next += 1;
                }
                out
            }
            Dynamics::Random {
                interval,
                stop,
                rng,
                next_spike,
            } => {
                let mut out = Vec::new();
                while *next_spike < t + dt && *next_spike < *stop {
                    if *next_spike >= t {
                        out.push(*next_spike);
                    }
                    *next_spike += draw_interval(rng, *interval);
                }
                out
            }
        }
    }
}

fn draw_interval(rng: &mut ChaCha8Rng, mean: f64) -> f64 {
    if !mean.is_finite() {
        return f64::INFINITY;
    }
    let u: f64 = rng.gen();
    -(1.0 - u).ln() * mean
}

// =============================================================================
// NETCONS, WEIGHT ADJUSTERS, DEVICES
// =============================================================================

/// Event connection from a presynaptic gid to a local synapse
#[derive(Debug, Clone)]
pub struct NetCon {
    pub pre: CellId,
    pub post: CellHandle,
    pub target: SynapseTarget,
    pub weight: Weight,
    pub delay: Delay,
    stp: Option<ShortTermState>,
    adjuster: Option<usize>,
}

#[derive(Debug, Clone)]
struct Adjuster {
    netcon: usize,
    mechanism: StdpMechanism,
    state: WeightAdjuster,
    pre2wa: Delay,
    post2wa: Delay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Event {
    Deliver(usize),
    PreToAdjuster(usize),
    PostToAdjuster(usize),
}

/// Recording vector bound to a set of cells
#[derive(Debug, Clone)]
struct Device {
    variable: Variable,
    cells: Vec<CellHandle>,
    /// Samples per cell; cells added late are NaN-padded
    traces: HashMap<CellHandle, Vec<f64>>,
    rows: usize,
    since: HashMap<CellHandle, Time>,
}

// =============================================================================
// BACKEND
// =============================================================================

/// NEURON-style engine
#[derive(Debug)]
pub struct NeuronBackend {
    seed: u64,
    t: Time,
    cells: Vec<NeuronCell>,
    gids: HashMap<CellId, CellHandle>,
    netcons: Vec<NetCon>,
    by_pre: HashMap<CellId, Vec<usize>>,
    adjusters: Vec<Adjuster>,
    by_post: HashMap<CellHandle, Vec<usize>>,
    devices: Vec<Device>,
    queue: BinaryHeap<Reverse<(u64, Event)>>,
}

impl NeuronBackend {
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// `seed` drives the Poisson sources
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            t: 0.0,
            cells: Vec::new(),
            gids: HashMap::new(),
            netcons: Vec::new(),
            by_pre: HashMap::new(),
            adjusters: Vec::new(),
            by_post: HashMap::new(),
            devices: Vec::new(),
            queue: BinaryHeap::new(),
        }
    }

    pub fn cell(&self, handle: CellHandle) -> Result<&NeuronCell> {
        self.cells.get(handle.0).ok_or_else(|| NeuronError::UnknownCell(handle.0).into())
    }

    fn cell_mut(&mut self, handle: CellHandle) -> Result<&mut NeuronCell> {
        self.cells
            .get_mut(handle.0)
            .ok_or_else(|| NeuronError::UnknownCell(handle.0).into())
    }

    fn netcon(&self, handle: ConnectionHandle) -> Result<&NetCon> {
        self.netcons
            .get(handle.0)
            .ok_or_else(|| NeuronError::UnknownNetCon(handle.0).into())
    }

    fn netcon_mut(&mut self, handle: ConnectionHandle) -> Result<&mut NetCon> {
        self.netcons
            .get_mut(handle.0)
            .ok_or_else(|| NeuronError::UnknownNetCon(handle.0).into())
    }

    fn device(&self, handle: DeviceHandle) -> Result<&Device> {
        self.devices
            .get(handle.0)
            .ok_or_else(|| NeuronError::UnknownDevice(handle.0).into())
    }

    fn adjuster_mut(&mut self, handle: AdjusterHandle) -> Result<&mut Adjuster> {
        self.adjusters
            .get_mut(handle.0)
            .ok_or_else(|| NeuronError::UnknownAdjuster(handle.0).into())
    }

    fn schedule(&mut self, at: Time, dt: Time, event: Event) {
        let step = (at / dt).round().max(0.0) as u64;
        self.queue.push(Reverse((step, event)));
    }

    fn handle_event(&mut self, event: Event, t: Time) {
        match event {
            Event::Deliver(nc) => {
                let netcon = &mut self.netcons[nc];
                let cell = &mut self.cells[netcon.post.0];
                let mut amount = netcon.weight;
                let tm = cell.synapse_mut(netcon.target).and_then(|s| s.tm);
                if let (Some(tm), Some(state)) = (tm, netcon.stp.as_mut()) {
                    amount *= state.on_spike(&tm, t);
                }
                cell.receive(netcon.target, amount);
            }
            Event::PreToAdjuster(a) => {
                let adj = &mut self.adjusters[a];
                let netcon = &mut self.netcons[adj.netcon];
                netcon.weight = adj.state.on_pre(&adj.mechanism, t, netcon.weight);
            }
            Event::PostToAdjuster(a) => {
                let adj = &mut self.adjusters[a];
                let netcon = &mut self.netcons[adj.netcon];
                netcon.weight = adj.state.on_post(&adj.mechanism, t, netcon.weight);
            }
        }
    }
}

impl Default for NeuronBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for NeuronBackend {
    fn name(&self) -> &'static str {
        "neuron"
    }

    fn create_cell(&mut self, gid: CellId, spec: &CellSpec) -> Result<CellHandle> {
        let template = Template::for_cell_type(&spec.cell_type)?;
        let mut params = template.default_parameters();
        let standard = (!spec.cell_type.is_native()).then(|| spec.cell_type.clone());

        if standard.is_some() {
            for (name, value) in &spec.parameters {
                let (native, value) = to_native(name, value)?;
                params.insert(native, value);
            }
            if let Some(kind) = spec.cell_type.synapse_kind() {
                let syn_type = if kind == SynapseKind::Conductance { 1.0 } else { 0.0 };
                params.insert("syn_type".into(), syn_type.into());
            }
            if let Some(shape) = spec.cell_type.synapse_shape() {
                let syn_shape = if shape == SynapseShape::Alpha { 1.0 } else { 0.0 };
                params.insert("syn_shape".into(), syn_shape.into());
            }
        } else {
            params.extend(spec.parameters.clone());
        }

        let handle = CellHandle(self.cells.len());
        self.cells
            .push(NeuronCell::new(gid, template, standard, params, self.seed, self.t)?);
        self.gids.insert(gid, handle);
        trace!("Instantiated {} for gid {}", template.name(), gid);
        Ok(handle)
    }

    fn get_parameter(&self, cell: CellHandle, name: &str) -> Result<ParameterValue> {
        self.cell(cell)?.get_parameter(name)
    }

    fn set_parameter(&mut self, cell: CellHandle, name: &str, value: &ParameterValue) -> Result<()> {
        let t = self.t;
        self.cell_mut(cell)?.set_parameter(name, value, t)
    }

    fn create_device(&mut self, variable: &Variable) -> Result<DeviceHandle> {
        if let Variable::Other(name) = variable {
            return Err(PynnError::InvalidArgument(format!("NEURON backend cannot record '{}'", name)));
        }
        self.devices.push(Device {
            variable: variable.clone(),
            cells: Vec::new(),
            traces: HashMap::new(),
            rows: 0,
            since: HashMap::new(),
        });
        Ok(DeviceHandle(self.devices.len() - 1))
    }

    fn set_device_cells(&mut self, device: DeviceHandle, cells: &[CellHandle]) -> Result<()> {
        let variable = self.device(device)?.variable.clone();
        for &h in cells {
            let cell = self.cell(h)?;
            if !variable.is_event() && cell.value(&variable).is_none() {
                return Err(NeuronError::NotRecordable {
                    template: cell.template.name(),
                    gid: cell.gid,
                    variable: variable.to_string(),
                }
                .into());
            }
        }
        let t = self.t;
        let dev = &mut self.devices[device.0];
        for &h in cells {
            let rows = dev.rows;
            dev.traces.entry(h).or_insert_with(|| vec![f64::NAN; rows]);
            dev.since.entry(h).or_insert(t);
        }
        dev.cells = cells.to_vec();
        debug!("Vector for {} now tracks {} cells", variable, cells.len());
        Ok(())
    }

    fn device_samples(&self, device: DeviceHandle) -> Result<Array2<f64>> {
        let dev = self.device(device)?;
        let columns: Vec<&Vec<f64>> = dev.cells.iter().filter_map(|h| dev.traces.get(h)).collect();
        Ok(Array2::from_shape_fn((dev.rows, columns.len()), |(r, c)| columns[c][r]))
    }

    fn device_live_values(&self, device: DeviceHandle) -> Result<Vec<f64>> {
        let dev = self.device(device)?;
        dev.cells
            .iter()
            .map(|&h| Ok(self.cell(h)?.value(&dev.variable).unwrap_or(f64::NAN)))
            .collect()
    }

    fn device_spike_times(&self, device: DeviceHandle, cell: CellHandle) -> Result<Vec<Time>> {
        let since = self.device(device)?.since.get(&cell).copied().unwrap_or(0.0);
        Ok(self
            .cell(cell)?
            .spike_times
            .iter()
            .copied()
            .filter(|&s| s >= since)
            .collect())
    }

    fn native_unit(&self, variable: &Variable) -> Unit {
        match variable {
            Variable::Spikes => Unit::Millisecond,
            Variable::V => Unit::Millivolt,
            Variable::GsynExc | Variable::GsynInh => Unit::Microsiemens,
            Variable::Other(_) => Unit::Dimensionless,
        }
    }

    fn connect(&mut self, pre: CellId, post: CellHandle, target: SynapseTarget, weight: Weight, delay: Delay) -> Result<ConnectionHandle> {
        let cell = self.cell_mut(post)?;
        let synapse = cell.synapse_mut(target).ok_or_else(|| {
            PynnError::InvalidArgument(format!("cell {} has no synapses to connect to", post.0))
        })?;
        synapse.n_connections += 1;
        let stp = synapse.tm.as_ref().map(ShortTermState::new);

        let nc = self.netcons.len();
        self.netcons.push(NetCon {
            pre,
            post,
            target,
            weight,
            delay,
            stp,
            adjuster: None,
        });
        self.by_pre.entry(pre).or_default().push(nc);
        Ok(ConnectionHandle(nc))
    }

    fn weight(&self, connection: ConnectionHandle) -> Result<Weight> {
        Ok(self.netcon(connection)?.weight)
    }

    fn set_weight(&mut self, connection: ConnectionHandle, weight: Weight) -> Result<()> {
        self.netcon_mut(connection)?.weight = weight;
        Ok(())
    }

    fn delay(&self, connection: ConnectionHandle) -> Result<Delay> {
        Ok(self.netcon(connection)?.delay)
    }

    fn set_delay(&mut self, connection: ConnectionHandle, delay: Delay) -> Result<()> {
        self.netcon_mut(connection)?.delay = delay;
        Ok(())
    }

    fn use_short_term_plasticity(&mut self, post: CellHandle, target: SynapseTarget, params: &TsodyksMarkram) -> Result<()> {
        let cell = self.cell_mut(post)?;
        let gid = cell.gid;
        let synapse = cell
            .synapse_mut(target)
            .ok_or_else(|| PynnError::InvalidArgument(format!("cell {} has no synapses", gid)))?;
        if synapse.n_connections > 0 {
            return Err(NeuronError::SynapseInUse { gid, target }.into());
        }
        synapse.tm = Some(*params);
        Ok(())
    }

    fn use_stdp(&mut self, connection: ConnectionHandle, mechanism: &StdpMechanism, pre_delay: Delay, post_delay: Delay) -> Result<AdjusterHandle> {
        let post = self.netcon(connection)?.post;
        let a = self.adjusters.len();
        self.adjusters.push(Adjuster {
            netcon: connection.0,
            mechanism: *mechanism,
            state: WeightAdjuster::default(),
            pre2wa: pre_delay,
            post2wa: post_delay,
        });
        self.netcons[connection.0].adjuster = Some(a);
        self.by_post.entry(post).or_default().push(a);
        Ok(AdjusterHandle(a))
    }

    fn set_stdp_delays(&mut self, adjuster: AdjusterHandle, pre_delay: Delay, post_delay: Delay) -> Result<()> {
        let adj = self.adjuster_mut(adjuster)?;
        adj.pre2wa = pre_delay;
        adj.post2wa = post_delay;
        Ok(())
    }

    fn stdp_delays(&self, adjuster: AdjusterHandle) -> Result<(Delay, Delay)> {
        self.adjusters
            .get(adjuster.0)
            .map(|a| (a.pre2wa, a.post2wa))
            .ok_or_else(|| NeuronError::UnknownAdjuster(adjuster.0).into())
    }

    fn advance(&mut self, clock: &Clock) -> Result<()> {
        let (t, dt) = (clock.t, clock.dt);
        let step = clock.steps() as u64;
        self.t = t;

        // Vectors record the state at the start of the step.
        for dev in self.devices.iter_mut().filter(|d| !d.variable.is_event()) {
            for &h in &dev.cells {
                let value = self.cells[h.0].value(&dev.variable).unwrap_or(f64::NAN);
                dev.traces.entry(h).or_default().push(value);
            }
            dev.rows += 1;
        }

        while let Some(&Reverse((due, event))) = self.queue.peek() {
            if due > step {
                break;
            }
            self.queue.pop();
            self.handle_event(event, due as f64 * dt);
        }

        let mut spikes = Vec::new();
        for (i, cell) in self.cells.iter_mut().enumerate() {
            spikes.extend(cell.step(t, dt).into_iter().map(|s| (CellHandle(i), s)));
        }

        for (h, s) in spikes {
            let gid = self.cells[h.0].gid;
            self.cells[h.0].spike_times.push(s);
            let outgoing: Vec<(usize, Delay, Option<usize>)> = self
                .by_pre
                .get(&gid)
                .map(|ncs| ncs.iter().map(|&nc| (nc, self.netcons[nc].delay, self.netcons[nc].adjuster)).collect())
                .unwrap_or_default();
            for (nc, delay, adjuster) in outgoing {
                self.schedule(s + delay, dt, Event::Deliver(nc));
                if let Some(a) = adjuster {
                    let pre2wa = self.adjusters[a].pre2wa;
                    self.schedule(s + pre2wa, dt, Event::PreToAdjuster(a));
                }
            }
            let incoming: Vec<(usize, Delay)> = self
                .by_post
                .get(&h)
                .map(|adjs| adjs.iter().map(|&a| (a, self.adjusters[a].post2wa)).collect())
                .unwrap_or_default();
            for (a, post2wa) in incoming {
                self.schedule(s + post2wa, dt, Event::PostToAdjuster(a));
            }
        }
        self.t = t + dt;
        Ok(())
    }

    fn reset(&mut self) {
        *self = Self::with_seed(self.seed);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(step: usize) -> Clock {
        Clock {
            t: step as f64 * 0.1,
            dt: 0.1,
            t_start: 0.0,
            min_delay: 0.1,
            max_delay: 10.0,
            rank: 0,
            num_processes: 1,
        }
    }

    fn run(backend: &mut NeuronBackend, steps: usize) {
        for i in 0..steps {
            backend.advance(&clock(i)).unwrap();
        }
    }

    fn spec(cell_type: CellType, params: &[(&str, ParameterValue)]) -> CellSpec {
        let overrides = params.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        CellSpec::new(cell_type, overrides).unwrap()
    }

    #[test]
    fn test_soma_area() {
        let soma = Section::soma();
        assert!((soma.area() - 1e-3).abs() < 1e-12);
        assert!((soma.capacitance() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_template() {
        let mut backend = NeuronBackend::new();
        let err = backend
            .create_cell(CellId(0), &CellSpec::standard(CellType::Native("hh_traub".into())))
            .unwrap_err();
        assert!(matches!(err, PynnError::InvalidModel(_)));
    }

    #[test]
    fn test_parameter_translation() {
        let mut backend = NeuronBackend::new();
        let h = backend
            .create_cell(CellId(0), &spec(CellType::SpikeSourcePoisson, &[("rate", 50.0.into())]))
            .unwrap();
        assert_eq!(backend.cell(h).unwrap().params["interval"], ParameterValue::Scalar(20.0));
        assert_eq!(backend.get_parameter(h, "rate").unwrap(), ParameterValue::Scalar(50.0));

        let h = backend.create_cell(CellId(1), &CellSpec::standard(CellType::IfCurrExp)).unwrap();
        backend.set_parameter(h, "tau_refrac", &2.0.into()).unwrap();
        assert_eq!(backend.cell(h).unwrap().params["t_refrac"], ParameterValue::Scalar(2.0));
    }

    #[test]
    fn test_constant_current_fires() {
        let mut backend = NeuronBackend::new();
        let h = backend
            .create_cell(CellId(0), &spec(CellType::IfCurrExp, &[("i_offset", 1.0.into())]))
            .unwrap();
        run(&mut backend, 1000);
        let spikes = &backend.cell(h).unwrap().spike_times;
        assert!(!spikes.is_empty());
        assert!(spikes.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_spike_source_drives_target() {
        let mut backend = NeuronBackend::new();
        backend
            .create_cell(CellId(0), &spec(CellType::SpikeSourceArray, &[("spike_times", vec![1.0].into())]))
            .unwrap();
        let post = backend.create_cell(CellId(1), &CellSpec::standard(CellType::IfCurrExp)).unwrap();
        backend.connect(CellId(0), post, SynapseTarget::Excitatory, 2.0, 1.0).unwrap();

        let dev = backend.create_device(&Variable::V).unwrap();
        backend.set_device_cells(dev, &[post]).unwrap();
        run(&mut backend, 50);

        let samples = backend.device_samples(dev).unwrap();
        assert_eq!(samples.nrows(), 50);
        assert_eq!(samples[[0, 0]], -65.0);
        assert!(samples.column(0).iter().any(|&v| v > -64.0));
    }

    #[test]
    fn test_depressing_synapse() {
        let mut backend = NeuronBackend::new();
        let post = backend.create_cell(CellId(0), &CellSpec::standard(CellType::IfCondExp)).unwrap();
        backend
            .use_short_term_plasticity(post, SynapseTarget::Excitatory, &TsodyksMarkram::default())
            .unwrap();
        let nc = backend.connect(CellId(5), post, SynapseTarget::Excitatory, 0.01, 0.1).unwrap();
        assert!(backend.netcons[nc.0].stp.is_some());

        // too late once a connection exists
        let err = backend.use_short_term_plasticity(post, SynapseTarget::Excitatory, &TsodyksMarkram::default());
        assert!(err.is_err());
    }

    #[test]
    fn test_stdp_links() {
        let mut backend = NeuronBackend::new();
        let post = backend.create_cell(CellId(0), &CellSpec::standard(CellType::IfCurrAlpha)).unwrap();
        let nc = backend.connect(CellId(9), post, SynapseTarget::Excitatory, 0.5, 5.0).unwrap();
        let adj = backend.use_stdp(nc, &StdpMechanism::default(), 3.5, 1.5).unwrap();
        assert_eq!(backend.stdp_delays(adj).unwrap(), (3.5, 1.5));
        backend.set_stdp_delays(adj, 1.0, 4.0).unwrap();
        assert_eq!(backend.stdp_delays(adj).unwrap(), (1.0, 4.0));
    }

    #[test]
    fn test_gsyn_needs_conductance_cell() {
        let mut backend = NeuronBackend::new();
        let h = backend.create_cell(CellId(0), &CellSpec::standard(CellType::IfCurrExp)).unwrap();
        let dev = backend.create_device(&Variable::GsynExc).unwrap();
        assert!(backend.set_device_cells(dev, &[h]).is_err());
    }
}
