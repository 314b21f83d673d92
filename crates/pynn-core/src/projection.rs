//! Projections: the synaptic connections between two populations.

use log::{debug, info};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::backend::{AdjusterHandle, ConnectionHandle, SynapseTarget};
use crate::connectors::{ConnectionRecord, Connector};
use crate::identity::CellId;
use crate::plasticity::SynapseDynamics;
use crate::population::{Layout, Population};
use crate::random::{RandomDistribution, SeededRng};
use crate::state::Simulation;
use crate::{Delay, PynnError, Result, Weight};

/// One directed connection owned by this node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub pre: CellId,
    pub post: CellId,
    pub handle: ConnectionHandle,
    /// Present when the projection has long-term plasticity
    pub adjuster: Option<AdjusterHandle>,
}

/// New weights or delays for every connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionValues {
    Scalar(f64),
    /// One value per connection, in creation order
    PerConnection(Vec<f64>),
}

impl From<f64> for ConnectionValues {
    fn from(x: f64) -> Self {
        Self::Scalar(x)
    }
}

impl From<Vec<f64>> for ConnectionValues {
    fn from(v: Vec<f64>) -> Self {
        Self::PerConnection(v)
    }
}

/// Layout of weights/delays returned by a projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatrixFormat {
    /// One value per connection, in creation order
    #[default]
    List,
    /// Dense `[pre.size, post.size]` matrix
    Array,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionData {
    List(Vec<f64>),
    Array(Array2<f64>),
}

impl ConnectionData {
    pub fn as_list(&self) -> Option<&[f64]> {
        match self {
            Self::List(v) => Some(v),
            Self::Array(_) => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array2<f64>> {
        match self {
            Self::List(_) => None,
            Self::Array(a) => Some(a),
        }
    }
}

/// Optional settings for [`Projection::new`]
#[derive(Debug, Clone, Default)]
pub struct ProjectionOptions {
    pub target: SynapseTarget,
    pub dynamics: SynapseDynamics,
    pub label: Option<String>,
    /// Stream used by probabilistic connectors; the simulation default otherwise
    pub rng: Option<SeededRng>,
}

/// Handed to connectors; creates and validates individual connections
pub struct ConnectionBuilder<'a> {
    sim: &'a mut Simulation,
    pre: &'a Population,
    post: &'a Population,
    target: SynapseTarget,
    rng: &'a mut SeededRng,
    connections: Vec<Connection>,
}

impl<'a> ConnectionBuilder<'a> {
    pub fn pre(&self) -> &'a Population {
        self.pre
    }

    pub fn post(&self) -> &'a Population {
        self.post
    }

    pub fn rng(&mut self) -> &mut SeededRng {
        &mut *self.rng
    }

    pub fn min_delay(&self) -> Delay {
        self.sim.min_delay()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Create one connection onto a local postsynaptic cell
    pub fn connect(&mut self, pre: CellId, post: CellId, weight: Weight, delay: Delay) -> Result<()> {
        if delay.is_nan() || delay < self.sim.min_delay() {
            return Err(PynnError::ConstraintViolation(format!(
                "delay {} is below the minimum delay of {} ms",
                delay,
                self.sim.min_delay()
            )));
        }
        if !self.pre.layout().contains(pre) {
            return Err(PynnError::IndexError(format!(
                "cell {} is not in population '{}'",
                pre,
                self.pre.label()
            )));
        }
        let target_cell = self.post.handle(post).ok_or_else(|| {
            PynnError::IndexError(format!(
                "cell {} of '{}' is not local to node {}",
                post,
                self.post.label(),
                self.sim.rank()
            ))
        })?;
        let handle = self
            .sim
            .backend_mut()
            .connect(pre, target_cell, self.target, weight, delay)?;
        self.connections.push(Connection {
            pre,
            post,
            handle,
            adjuster: None,
        });
        Ok(())
    }
}

/// Connections between a presynaptic and a postsynaptic population
#[derive(Debug, Clone)]
pub struct Projection {
    label: String,
    pre_label: String,
    post_label: String,
    pre_layout: Layout,
    post_layout: Layout,
    target: SynapseTarget,
    dynamics: SynapseDynamics,
    connector: String,
    connections: Vec<Connection>,
}

impl Projection {
    pub fn new(
        sim: &mut Simulation,
        pre: &Population,
        post: &Population,
        connector: &mut dyn Connector,
        options: ProjectionOptions,
    ) -> Result<Self> {
        let ProjectionOptions {
            target,
            dynamics,
            label,
            rng,
        } = options;

        if let Some(slow) = &dynamics.slow {
            slow.validate()?;
            if slow.dendritic_delay_fraction > 0.5 && sim.num_processes() > 1 {
                return Err(PynnError::UnsupportedConfiguration(format!(
                    "dendritic_delay_fraction {} > 0.5 cannot be used with more than one process",
                    slow.dendritic_delay_fraction
                )));
            }
        }

        // Short-term dynamics must exist before anything connects to the synapse.
        if let Some(fast) = &dynamics.fast {
            fast.validate()?;
            for &id in post.local_cells() {
                if let Some(handle) = post.handle(id) {
                    sim.backend_mut().use_short_term_plasticity(handle, target, fast)?;
                }
            }
        }

        let label = match label {
            Some(label) => label,
            None => sim.next_projection_label(),
        };
        let mut rng = rng.unwrap_or_else(|| sim.next_stream());
        let mut builder = ConnectionBuilder {
            sim: &mut *sim,
            pre,
            post,
            target,
            rng: &mut rng,
            connections: Vec::new(),
        };
        connector.connect(&mut builder)?;
        let mut connections = builder.connections;

        if let Some(slow) = &dynamics.slow {
            for conn in &mut connections {
                let (pre_delay, post_delay) = slow.split_delay(sim.backend().delay(conn.handle)?);
                conn.adjuster = Some(sim.backend_mut().use_stdp(conn.handle, slow, pre_delay, post_delay)?);
            }
        }

        let projection = Self {
            label,
            pre_label: pre.label().to_string(),
            post_label: post.label().to_string(),
            pre_layout: pre.layout().clone(),
            post_layout: post.layout().clone(),
            target,
            dynamics,
            connector: connector.describe(),
            connections,
        };
        if let Some(min) = projection.min_delay(sim)? {
            if min.is_nan() || min < sim.min_delay() {
                return Err(PynnError::ConstraintViolation(format!(
                    "projection '{}' has a delay of {} below the minimum of {} ms",
                    projection.label,
                    min,
                    sim.min_delay()
                )));
            }
        }
        info!(
            "Created projection '{}' ({} -> {}, {}) with {} local connections",
            projection.label,
            projection.pre_label,
            projection.post_label,
            projection.connector,
            projection.len()
        );
        Ok(projection)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pre_label(&self) -> &str {
        &self.pre_label
    }

    pub fn post_label(&self) -> &str {
        &self.post_label
    }

    pub fn target(&self) -> SynapseTarget {
        self.target
    }

    pub fn dynamics(&self) -> &SynapseDynamics {
        &self.dynamics
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Shortest delay, NaN if any delay is NaN
    fn min_delay(&self, sim: &Simulation) -> Result<Option<Delay>> {
        let mut min: Option<Delay> = None;
        for conn in &self.connections {
            let d = sim.backend().delay(conn.handle)?;
            min = Some(min.map_or(d, |m| if d.is_nan() || d < m { d } else { m }));
        }
        Ok(min)
    }

    fn expand(&self, values: ConnectionValues, what: &str) -> Result<Vec<f64>> {
        match values {
            ConnectionValues::Scalar(x) => Ok(vec![x; self.len()]),
            ConnectionValues::PerConnection(v) if v.len() == self.len() => Ok(v),
            ConnectionValues::PerConnection(v) => Err(PynnError::ConstraintViolation(format!(
                "{} {} given for {} connections",
                v.len(),
                what,
                self.len()
            ))),
        }
    }

    pub fn set_weights(&mut self, sim: &mut Simulation, values: impl Into<ConnectionValues>) -> Result<()> {
        let weights = self.expand(values.into(), "weights")?;
        for (conn, &w) in self.connections.iter().zip(&weights) {
            sim.backend_mut().set_weight(conn.handle, w)?;
        }
        debug!("Set {} weights on '{}'", weights.len(), self.label);
        Ok(())
    }

    /// Change delays. Values below the minimum delay are rejected before
    /// anything is modified; plastic connections get their delay split redone.
    pub fn set_delays(&mut self, sim: &mut Simulation, values: impl Into<ConnectionValues>) -> Result<()> {
        let delays = self.expand(values.into(), "delays")?;
        if let Some(&bad) = delays.iter().find(|&&d| d.is_nan() || d < sim.min_delay()) {
            return Err(PynnError::ConstraintViolation(format!(
                "delay {} is below the minimum delay of {} ms",
                bad,
                sim.min_delay()
            )));
        }
        for (conn, &d) in self.connections.iter().zip(&delays) {
            sim.backend_mut().set_delay(conn.handle, d)?;
            if let (Some(slow), Some(adjuster)) = (&self.dynamics.slow, conn.adjuster) {
                let (pre_delay, post_delay) = slow.split_delay(d);
                sim.backend_mut().set_stdp_delays(adjuster, pre_delay, post_delay)?;
            }
        }
        debug!("Set {} delays on '{}'", delays.len(), self.label);
        Ok(())
    }

    pub fn randomize_weights(&mut self, sim: &mut Simulation, distribution: &mut RandomDistribution) -> Result<()> {
        let values = distribution.next_n(self.len());
        self.set_weights(sim, values)
    }

    pub fn randomize_delays(&mut self, sim: &mut Simulation, distribution: &mut RandomDistribution) -> Result<()> {
        let values = distribution.next_n(self.len());
        self.set_delays(sim, values)
    }

    fn collect(&self, format: MatrixFormat, absent: f64, value: impl Fn(&Connection) -> Result<f64>) -> Result<ConnectionData> {
        match format {
            MatrixFormat::List => Ok(ConnectionData::List(
                self.connections.iter().map(value).collect::<Result<_>>()?,
            )),
            MatrixFormat::Array => {
                let mut out = Array2::from_elem((self.pre_layout.size(), self.post_layout.size()), absent);
                for conn in &self.connections {
                    let i = self.pre_layout.offset(conn.pre);
                    let j = self.post_layout.offset(conn.post);
                    if let (Some(i), Some(j)) = (i, j) {
                        out[[i, j]] = value(conn)?;
                    }
                }
                Ok(ConnectionData::Array(out))
            }
        }
    }

    /// Weights; absent connections are 0 in array form
    pub fn get_weights(&self, sim: &Simulation, format: MatrixFormat) -> Result<ConnectionData> {
        self.collect(format, 0.0, |c| sim.backend().weight(c.handle))
    }

    /// Delays; absent connections are infinite in array form
    pub fn get_delays(&self, sim: &Simulation, format: MatrixFormat) -> Result<ConnectionData> {
        self.collect(format, f64::INFINITY, |c| sim.backend().delay(c.handle))
    }

    /// `(pre_delay, post_delay)` of every plastic connection
    pub fn stdp_delays(&self, sim: &Simulation) -> Result<Vec<(Delay, Delay)>> {
        if self.dynamics.slow.is_none() {
            return Err(PynnError::InvalidArgument(format!(
                "projection '{}' has no long-term plasticity",
                self.label
            )));
        }
        self.connections
            .iter()
            .filter_map(|c| c.adjuster)
            .map(|a| sim.backend().stdp_delays(a))
            .collect()
    }

    /// Histogram of local weights: `(counts, bin_edges)`
    pub fn weight_histogram(
        &self,
        sim: &Simulation,
        min: Option<f64>,
        max: Option<f64>,
        nbins: usize,
    ) -> Result<(Vec<usize>, Vec<f64>)> {
        if nbins == 0 {
            return Err(PynnError::InvalidArgument("nbins must be positive".into()));
        }
        let weights = self
            .connections
            .iter()
            .map(|c| sim.backend().weight(c.handle))
            .collect::<Result<Vec<_>>>()?;
        let mut lo = min.unwrap_or_else(|| weights.iter().copied().fold(f64::INFINITY, f64::min));
        let mut hi = max.unwrap_or_else(|| weights.iter().copied().fold(f64::NEG_INFINITY, f64::max));
        if !lo.is_finite() || !hi.is_finite() {
            lo = 0.0;
            hi = 1.0;
        }
        if hi <= lo {
            lo -= 0.5;
            hi += 0.5;
        }
        let width = (hi - lo) / nbins as f64;
        let edges = (0..=nbins).map(|i| lo + i as f64 * width).collect();
        let mut counts = vec![0; nbins];
        for w in weights.into_iter().filter(|w| (lo..=hi).contains(w)) {
            let bin = (((w - lo) / width) as usize).min(nbins - 1);
            counts[bin] += 1;
        }
        Ok((counts, edges))
    }

    /// Every local connection by address, with its current weight and delay
    pub fn connection_records(&self, sim: &Simulation) -> Result<Vec<ConnectionRecord>> {
        self.connections
            .iter()
            .map(|c| {
                Ok(ConnectionRecord {
                    pre: self.pre_layout.locate(c.pre)?,
                    post: self.post_layout.locate(c.post)?,
                    weight: sim.backend().weight(c.handle)?,
                    delay: sim.backend().delay(c.handle)?,
                })
            })
            .collect()
    }

    /// Write this node's connections to `path`, suffixed with `.<rank>` when
    /// the run has more than one process. Returns the path written.
    pub fn save_connections(&self, sim: &Simulation, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let path = if sim.num_processes() > 1 {
            PathBuf::from(format!("{}.{}", path.display(), sim.rank()))
        } else {
            path.to_path_buf()
        };
        let mut out = BufWriter::new(File::create(&path)?);
        for record in self.connection_records(sim)? {
            writeln!(out, "{}", record.to_line(&self.pre_label, &self.post_label))?;
        }
        out.flush()?;
        info!("Saved {} connections of '{}' to {}", self.len(), self.label, path.display());
        Ok(path)
    }

    pub fn describe(&self) -> String {
        let mut s = format!(
            "Projection '{}' from '{}' [{:?}] to '{}' [{:?}]\n    Target: {}\n    Connector: {}\n    Local connections: {}",
            self.label,
            self.pre_label,
            self.pre_layout.shape(),
            self.post_label,
            self.post_layout.shape(),
            self.target,
            self.connector,
            self.len()
        );
        if let Some(fast) = &self.dynamics.fast {
            s.push_str(&format!("\n    Short-term plasticity: {:?}", fast));
        }
        if let Some(slow) = &self.dynamics.slow {
            s.push_str(&format!("\n    Long-term plasticity: {:?}", slow));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_format_serde() {
        let f: MatrixFormat = serde_json::from_str("\"array\"").unwrap();
        assert_eq!(f, MatrixFormat::Array);
        assert_eq!(MatrixFormat::default(), MatrixFormat::List);
    }

    #[test]
    fn test_connection_data_accessors() {
        let d = ConnectionData::List(vec![1.0, 2.0]);
        assert_eq!(d.as_list(), Some(&[1.0, 2.0][..]));
        assert!(d.as_array().is_none());
    }
}
