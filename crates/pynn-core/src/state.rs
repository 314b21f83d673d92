//! Simulation context: clock, node metadata, id counter and the backend.
//!
//! Everything that used to be process-wide state lives here and is handed to
//! constructors explicitly.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::backend::{Backend, CellHandle, Clock, ConnectionHandle, SynapseTarget};
use crate::cells::CellSpec;
use crate::identity::{CellId, IdRange, IdentitySpace};
use crate::random::SeededRng;
use crate::{Delay, PynnError, Result, Time, Weight};

/// Setup parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupParams {
    /// Integration time step (ms)
    pub timestep: Time,
    /// Minimum synaptic delay (ms)
    pub min_delay: Delay,
    /// Maximum synaptic delay (ms)
    pub max_delay: Delay,
    /// Time recorded signals start at (ms)
    pub t_start: Time,
    /// This process's rank
    pub rank: usize,
    /// Number of worker processes
    pub num_processes: usize,
    /// Seed of the default random stream
    pub rng_seed: u64,
    /// Verbose logging
    pub debug: bool,
}

impl Default for SetupParams {
    fn default() -> Self {
        Self {
            timestep: 0.1,
            min_delay: 0.1,
            max_delay: 10.0,
            t_start: 0.0,
            rank: 0,
            num_processes: 1,
            rng_seed: 0,
            debug: false,
        }
    }
}

impl SetupParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.timestep > 0.0) {
            return Err(PynnError::InvalidArgument(format!(
                "timestep must be positive, got {}",
                self.timestep
            )));
        }
        if self.min_delay < self.timestep {
            return Err(PynnError::InvalidArgument(format!(
                "min_delay ({}) must not be smaller than the timestep ({})",
                self.min_delay, self.timestep
            )));
        }
        if self.max_delay < self.min_delay {
            return Err(PynnError::InvalidArgument(format!(
                "max_delay ({}) must not be smaller than min_delay ({})",
                self.max_delay, self.min_delay
            )));
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let params: Self = serde_json::from_str(&text)?;
        params.validate()?;
        Ok(params)
    }
}

/// Ids handed out by one creation call plus the arena of local handles.
///
/// `handles[i]` is `Some` exactly when `range.first + i` lives on this node.
#[derive(Debug, Clone)]
pub struct CreatedCells {
    pub range: IdRange,
    pub handles: Vec<Option<CellHandle>>,
}

impl CreatedCells {
    pub fn ids(&self) -> impl Iterator<Item = CellId> {
        self.range.iter()
    }

    pub fn local_ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.range
            .iter()
            .zip(&self.handles)
            .filter_map(|(id, h)| h.map(|_| id))
    }
}

/// One worker's view of the simulation
pub struct Simulation {
    params: SetupParams,
    clock: Clock,
    ids: IdentitySpace,
    gids: HashMap<CellId, CellHandle>,
    backend: Box<dyn Backend>,
    rng: SeededRng,
    population_count: usize,
    projection_count: usize,
}

impl Simulation {
    /// Should be called at the very beginning of a script.
    pub fn setup(backend: Box<dyn Backend>, params: SetupParams) -> Result<Self> {
        params.validate()?;
        let ids = IdentitySpace::new(params.rank, params.num_processes)?;
        info!(
            "Initialising {} backend on node {} of {} (dt = {} ms, min_delay = {} ms)",
            backend.name(),
            params.rank,
            params.num_processes,
            params.timestep,
            params.min_delay
        );
        Ok(Self {
            clock: Clock {
                t: 0.0,
                dt: params.timestep,
                t_start: params.t_start,
                min_delay: params.min_delay,
                max_delay: params.max_delay,
                rank: params.rank,
                num_processes: params.num_processes,
            },
            rng: SeededRng::new(params.rng_seed),
            params,
            ids,
            gids: HashMap::new(),
            backend,
            population_count: 0,
            projection_count: 0,
        })
    }

    pub fn params(&self) -> &SetupParams {
        &self.params
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Current simulation time (ms)
    pub fn t(&self) -> Time {
        self.clock.t
    }

    pub fn dt(&self) -> Time {
        self.clock.dt
    }

    pub fn min_delay(&self) -> Delay {
        self.clock.min_delay
    }

    pub fn max_delay(&self) -> Delay {
        self.clock.max_delay
    }

    pub fn rank(&self) -> usize {
        self.clock.rank
    }

    pub fn num_processes(&self) -> usize {
        self.clock.num_processes
    }

    pub fn identity(&self) -> &IdentitySpace {
        &self.ids
    }

    pub fn is_local(&self, id: CellId) -> bool {
        self.ids.is_local(id)
    }

    /// Backend handle of a local cell
    pub fn handle(&self, id: CellId) -> Option<CellHandle> {
        self.gids.get(&id).copied()
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }

    /// Next stream split off the run's master stream. Every node makes the
    /// same calls in the same order, so every node gets the same stream.
    pub fn next_stream(&mut self) -> SeededRng {
        self.rng.spawn()
    }

    pub(crate) fn next_population_label(&mut self) -> String {
        let label = format!("population{}", self.population_count);
        self.population_count += 1;
        label
    }

    pub(crate) fn next_projection_label(&mut self) -> String {
        let label = format!("projection{}", self.projection_count);
        self.projection_count += 1;
        label
    }

    /// Create `n` cells. Only the ones owned by this node get a backend object.
    pub fn create(&mut self, spec: &CellSpec, n: usize) -> Result<CreatedCells> {
        let range = self.ids.allocate(n)?;
        let mut handles = Vec::with_capacity(n);
        for id in range.iter() {
            if self.ids.is_local(id) {
                let handle = self.backend.create_cell(id, spec)?;
                self.gids.insert(id, handle);
                handles.push(Some(handle));
            } else {
                handles.push(None);
            }
        }
        debug!(
            "Created {} {} cells with ids {}..={} ({} local)",
            n,
            spec.cell_type,
            range.first,
            range.last,
            handles.iter().filter(|h| h.is_some()).count()
        );
        Ok(CreatedCells { range, handles })
    }

    /// Connect every source to every local target, keeping each pair with
    /// probability `p`. One uniform draw per source is taken for every
    /// target, local or not, so the result does not depend on the node count.
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        &mut self,
        sources: &[CellId],
        targets: &[CellId],
        weight: Option<Weight>,
        delay: Option<Delay>,
        synapse_target: SynapseTarget,
        p: f64,
        rng: Option<&mut SeededRng>,
    ) -> Result<Vec<ConnectionHandle>> {
        if !(0.0..=1.0).contains(&p) {
            return Err(PynnError::InvalidArgument(format!(
                "connection probability must be in [0, 1], got {}",
                p
            )));
        }
        let weight = weight.unwrap_or(0.0);
        let delay = delay.unwrap_or(self.clock.min_delay);
        if delay.is_nan() || delay < self.clock.min_delay {
            return Err(PynnError::ConstraintViolation(format!(
                "delay {} is below the minimum delay of {} ms",
                delay, self.clock.min_delay
            )));
        }
        debug!(
            "connecting {} sources to {} targets on host {}",
            sources.len(),
            targets.len(),
            self.rank()
        );

        let mut stream;
        let rng = match rng {
            Some(rng) => rng,
            None => {
                stream = self.next_stream();
                &mut stream
            }
        };

        let mut connections = Vec::new();
        for &tgt in targets {
            let keep: Vec<bool> = if p < 1.0 {
                rng.uniform(sources.len()).into_iter().map(|r| r < p).collect()
            } else {
                vec![true; sources.len()]
            };
            let Some(post) = self.handle(tgt) else { continue };
            for (&src, &k) in sources.iter().zip(&keep) {
                if k {
                    connections.push(self.backend.connect(src, post, synapse_target, weight, delay)?);
                }
            }
        }
        Ok(connections)
    }

    /// Run the simulation for `simtime` ms, returning the new time.
    pub fn run(&mut self, simtime: Time) -> Result<Time> {
        if simtime < 0.0 {
            return Err(PynnError::InvalidArgument(format!(
                "cannot run for a negative time ({})",
                simtime
            )));
        }
        let start = self.clock.steps();
        let n_steps = (simtime / self.clock.dt).round() as usize;
        for i in 0..n_steps {
            self.backend.advance(&self.clock)?;
            self.clock.t = (start + i + 1) as f64 * self.clock.dt;
        }
        info!("Ran {} steps, t = {} ms", n_steps, self.clock.t);
        Ok(self.clock.t)
    }

    /// Full reset: time back to zero, every cell, device and connection dropped.
    pub fn reset(&mut self) {
        self.backend.reset();
        self.ids.reset();
        self.gids.clear();
        self.clock.t = 0.0;
        self.rng = SeededRng::new(self.params.rng_seed);
        self.population_count = 0;
        self.projection_count = 0;
        info!("Simulation reset");
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("backend", &self.backend.name())
            .field("clock", &self.clock)
            .field("next_id", &self.ids.peek())
            .field("local_cells", &self.gids.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_are_valid() {
        let params = SetupParams::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.timestep, 0.1);
    }

    #[test]
    fn test_min_delay_below_timestep() {
        let params = SetupParams {
            timestep: 0.1,
            min_delay: 0.05,
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(PynnError::InvalidArgument(_))));
    }

    #[test]
    fn test_params_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("setup.json");
        fs::write(&path, r#"{"timestep": 0.05, "min_delay": 0.5, "rank": 1, "num_processes": 2}"#).unwrap();

        let params = SetupParams::from_json_file(&path).unwrap();
        assert_eq!(params.timestep, 0.05);
        assert_eq!(params.rank, 1);
        assert_eq!(params.max_delay, 10.0);
    }
}
