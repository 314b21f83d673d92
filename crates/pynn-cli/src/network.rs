//! JSON network descriptions and how they are turned into populations and
//! projections.

use anyhow::{anyhow, Context};
use pynn_core::{
    AllToAllConnector, CellType, ConnectionValue, Connector, Distribution, FixedProbabilityConnector,
    FromFileConnector, OneToOneConnector, Parameters, Population, Projection, ProjectionOptions,
    RandomDistribution, RecordSelection, SeededRng, SetupParams, Simulation, SynapseDynamics, SynapseTarget,
    SynapseValues, Variable,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDescription {
    #[serde(default)]
    pub setup: SetupParams,
    pub populations: Vec<PopulationDescription>,
    #[serde(default)]
    pub projections: Vec<ProjectionDescription>,
    /// Run time (ms)
    pub simtime: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationDescription {
    pub label: String,
    pub shape: Vec<usize>,
    /// Standard type name (`IF_cond_exp`, ...) or a backend template
    pub cell_type: String,
    #[serde(default)]
    pub parameters: Parameters,
    /// Variables recorded from every cell
    #[serde(default)]
    pub record: Vec<Variable>,
    /// Distribution of initial membrane potentials
    #[serde(default)]
    pub v_init: Option<Distribution>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueDescription {
    Constant(f64),
    Random(Distribution),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorDescription {
    AllToAll {
        #[serde(default)]
        allow_self_connections: bool,
        weights: ValueDescription,
        #[serde(default)]
        delays: Option<ValueDescription>,
    },
    OneToOne {
        weights: ValueDescription,
        #[serde(default)]
        delays: Option<ValueDescription>,
    },
    FixedProbability {
        p: f64,
        #[serde(default)]
        allow_self_connections: bool,
        weights: ValueDescription,
        #[serde(default)]
        delays: Option<ValueDescription>,
    },
    FromFile {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionDescription {
    #[serde(default)]
    pub label: Option<String>,
    pub pre: String,
    pub post: String,
    pub connector: ConnectorDescription,
    #[serde(default)]
    pub target: SynapseTarget,
    #[serde(default)]
    pub dynamics: SynapseDynamics,
}

impl NetworkDescription {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Populations and projections built from a description
pub struct Network {
    pub populations: Vec<Population>,
    pub projections: Vec<Projection>,
}

/// Streams handed to random values are derived from the run seed so that
/// every node draws the same numbers.
fn value(description: &ValueDescription, seed: u64) -> anyhow::Result<ConnectionValue> {
    Ok(match description {
        ValueDescription::Constant(x) => ConnectionValue::Constant(*x),
        ValueDescription::Random(distribution) => {
            ConnectionValue::Random(RandomDistribution::new(distribution.clone(), SeededRng::new(seed))?)
        }
    })
}

fn synapse_values(
    weights: &ValueDescription,
    delays: &Option<ValueDescription>,
    seed: u64,
) -> anyhow::Result<SynapseValues> {
    let delays = delays.as_ref().map(|d| value(d, seed.wrapping_add(1))).transpose()?;
    Ok(SynapseValues::new(value(weights, seed)?, delays))
}

impl ConnectorDescription {
    /// `base` is resolved against relative file paths
    fn build(&self, seed: u64, base: &Path) -> anyhow::Result<Box<dyn Connector>> {
        Ok(match self {
            Self::AllToAll {
                allow_self_connections,
                weights,
                delays,
            } => Box::new(AllToAllConnector::new(
                *allow_self_connections,
                synapse_values(weights, delays, seed)?,
            )),
            Self::OneToOne { weights, delays } => {
                Box::new(OneToOneConnector::new(synapse_values(weights, delays, seed)?))
            }
            Self::FixedProbability {
                p,
                allow_self_connections,
                weights,
                delays,
            } => Box::new(FixedProbabilityConnector::new(
                *p,
                *allow_self_connections,
                synapse_values(weights, delays, seed)?,
            )?),
            Self::FromFile { path } => Box::new(FromFileConnector::new(base.join(path))),
        })
    }
}

impl Network {
    /// Create every population and projection, and switch on recording.
    /// `base` is the directory relative connection files are resolved against.
    pub fn build(sim: &mut Simulation, description: &NetworkDescription, base: &Path) -> anyhow::Result<Self> {
        let seed = sim.params().rng_seed;
        let mut populations = Vec::with_capacity(description.populations.len());
        for (i, p) in description.populations.iter().enumerate() {
            let cell_type: CellType = p.cell_type.parse()?;
            let mut population = Population::new(sim, &p.shape, cell_type, p.parameters.clone(), Some(p.label.as_str()))
                .with_context(|| format!("creating population '{}'", p.label))?;
            if let Some(distribution) = &p.v_init {
                let mut dist = RandomDistribution::new(distribution.clone(), SeededRng::new(seed.wrapping_add(1000 + i as u64)))?;
                population.random_init(sim, &mut dist)?;
            }
            for variable in &p.record {
                match variable {
                    Variable::Spikes => population.record(sim, RecordSelection::All)?,
                    Variable::V => population.record_v(sim, RecordSelection::All)?,
                    Variable::GsynExc | Variable::GsynInh => population.record_gsyn(sim, RecordSelection::All)?,
                    Variable::Other(name) => return Err(anyhow!("cannot record '{}' from '{}'", name, p.label)),
                }
            }
            populations.push(population);
        }

        let find = |label: &str| {
            populations
                .iter()
                .position(|p| p.label() == label)
                .ok_or_else(|| anyhow!("no population labelled '{}'", label))
        };
        let mut projections = Vec::with_capacity(description.projections.len());
        for (i, p) in description.projections.iter().enumerate() {
            let (pre, post) = (find(&p.pre)?, find(&p.post)?);
            let mut connector = p.connector.build(seed.wrapping_add(2000 + 2 * i as u64), base)?;
            let options = ProjectionOptions {
                target: p.target,
                dynamics: p.dynamics,
                label: p.label.clone(),
                rng: None,
            };
            let projection = Projection::new(sim, &populations[pre], &populations[post], connector.as_mut(), options)
                .with_context(|| format!("connecting '{}' to '{}'", p.pre, p.post))?;
            projections.push(projection);
        }
        Ok(Self {
            populations,
            projections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETWORK: &str = r#"{
        "setup": { "timestep": 0.1, "min_delay": 0.2, "rng_seed": 7 },
        "populations": [
            { "label": "input", "shape": [4], "cell_type": "SpikeSourcePoisson",
              "parameters": { "rate": 50.0 }, "record": ["spikes"] },
            { "label": "exc", "shape": [2, 2], "cell_type": "IF_cond_exp",
              "record": ["spikes", "v"],
              "v_init": { "name": "uniform", "low": -70.0, "high": -60.0 } }
        ],
        "projections": [
            { "pre": "input", "post": "exc",
              "connector": { "type": "fixed_probability", "p": 0.5,
                             "weights": { "name": "uniform", "low": 0.001, "high": 0.01 },
                             "delays": 1.0 } }
        ],
        "simtime": 50.0
    }"#;

    #[test]
    fn test_parse_description() {
        let network: NetworkDescription = serde_json::from_str(NETWORK).unwrap();
        assert_eq!(network.setup.min_delay, 0.2);
        assert_eq!(network.setup.max_delay, 10.0);
        assert_eq!(network.populations[1].record, vec![Variable::Spikes, Variable::V]);
        assert_eq!(network.projections[0].target, SynapseTarget::Excitatory);
        assert!(matches!(
            network.projections[0].connector,
            ConnectorDescription::FixedProbability { p, .. } if p == 0.5
        ));
    }

    #[test]
    fn test_build_and_run() {
        let description: NetworkDescription = serde_json::from_str(NETWORK).unwrap();
        let backend = Box::new(pynn_neuron::NeuronBackend::with_seed(7));
        let mut sim = Simulation::setup(backend, description.setup.clone()).unwrap();
        let network = Network::build(&mut sim, &description, Path::new(".")).unwrap();
        assert_eq!(network.populations.len(), 2);
        assert_eq!(network.projections[0].label(), "projection0");
        sim.run(description.simtime).unwrap();

        let data = network.populations[1]
            .get_data(&sim, &[Variable::V], None)
            .unwrap();
        assert_eq!(data.analogsignal("v").unwrap().n_samples(), 501);
    }

    #[test]
    fn test_unknown_population_is_reported() {
        let mut description: NetworkDescription = serde_json::from_str(NETWORK).unwrap();
        description.projections[0].post = "missing".into();
        let backend = Box::new(pynn_brian::BrianBackend::new());
        let mut sim = Simulation::setup(backend, description.setup.clone()).unwrap();
        let err = Network::build(&mut sim, &description, Path::new(".")).err().unwrap();
        assert!(err.to_string().contains("missing"));
    }
}
