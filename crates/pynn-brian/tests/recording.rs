//! Recording through the clock-driven backend: SI state comes back in
//! PyNN units, and the same network description behaves like it does on
//! other backends.

use pynn_core::{
    AllToAllConnector, CellType, ConnectionValue, MatrixFormat, OneToOneConnector, ParameterValue, Parameters,
    Population, Projection, ProjectionOptions, PynnError, RecordSelection, SetupParams, Simulation,
    SynapseDynamics, SynapseTarget, SynapseValues, TsodyksMarkram, Unit, Variable,
};
use pynn_brian::BrianBackend;

fn sim(seed: u64) -> Simulation {
    let params = SetupParams {
        rng_seed: seed,
        ..SetupParams::default()
    };
    Simulation::setup(Box::new(BrianBackend::with_seed(seed)), params).unwrap()
}

fn source(sim: &mut Simulation, times: Vec<f64>) -> Population {
    let mut params = Parameters::new();
    params.insert("spike_times".into(), ParameterValue::Vector(times));
    Population::new(sim, &[1], CellType::SpikeSourceArray, params, Some("input")).unwrap()
}

#[test]
fn test_spike_times_in_milliseconds() {
    let mut sim = sim(0);
    let mut input = source(&mut sim, vec![1.0, 2.5, 7.0]);
    input.record(&mut sim, RecordSelection::All).unwrap();
    sim.run(10.0).unwrap();

    let segment = input.get_data(&sim, &[Variable::Spikes], None).unwrap();
    let train = segment.spiketrain(input.first_id()).unwrap();
    assert_eq!(train.units, Unit::Millisecond);
    assert_eq!(train.len(), 3);
    for (got, want) in train.times.iter().zip([1.0, 2.5, 7.0]) {
        assert!((got - want).abs() < 1e-9, "{} != {}", got, want);
    }
    assert!((train.t_stop - 10.0).abs() < 1e-9);
}

#[test]
fn test_membrane_potential_in_millivolts() {
    let mut sim = sim(0);
    let mut pop = Population::new(&mut sim, &[3], CellType::IfCurrExp, Parameters::new(), None).unwrap();
    pop.record_v(&mut sim, RecordSelection::All).unwrap();
    sim.run(5.0).unwrap();

    let segment = pop.get_data(&sim, &[Variable::V], None).unwrap();
    let v = segment.analogsignal("v").unwrap();
    assert_eq!(v.units, Unit::Millivolt);
    assert_eq!(v.n_samples(), 51);
    assert!(v.signal.iter().all(|&x| (x + 65.0).abs() < 1e-6));
}

#[test]
fn test_conductance_follows_input() {
    let mut sim = sim(0);
    let input = source(&mut sim, vec![2.0]);
    let mut post = Population::new(&mut sim, &[1], CellType::IfCondExp, Parameters::new(), Some("post")).unwrap();
    post.record_gsyn(&mut sim, RecordSelection::All).unwrap();
    let mut connector = OneToOneConnector::new(SynapseValues::new(0.01, Some(ConnectionValue::Constant(1.0))));
    Projection::new(&mut sim, &input, &post, &mut connector, ProjectionOptions::default()).unwrap();
    sim.run(10.0).unwrap();

    let segment = post.get_data(&sim, &[Variable::GsynExc, Variable::GsynInh], None).unwrap();
    let exc = segment.analogsignal("gsyn_exc").unwrap();
    let inh = segment.analogsignal("gsyn_inh").unwrap();
    assert_eq!(exc.units, Unit::Microsiemens);
    let peak = exc.signal.iter().copied().fold(0.0, f64::max);
    assert!(peak > 0.009 && peak <= 0.01, "peak {}", peak);
    assert!(inh.signal.iter().all(|&g| g == 0.0));
}

#[test]
fn test_poisson_rate_and_reproducibility() {
    let run = |seed| {
        let mut sim = sim(seed);
        let mut params = Parameters::new();
        params.insert("rate".into(), 100.0.into());
        let mut pop = Population::new(&mut sim, &[20], CellType::SpikeSourcePoisson, params, None).unwrap();
        pop.record(&mut sim, RecordSelection::All).unwrap();
        sim.run(1000.0).unwrap();
        pop.get_spike_counts(&sim, None).unwrap()
    };
    let counts = run(11);
    assert_eq!(counts, run(11));

    let mean = counts.values().sum::<usize>() as f64 / counts.len() as f64;
    assert!((70.0..130.0).contains(&mean), "mean count {}", mean);
}

#[test]
fn test_weights_reported_in_pynn_units() {
    let mut sim = sim(0);
    let pre = Population::new(&mut sim, &[2], CellType::IfCondAlpha, Parameters::new(), None).unwrap();
    let post = Population::new(&mut sim, &[2], CellType::IfCondAlpha, Parameters::new(), None).unwrap();
    let mut connector = AllToAllConnector::new(false, SynapseValues::new(0.004, None));
    let prj = Projection::new(&mut sim, &pre, &post, &mut connector, ProjectionOptions::default()).unwrap();
    let weights = prj.get_weights(&sim, MatrixFormat::Array).unwrap();
    let weights = weights.as_array().unwrap();
    assert_eq!(weights.dim(), (2, 2));
    assert!((weights[[0, 1]] - 0.004).abs() < 1e-12);

    let delays = prj.get_delays(&sim, MatrixFormat::List).unwrap();
    assert!(delays.as_list().unwrap().iter().all(|&d| (d - 0.1).abs() < 1e-12));
}

#[test]
fn test_short_term_plasticity_must_come_first() {
    let mut sim = sim(0);
    let input = source(&mut sim, vec![1.0, 3.0, 5.0]);
    let post = Population::new(&mut sim, &[1], CellType::IfCurrExp, Parameters::new(), None).unwrap();
    let mut connector = AllToAllConnector::new(false, SynapseValues::new(1.0, None));
    Projection::new(&mut sim, &input, &post, &mut connector, ProjectionOptions::default()).unwrap();

    let options = ProjectionOptions {
        target: SynapseTarget::Excitatory,
        dynamics: SynapseDynamics {
            fast: Some(TsodyksMarkram::default()),
            slow: None,
        },
        ..ProjectionOptions::default()
    };
    let err = Projection::new(&mut sim, &input, &post, &mut connector, options).unwrap_err();
    assert!(matches!(err, PynnError::Backend(_)));
}

#[test]
fn test_native_cell_types_rejected() {
    let mut sim = sim(0);
    let err = Population::new(
        &mut sim,
        &[2],
        CellType::Native("StandardIF".into()),
        Parameters::new(),
        None,
    )
    .unwrap_err();
    assert!(matches!(err, PynnError::InvalidModel(_)));
}
