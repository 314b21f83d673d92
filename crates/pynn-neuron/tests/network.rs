//! Whole-network behaviour on the compartmental backend, including runs that
//! pretend to be one node of a multi-process job.

use pynn_core::connectors::parse_connections;
use pynn_core::{
    AllToAllConnector, CellId, CellType, CellValues, ConnectionValue, Distribution, FixedProbabilityConnector,
    FromFileConnector, MatrixFormat, OneToOneConnector, Parameters, Population, Projection, ProjectionOptions,
    PynnError, RandomDistribution, RecordSelection, SetupParams, Simulation, SpikePairRule, StdpMechanism,
    SynapseDynamics, SynapseTarget, SynapseValues, Variable, WeightDependence,
};
use pynn_neuron::NeuronBackend;
use std::collections::BTreeSet;

fn node(rank: usize, np: usize) -> Simulation {
    let params = SetupParams {
        rank,
        num_processes: np,
        rng_seed: 42,
        ..SetupParams::default()
    };
    Simulation::setup(Box::new(NeuronBackend::new()), params).unwrap()
}

fn population(sim: &mut Simulation, shape: &[usize], label: &str) -> Population {
    Population::new(sim, shape, CellType::IfCurrAlpha, Parameters::new(), Some(label)).unwrap()
}

fn stdp(ddf: f64) -> SynapseDynamics {
    SynapseDynamics {
        fast: None,
        slow: Some(StdpMechanism::new(SpikePairRule::default(), WeightDependence::default(), ddf).unwrap()),
    }
}

#[test]
fn test_locate_and_get_are_inverse() {
    let mut sim = node(0, 1);
    let pop = population(&mut sim, &[3, 4, 2], "cube");
    for id in pop.all() {
        let address = pop.locate(id).unwrap();
        assert_eq!(pop.get(&address).unwrap(), id);
    }
    assert!(matches!(
        pop.locate(CellId(pop.last_id().0 + 1)),
        Err(PynnError::IndexError(_))
    ));
}

#[test]
fn test_round_robin_partition() {
    let np = 3;
    let mut seen = BTreeSet::new();
    let mut all = None;
    for rank in 0..np {
        let mut sim = node(rank, np);
        let pop = population(&mut sim, &[10], "p");
        for &id in pop.local_cells() {
            assert_eq!(id.value() as usize % np, rank);
            assert!(seen.insert(id), "{} owned twice", id);
        }
        all = Some(pop.all().collect::<BTreeSet<_>>());
    }
    assert_eq!(Some(seen), all);
}

#[test]
fn test_delay_below_min_rejected() {
    let mut sim = node(0, 1);
    let pre = population(&mut sim, &[2], "pre");
    let post = population(&mut sim, &[2], "post");
    let mut connector = AllToAllConnector::new(true, SynapseValues::new(0.1, Some(ConnectionValue::Constant(0.05))));
    let err = Projection::new(&mut sim, &pre, &post, &mut connector, ProjectionOptions::default()).unwrap_err();
    assert!(matches!(err, PynnError::ConstraintViolation(_)));
}

#[test]
fn test_nan_delay_rejected() {
    let mut sim = node(0, 1);
    let pre = population(&mut sim, &[2], "pre");
    let post = population(&mut sim, &[2], "post");
    let mut connector =
        AllToAllConnector::new(true, SynapseValues::new(0.1, Some(ConnectionValue::Constant(f64::NAN))));
    let err = Projection::new(&mut sim, &pre, &post, &mut connector, ProjectionOptions::default()).unwrap_err();
    assert!(matches!(err, PynnError::ConstraintViolation(_)));

    let mut connector = AllToAllConnector::new(true, SynapseValues::new(0.1, Some(ConnectionValue::Constant(1.0))));
    let mut prj = Projection::new(&mut sim, &pre, &post, &mut connector, ProjectionOptions::default()).unwrap();
    let err = prj.set_delays(&mut sim, f64::NAN).unwrap_err();
    assert!(matches!(err, PynnError::ConstraintViolation(_)));
    let delays = prj.get_delays(&sim, MatrixFormat::List).unwrap();
    assert!(delays.as_list().unwrap().iter().all(|&d| d == 1.0));

    let sources: Vec<CellId> = pre.all().collect();
    let targets: Vec<CellId> = post.all().collect();
    let err = sim
        .connect(&sources, &targets, Some(0.1), Some(f64::NAN), SynapseTarget::Excitatory, 1.0, None)
        .unwrap_err();
    assert!(matches!(err, PynnError::ConstraintViolation(_)));
}

#[test]
fn test_failed_updates_leave_projection_unchanged() {
    let mut sim = node(0, 1);
    let pre = population(&mut sim, &[3], "pre");
    let post = population(&mut sim, &[3], "post");
    let mut connector = AllToAllConnector::new(true, SynapseValues::new(0.2, Some(ConnectionValue::Constant(1.0))));
    let mut prj = Projection::new(&mut sim, &pre, &post, &mut connector, ProjectionOptions::default()).unwrap();
    assert_eq!(prj.len(), 9);

    let before_w = prj.get_weights(&sim, MatrixFormat::List).unwrap();
    let err = prj.set_weights(&mut sim, vec![0.5; 4]).unwrap_err();
    assert!(matches!(err, PynnError::ConstraintViolation(_)));
    assert_eq!(prj.get_weights(&sim, MatrixFormat::List).unwrap(), before_w);

    let before_d = prj.get_delays(&sim, MatrixFormat::List).unwrap();
    let mut delays = vec![2.0; 9];
    delays[4] = 0.01;
    assert!(prj.set_delays(&mut sim, delays).is_err());
    assert_eq!(prj.get_delays(&sim, MatrixFormat::List).unwrap(), before_d);

    prj.set_delays(&mut sim, 2.5).unwrap();
    let after = prj.get_delays(&sim, MatrixFormat::List).unwrap();
    assert!(after.as_list().unwrap().iter().all(|&d| d == 2.5));
}

#[test]
fn test_dendritic_delay_split() {
    let mut sim = node(0, 1);
    let pre = population(&mut sim, &[1], "pre");
    let post = population(&mut sim, &[1], "post");
    let mut connector = OneToOneConnector::new(SynapseValues::new(0.5, Some(ConnectionValue::Constant(5.0))));
    let options = ProjectionOptions {
        dynamics: stdp(0.3),
        ..ProjectionOptions::default()
    };
    let mut prj = Projection::new(&mut sim, &pre, &post, &mut connector, options).unwrap();
    let (pre_delay, post_delay) = prj.stdp_delays(&sim).unwrap()[0];
    assert!((pre_delay - 3.5).abs() < 1e-9);
    assert!((post_delay - 1.5).abs() < 1e-9);

    prj.set_delays(&mut sim, 10.0).unwrap();
    let (pre_delay, post_delay) = prj.stdp_delays(&sim).unwrap()[0];
    assert!((pre_delay - 7.0).abs() < 1e-9);
    assert!((post_delay - 3.0).abs() < 1e-9);
}

#[test]
fn test_large_dendritic_fraction_needs_single_process() {
    let mut sim = node(1, 2);
    let pre = population(&mut sim, &[4], "pre");
    let post = population(&mut sim, &[4], "post");
    let mut connector = AllToAllConnector::default();
    let options = ProjectionOptions {
        dynamics: stdp(0.8),
        ..ProjectionOptions::default()
    };
    let err = Projection::new(&mut sim, &pre, &post, &mut connector, options).unwrap_err();
    assert!(matches!(err, PynnError::UnsupportedConfiguration(_)));
}

#[test]
fn test_recording_is_a_union() {
    let mut sim = node(0, 1);
    let mut pop = population(&mut sim, &[5], "p");
    let ids: Vec<CellId> = pop.all().collect();
    pop.record(&mut sim, RecordSelection::Cells(vec![ids[1], ids[2]])).unwrap();
    pop.record(&mut sim, RecordSelection::Cells(vec![ids[2], ids[3]])).unwrap();
    let recorded: Vec<CellId> = pop
        .recorder(&Variable::Spikes)
        .unwrap()
        .recorded()
        .iter()
        .copied()
        .collect();
    assert_eq!(recorded, vec![ids[1], ids[2], ids[3]]);

    pop.record_v(&mut sim, RecordSelection::Cells(vec![ids[3]])).unwrap();
    pop.record_v(&mut sim, RecordSelection::Cells(vec![ids[1], ids[2]])).unwrap();
    sim.run(1.0).unwrap();
    let segment = pop.get_data(&sim, &[Variable::Spikes, Variable::V], None).unwrap();
    let trains: Vec<CellId> = segment.spiketrains().iter().map(|st| st.source_id).collect();
    assert_eq!(trains, vec![ids[1], ids[2], ids[3]]);
    assert_eq!(segment.analogsignal("v").unwrap().source_ids, vec![ids[1], ids[2], ids[3]]);
}

#[test]
fn test_membrane_trace_has_live_row() {
    let mut sim = node(0, 1);
    let mut pop = population(&mut sim, &[4], "p");
    pop.record_v(&mut sim, RecordSelection::All).unwrap();
    sim.run(10.0).unwrap();

    let segment = pop.get_data(&sim, &[Variable::V], None).unwrap();
    let v = segment.analogsignal("v").unwrap();
    assert_eq!(v.n_samples(), 101);
    assert_eq!(v.n_channels(), 4);
    assert_eq!(v.channel_indexes, vec![0, 1, 2, 3]);
    assert!((v.signal[[0, 0]] + 65.0).abs() < 1e-9);
}

#[test]
fn test_saved_connections_load_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exc.conn");

    let mut sim = node(0, 1);
    let pre = population(&mut sim, &[2, 3], "exc");
    let post = population(&mut sim, &[4], "out");
    let weights = RandomDistribution::with_seed(Distribution::Uniform { low: 0.1, high: 0.9 }, 3).unwrap();
    let mut connector = FixedProbabilityConnector::new(
        0.5,
        false,
        SynapseValues::new(weights, Some(ConnectionValue::Constant(1.5))),
    )
    .unwrap();
    let prj = Projection::new(&mut sim, &pre, &post, &mut connector, ProjectionOptions::default()).unwrap();
    assert_eq!(prj.save_connections(&sim, &path).unwrap(), path);

    let text = std::fs::read_to_string(&path).unwrap();
    let records = parse_connections(&text).unwrap();
    assert_eq!(records.len(), prj.len());
    assert!(text.lines().all(|l| l.starts_with("exc[")));

    let mut reload = FromFileConnector::new(&path);
    let copy = Projection::new(&mut sim, &pre, &post, &mut reload, ProjectionOptions::default()).unwrap();
    let w0 = prj.get_weights(&sim, MatrixFormat::List).unwrap();
    let w1 = copy.get_weights(&sim, MatrixFormat::List).unwrap();
    for (a, b) in w0.as_list().unwrap().iter().zip(w1.as_list().unwrap()) {
        assert!((a - b).abs() < 1e-12);
    }
    assert_eq!(
        prj.get_delays(&sim, MatrixFormat::List).unwrap(),
        copy.get_delays(&sim, MatrixFormat::List).unwrap()
    );
}

#[test]
fn test_save_suffixes_rank() {
    let dir = tempfile::tempdir().unwrap();
    let mut sim = node(1, 2);
    let pre = population(&mut sim, &[2], "a");
    let post = population(&mut sim, &[2], "b");
    let prj = Projection::new(
        &mut sim,
        &pre,
        &post,
        &mut AllToAllConnector::default(),
        ProjectionOptions::default(),
    )
    .unwrap();
    let written = prj.save_connections(&sim, dir.path().join("ab.conn")).unwrap();
    assert!(written.to_string_lossy().ends_with("ab.conn.1"));
}

#[test]
fn test_rset_independent_of_node_count() {
    let draw = || RandomDistribution::with_seed(Distribution::Normal { mean: -60.0, std: 5.0 }, 99).unwrap();

    let mut single = node(0, 1);
    let mut pop = population(&mut single, &[7], "p");
    pop.rset(&mut single, "v_rest", &mut draw()).unwrap();
    let reference: Vec<f64> = pop
        .get_parameter(&single, "v_rest")
        .unwrap()
        .iter()
        .map(|v| v.as_scalar().unwrap())
        .collect();

    for rank in 0..2 {
        let mut sim = node(rank, 2);
        let mut pop = population(&mut sim, &[7], "p");
        pop.rset(&mut sim, "v_rest", &mut draw()).unwrap();
        let values = pop.get_parameter(&sim, "v_rest").unwrap();
        for (&id, value) in pop.local_cells().iter().zip(&values) {
            let i = pop.layout().offset(id).unwrap();
            assert!((value.as_scalar().unwrap() - reference[i]).abs() < 1e-12);
        }
    }
}

#[test]
fn test_fixed_probability_same_network_on_every_split() {
    let build = |rank: usize, np: usize| {
        let mut sim = node(rank, np);
        let pre = population(&mut sim, &[6], "pre");
        let post = population(&mut sim, &[6], "post");
        let mut pairs = BTreeSet::new();
        for _ in 0..2 {
            let mut connector = FixedProbabilityConnector::new(0.4, true, SynapseValues::new(0.1, None)).unwrap();
            let prj = Projection::new(&mut sim, &pre, &post, &mut connector, ProjectionOptions::default()).unwrap();
            pairs.extend(prj.connections().iter().map(|c| (prj.label().to_string(), c.pre, c.post)));
        }
        pairs
    };
    let whole = build(0, 1);
    let mut union = BTreeSet::new();
    for rank in 0..3 {
        union.extend(build(rank, 3));
    }
    assert_eq!(union, whole);
}

#[test]
fn test_set_rejects_invalid_value() {
    let mut sim = node(0, 1);
    let mut pop = population(&mut sim, &[2], "p");
    let err = pop
        .set(&mut sim, "tau_m", CellValues::Scalar(vec![1.0, 2.0].into()))
        .unwrap_err();
    assert!(matches!(err, PynnError::InvalidParameterValue(_)));
}

fn pairs(prj: &Projection) -> BTreeSet<(CellId, CellId)> {
    prj.connections().iter().map(|c| (c.pre, c.post)).collect()
}

#[test]
fn test_probabilistic_projections_draw_independently() {
    let mut sim = node(0, 1);
    let input = population(&mut sim, &[20], "input");
    let cells = population(&mut sim, &[20], "cells");
    let mut connector = FixedProbabilityConnector::new(0.2, false, SynapseValues::new(0.1, None)).unwrap();
    let exc = Projection::new(&mut sim, &input, &cells, &mut connector, ProjectionOptions::default()).unwrap();
    let inh = Projection::new(&mut sim, &input, &cells, &mut connector, ProjectionOptions::default()).unwrap();
    assert!(!exc.is_empty() && !inh.is_empty());
    assert_ne!(pairs(&exc), pairs(&inh));

    sim.reset();
    let input = population(&mut sim, &[20], "input");
    let cells = population(&mut sim, &[20], "cells");
    let again = Projection::new(&mut sim, &input, &cells, &mut connector, ProjectionOptions::default()).unwrap();
    assert_eq!(pairs(&again), pairs(&exc));
}

#[test]
fn test_sampled_recordings_draw_independently() {
    let mut sim = node(0, 1);
    let mut a = population(&mut sim, &[50], "a");
    let mut b = population(&mut sim, &[50], "b");
    a.record(&mut sim, RecordSelection::Count(10)).unwrap();
    b.record(&mut sim, RecordSelection::Count(10)).unwrap();
    let offsets = |pop: &Population| -> Vec<usize> {
        pop.recorder(&Variable::Spikes)
            .unwrap()
            .recorded()
            .iter()
            .map(|id| (id.value() - pop.first_id().value()) as usize)
            .collect()
    };
    assert_eq!(offsets(&a).len(), 10);
    assert_ne!(offsets(&a), offsets(&b));
}
