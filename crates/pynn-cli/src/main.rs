//! # pynn CLI
//!
//! Runs JSON network descriptions on either simulator backend.

mod network;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use pynn_brian::BrianBackend;
use pynn_core::{Backend, CellType, Segment, Simulation};
use pynn_neuron::{NeuronBackend, Template};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use network::{Network, NetworkDescription};

#[derive(Parser)]
#[command(name = "pynn")]
#[command(version = "0.1.0")]
#[command(about = "Simulator-independent spiking network runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendKind {
    Neuron,
    Brian,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run a network description
    Run {
        /// Network description (JSON)
        network: PathBuf,
        /// Simulator backend
        #[arg(short, long, value_enum, default_value = "neuron")]
        backend: BackendKind,
        /// This process's rank
        #[arg(long)]
        rank: Option<usize>,
        /// Number of processes in the job
        #[arg(long)]
        np: Option<usize>,
        /// Where connection files and recorded data go
        #[arg(short, long, default_value = "pynn-output")]
        output: PathBuf,
        /// Verbose logging
        #[arg(long)]
        debug: bool,
    },

    /// List cell types
    Models,
}

fn init_logging(debug: bool) {
    env_logger::Builder::from_default_env()
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();
}

fn run_with_progress(sim: &mut Simulation, simtime: f64) -> anyhow::Result<()> {
    let total = (simtime / sim.dt()).round() as u64;
    let chunk = (total / 100).max(1);
    let bar = ProgressBar::new(total);
    bar.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} steps ({eta})",
    )?);
    let mut done = 0;
    while done < total {
        let steps = chunk.min(total - done);
        sim.run(steps as f64 * sim.dt())?;
        done += steps;
        bar.set_position(done);
    }
    bar.finish_with_message("done");
    Ok(())
}

/// `name`, suffixed with the rank when the job has several processes
fn per_rank(dir: &Path, name: &str, sim: &Simulation) -> PathBuf {
    if sim.num_processes() > 1 {
        dir.join(format!("{}.{}", name, sim.rank()))
    } else {
        dir.join(name)
    }
}

fn save_results(sim: &Simulation, network: &Network, description: &NetworkDescription, output: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(output).with_context(|| format!("creating {}", output.display()))?;
    for projection in &network.projections {
        projection.save_connections(sim, output.join(format!("{}.conn", projection.label())))?;
    }

    let segments = network
        .populations
        .iter()
        .zip(&description.populations)
        .filter(|(_, d)| !d.record.is_empty())
        .map(|(p, d)| p.get_data(sim, &d.record, None))
        .collect::<pynn_core::Result<Vec<Segment>>>()?;
    let path = per_rank(output, "segments.json", sim);
    serde_json::to_writer_pretty(BufWriter::new(File::create(&path)?), &segments)?;
    info!("Wrote {} segments to {}", segments.len(), path.display());
    Ok(())
}

fn print_summary(sim: &Simulation, network: &Network) -> anyhow::Result<()> {
    println!();
    println!("{} t = {} ms", "Finished:".green().bold(), sim.t());
    for population in &network.populations {
        let counts = population.get_spike_counts(sim, None)?;
        if counts.is_empty() {
            println!("  {:<16} {}", population.label().cyan(), "spikes not recorded".dimmed());
            continue;
        }
        let total: usize = counts.values().sum();
        let rate = population.mean_spike_count(sim)? / (sim.t() / 1000.0);
        println!(
            "  {:<16} {} spikes from {} local cells, {:.2} Hz",
            population.label().cyan(),
            total,
            counts.len(),
            rate
        );
    }
    for projection in &network.projections {
        println!(
            "  {:<16} {} local connections",
            projection.label().yellow(),
            projection.len()
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            network,
            backend,
            rank,
            np,
            output,
            debug,
        } => {
            let mut description = NetworkDescription::from_file(&network)?;
            if let Some(rank) = rank {
                description.setup.rank = rank;
            }
            if let Some(np) = np {
                description.setup.num_processes = np;
            }
            description.setup.debug |= debug;
            init_logging(description.setup.debug);

            println!("{} {}", "Loading network:".green().bold(), network.display());
            let seed = description.setup.rng_seed;
            let engine: Box<dyn Backend> = match backend {
                BackendKind::Neuron => Box::new(NeuronBackend::with_seed(seed)),
                BackendKind::Brian => Box::new(BrianBackend::with_seed(seed)),
            };
            println!("  Backend: {}", engine.name().cyan());
            let mut sim = Simulation::setup(engine, description.setup.clone())?;

            let base = network.parent().unwrap_or_else(|| Path::new("."));
            let built = Network::build(&mut sim, &description, base)?;
            println!(
                "  {} populations, {} projections (rank {} of {})",
                built.populations.len(),
                built.projections.len(),
                sim.rank(),
                sim.num_processes()
            );

            run_with_progress(&mut sim, description.simtime)?;
            save_results(&sim, &built, &description, &output)?;
            print_summary(&sim, &built)?;
            println!("{} {}", "Output:".green().bold(), output.display());
        }

        Commands::Models => {
            println!("{}", "Standard cell types:".green().bold());
            for cell_type in CellType::STANDARD.iter() {
                let recordable: Vec<String> = cell_type.recordable().iter().map(|v| v.to_string()).collect();
                println!("  {:<20} records {}", cell_type.name().cyan(), recordable.join(", "));
            }
            println!();
            println!("{}", "NEURON templates:".green().bold());
            for template in Template::ALL {
                println!("  {}", template.name().cyan());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_written_to_output() {
        let description: NetworkDescription = serde_json::from_str(
            r#"{
                "populations": [
                    { "label": "src", "shape": [3], "cell_type": "SpikeSourceArray",
                      "parameters": { "spike_times": [1.0, 4.0] } },
                    { "label": "tgt", "shape": [3], "cell_type": "IF_curr_exp", "record": ["spikes", "v"] }
                ],
                "projections": [
                    { "label": "feed", "pre": "src", "post": "tgt",
                      "connector": { "type": "one_to_one", "weights": 1.5, "delays": 0.5 } }
                ],
                "simtime": 10.0
            }"#,
        )
        .unwrap();
        let mut sim = Simulation::setup(Box::new(NeuronBackend::new()), description.setup.clone()).unwrap();
        let network = Network::build(&mut sim, &description, Path::new(".")).unwrap();
        run_with_progress(&mut sim, description.simtime).unwrap();
        assert!((sim.t() - 10.0).abs() < 1e-9);

        let dir = tempfile::tempdir().unwrap();
        save_results(&sim, &network, &description, dir.path()).unwrap();
        let conn = fs::read_to_string(dir.path().join("feed.conn")).unwrap();
        assert_eq!(conn.lines().count(), 3);
        assert!(conn.starts_with("src[0]\ttgt[0]\t1.5\t0.5"));

        let segments: Vec<serde_json::Value> =
            serde_json::from_reader(File::open(dir.path().join("segments.json")).unwrap()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0]["name"], "tgt");
    }

    #[test]
    fn test_rank_suffix() {
        let params = pynn_core::SetupParams {
            rank: 2,
            num_processes: 4,
            ..Default::default()
        };
        let sim = Simulation::setup(Box::new(NeuronBackend::new()), params).unwrap();
        assert_eq!(per_rank(Path::new("out"), "segments.json", &sim), Path::new("out/segments.json.2"));
    }
}
