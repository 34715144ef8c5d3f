use clap::Parser;
use color_eyre::eyre;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Parser)]
#[command(author, version, about = "Trace-driven cycle-level CPU memory hierarchy simulator", long_about = None)]
struct Options {
    /// Simulator configuration file (JSON)
    #[arg(long = "config", value_name = "CONFIG")]
    pub config: PathBuf,

    /// Instructions to warm structures up before measuring
    #[arg(long = "warmup-instructions", alias = "warmup_instructions")]
    pub warmup_instructions: u64,

    /// Instructions in the measured window
    #[arg(long = "simulation-instructions", alias = "simulation_instructions")]
    pub simulation_instructions: u64,

    /// One xz-compressed instruction trace per configured core
    #[arg(long = "traces", value_name = "TRACE", required = true, num_args = 1..)]
    pub traces: Vec<PathBuf>,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    cpucachesim::init_logging();

    let start = Instant::now();
    let options = Options::parse();

    let config = cpucachesim::config::Config::open(&options.config)?;
    let mut engine = cpucachesim::Engine::new(
        &config,
        options.traces,
        options.warmup_instructions,
        options.simulation_instructions,
    )?;

    engine.run()?;

    let stdout = std::io::stdout();
    engine.report(&mut stdout.lock())?;
    eprintln!(
        "simulated {} cycles in {:?}",
        engine.cycle(),
        start.elapsed()
    );
    Ok(())
}
