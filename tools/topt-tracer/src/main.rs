use clap::Parser;
use color_eyre::eyre::{self, bail, WrapErr};
use std::io::BufWriter;
use std::path::PathBuf;
use trace_model::topt::ToptWriter;
use trace_model::InstructionReader;

/// Derives the future vertex-id access sequence of a trace's irregular
/// arrays, consumed offline by the T-OPT replacement policy.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// Input instruction trace (.xz)
    #[arg(long = "in-trace", alias = "in_trace")]
    pub in_trace: PathBuf,

    /// Output vertex-id trace (.topttrace)
    #[arg(long = "out-trace", alias = "out_trace")]
    pub out_trace: PathBuf,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let options = Options::parse();
    if options.in_trace.extension().map_or(true, |ext| ext != "xz") {
        bail!("only .xz traces are supported");
    }
    if options.out_trace.exists() {
        bail!("refusing to overwrite {}", options.out_trace.display());
    }

    let mut reader = InstructionReader::open(&options.in_trace)
        .wrap_err("cannot open the input trace")?;
    let header = reader.header().clone();
    eprintln!(
        "found {} irregular arrays in the trace",
        header.irreg_arrays.len()
    );
    for (i, (begin, end)) in header.irreg_arrays.iter().enumerate() {
        eprintln!("array {i}: {begin:#x}..{end:#x}");
    }

    let out = std::fs::File::create(&options.out_trace)
        .wrap_err("cannot create the output trace")?;
    let mut writer = ToptWriter::new(BufWriter::new(out));

    // One pass, in program order; stop at the first wrap-around.
    let mut instructions = 0u64;
    while reader.restarts() == 0 {
        let instruction = reader.next_instruction()?;
        if reader.restarts() > 0 {
            break;
        }
        instructions += 1;
        for reference in instruction.memory_references() {
            if let Some(vertex_id) = header.vertex_id(reference.vaddr) {
                writer.push(vertex_id)?;
            }
        }
    }

    let written = writer.finish()?;
    eprintln!("{written} vertex touches over {instructions} instructions");
    Ok(())
}
