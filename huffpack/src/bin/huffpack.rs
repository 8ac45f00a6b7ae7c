use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use huffpack::{default_output_path, ArchiveError, ArchiveOptions, Archiver, ConcatOrder};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "huffpack",
    about = "Pack files and directories into a Huffman-coded archive"
)]
struct Args {
    /// Files and directories to pack
    inputs: Vec<String>,
    /// Output archive path (defaults to the first input plus ".compressed")
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Store a password marker in the archive header
    #[arg(short, long)]
    password: Option<String>,
    /// Skip the size confirmation prompt
    #[arg(short = 'y', long)]
    yes: bool,
    /// Number of worker threads (0 uses every available core)
    #[arg(long, default_value_t = 0)]
    workers: usize,
    /// Concatenate encoded records in input order instead of worker order
    #[arg(long)]
    input_order: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.inputs.is_empty() {
        eprintln!("Missing file name");
        eprintln!("try 'huffpack <file_name>'");
        return ExitCode::SUCCESS;
    }

    let options = ArchiveOptions {
        password: args.password,
        workers: args.workers,
        concat_order: if args.input_order {
            ConcatOrder::ByInput
        } else {
            ConcatOrder::ByWorker
        },
    };
    let archiver = match Archiver::init(options) {
        Ok(archiver) => archiver,
        Err(error) => {
            eprintln!("{error}");
            eprintln!("Process has been terminated");
            return ExitCode::SUCCESS;
        }
    };

    let plan = match archiver.analyze(&args.inputs) {
        Ok(plan) => plan,
        Err(error @ (ArchiveError::MissingInputs | ArchiveError::MissingInputFile(_))) => {
            eprintln!("{error}");
            eprintln!("Process has been terminated");
            return ExitCode::SUCCESS;
        }
        Err(error) => {
            eprintln!("huffpack: {error}");
            return ExitCode::FAILURE;
        }
    };

    println!(
        "The size of the sum of ORIGINAL files is: {} bytes",
        plan.input_bytes()
    );
    println!(
        "The size of the COMPRESSED file will be: {} bytes",
        plan.estimated_bytes()
    );
    if plan.input_bytes() > 0 {
        println!(
            "Compressed file's size will be [%{:.2}] of the original",
            100.0 * plan.estimated_bytes() as f64 / plan.input_bytes() as f64
        );
    }
    if plan.estimated_bytes() > plan.input_bytes() {
        println!();
        println!("COMPRESSED FILE'S SIZE WILL BE HIGHER THAN THE SUM OF ORIGINALS");
        println!();
    }

    if !args.yes && !confirm() {
        println!();
        println!("Process has been aborted");
        return ExitCode::SUCCESS;
    }

    let output = args
        .output
        .unwrap_or_else(|| default_output_path(&args.inputs[0]));
    match archiver.write_archive(&plan, &args.inputs, &output) {
        Ok(stats) => {
            println!();
            println!("Created compressed file: {}", output.display());
            println!(
                "Compression is complete ({} bytes written)",
                stats.output_bytes
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("huffpack: {error}");
            ExitCode::FAILURE
        }
    }
}

fn confirm() -> bool {
    println!("If you wish to abort this process write 0 and press enter");
    println!("If you want to continue write any other number and press enter");
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line).is_err() {
        return false;
    }
    line.trim().parse::<i64>().map(|value| value != 0).unwrap_or(false)
}
