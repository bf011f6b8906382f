use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use libcint::prelude::CInt;
#[cfg(feature = "use_mpi")]
use mpi::traits::Communicator;
use showcase_workshop_rstsr_fcidump::prelude::*;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct CliParser {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CliArgsCommon {
    #[clap(long = "options", help = "Path to a json file with run options; flags below override it")]
    options_file: Option<PathBuf>,

    #[clap(long = "prefix", help = "Output file prefix")]
    prefix: Option<String>,

    #[clap(long = "basis", help = "Basis set name, used in output file names")]
    basis: Option<String>,

    #[clap(long = "output-dir", help = "Directory the output tree is placed in")]
    output_dir: Option<PathBuf>,

    #[clap(long = "tile-size", help = "Tile size of the index spaces")]
    tile_size: Option<usize>,

    #[clap(long = "nproc", help = "Number of ranks of the process group")]
    nproc: Option<usize>,

    #[clap(long = "memory", help = "Bytes of tensor storage per rank")]
    memory_per_rank: Option<usize>,

    #[clap(long = "readt", help = "Restore the transformed tensors from checkpoint files")]
    readt: bool,

    #[clap(long = "writet", help = "Write the transformed tensors to checkpoint files")]
    writet: bool,

    #[clap(long = "accelerated", help = "Run tile kernels in parallel")]
    accelerated: bool,

    #[clap(long = "solver", help = "External FCI program, called with the FCIDUMP path")]
    solver: Option<PathBuf>,

    #[clap(short, long = "verbose", action = clap::ArgAction::Count, help = "Increase log verbosity")]
    verbose: u8,
}

#[derive(Args, Debug)]
struct CliArgs {
    #[clap(short, long = "mol", help = "Path to the json file containing molecular data")]
    mol_file: String,

    #[clap(short, long = "aux", help = "Path to the json file containing auxiliary basis data")]
    aux_file: String,

    #[clap(flatten)]
    common: CliArgsCommon,
}

#[derive(Args, Debug)]
struct CliArgsStandalone {
    #[clap(long = "lcao", help = "MO coefficients, npy [nbf, nmo]")]
    lcao_file: PathBuf,

    #[clap(long = "hcore", help = "Core Hamiltonian, npy [nbf, nbf]")]
    hcore_file: PathBuf,

    #[clap(long = "fock", help = "Fock matrix, npy [nbf, nbf]")]
    fock_file: PathBuf,

    #[clap(long = "cderi", help = "Cholesky vectors, npy [nbf, nbf, count]")]
    cderi_file: PathBuf,

    #[clap(long = "nelec", help = "Number of electrons")]
    nelec: usize,

    #[clap(long = "enuc", help = "Nuclear repulsion energy", default_value_t = 0.0)]
    e_nuc: f64,

    #[clap(flatten)]
    common: CliArgsCommon,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[clap(name = "fci", about = "Run RI-RHF and export the MO integrals as FCIDUMP")]
    Fci(CliArgs),

    #[clap(name = "fci-standalone", about = "Export the MO integrals as FCIDUMP with SCF data provided by user")]
    FciStandalone(CliArgsStandalone),
}

impl CliArgsCommon {
    fn options(&self) -> Result<FciOptions> {
        let mut options = match &self.options_file {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
                serde_json::from_str::<FciOptions>(&text).map_err(|err| Error::format(path, err.to_string()))?
            },
            None => FciOptions::default(),
        };
        if let Some(prefix) = &self.prefix {
            options.output_file_prefix = prefix.clone();
        }
        if let Some(basis) = &self.basis {
            options.basis = basis.clone();
        }
        if let Some(output_dir) = &self.output_dir {
            options.output_dir = output_dir.clone();
        }
        options.tile_size = self.tile_size.unwrap_or(options.tile_size);
        options.nproc = self.nproc.unwrap_or(options.nproc);
        options.memory_per_rank = self.memory_per_rank.or(options.memory_per_rank);
        options.readt |= self.readt;
        options.writet |= self.writet;
        options.accelerated |= self.accelerated;
        options.fci |= self.solver.is_some();
        Ok(options)
    }

    fn solver(&self) -> Option<ExternalCommandSolver> {
        self.solver.as_ref().map(ExternalCommandSolver::new)
    }

    fn init_logging(&self) {
        let level = match self.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        };
        tracing_subscriber::fmt().with_max_level(level).with_target(false).init();
    }
}

fn run_driver(source: &dyn IntegralSource, common: &CliArgsCommon, options: &FciOptions) -> Result<FciResults> {
    let solver = common.solver();
    fci_driver(source, options, solver.as_ref().map(|s| s as &dyn FciSolver))
}

fn run(command: Command) -> Result<FciResults> {
    match command {
        Command::Fci(cli_args) => {
            cli_args.common.init_logging();
            let options = cli_args.common.options()?;
            let cint_data = CInt::from_json(&cli_args.mol_file);
            let aux_cint_data = CInt::from_json(&cli_args.aux_file);
            let source = RiRhfSource::new(cint_data, aux_cint_data, &options);
            run_driver(&source, &cli_args.common, &options)
        },
        Command::FciStandalone(cli_args) => {
            cli_args.common.init_logging();
            let options = cli_args.common.options()?;
            let source = DenseSource::from_npy(
                &cli_args.lcao_file,
                &cli_args.hcore_file,
                &cli_args.fock_file,
                &cli_args.cderi_file,
                cli_args.nelec,
                cli_args.e_nuc,
                &options,
            )?;
            run_driver(&source, &cli_args.common, &options)
        },
    }
}

fn main() -> ExitCode {
    let args = CliParser::parse();

    // kept alive until the end of main; dropping it finalizes MPI
    #[cfg(feature = "use_mpi")]
    let universe = mpi::initialize();
    #[cfg(feature = "use_mpi")]
    let reporting = universe.as_ref().is_none_or(|universe| universe.world().rank() == 0);
    #[cfg(not(feature = "use_mpi"))]
    let reporting = true;

    match run(args.command) {
        Ok(results) => {
            match serde_json::to_string_pretty(&results) {
                Ok(json) if reporting => println!("{json}"),
                Ok(_) => (),
                Err(err) => tracing::warn!("cannot serialize results: {err}"),
            }
            ExitCode::SUCCESS
        },
        Err(err) => {
            // stage and root cause are both part of the message
            eprintln!("error: {err}");
            ExitCode::FAILURE
        },
    }
}
