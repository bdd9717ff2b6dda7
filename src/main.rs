extern crate minigrid;

use clap::{Parser, ValueEnum};
use minigrid::output::FileOutput;
use minigrid::simulation::SystemSizes;
use minigrid::{run_project, RunMode};
use std::ffi::OsStr;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct MinigridArgs {
    /// Path to the JSON input document.
    input_file: String,
    #[arg(long, short, value_enum, default_value_t = Mode::Simulation)]
    mode: Mode,
    /// Directory results are written to; defaults to the input file's
    /// directory.
    #[arg(long, short)]
    output_directory: Option<PathBuf>,
    /// Number of PV units installed (simulation mode).
    #[arg(long, default_value_t = 0.)]
    pv: f64,
    /// Number of battery units installed (simulation mode).
    #[arg(long, default_value_t = 0.)]
    storage: f64,
    /// Number of PV-T collectors installed (simulation mode).
    #[arg(long, default_value_t = 0.)]
    pvt: f64,
    /// Number of solar-thermal collectors installed (simulation mode).
    #[arg(long, default_value_t = 0.)]
    solar_thermal: f64,
    /// Number of clean-water tanks installed (simulation mode).
    #[arg(long, default_value_t = 0.)]
    clean_water_tanks: f64,
    /// Number of hot-water tanks installed (simulation mode).
    #[arg(long, default_value_t = 0.)]
    hot_water_tanks: f64,
    /// Number of HTF buffer tanks installed (simulation mode).
    #[arg(long, default_value_t = 1.)]
    buffer_tanks: f64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum Mode {
    Simulation,
    Optimisation,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let args = MinigridArgs::parse();

    let input_file = args.input_file.as_str();
    let input_file_ext = Path::new(input_file).extension().and_then(OsStr::to_str);
    let input_file_stem = match input_file_ext {
        Some(ext) => &input_file[..(input_file.len() - ext.len() - 1)],
        None => input_file,
    };
    let output_directory = args.output_directory.clone().unwrap_or_else(|| {
        Path::new(input_file)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    });
    let file_stem = Path::new(input_file_stem)
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or("minigrid");
    let output = FileOutput::new(output_directory, format!("{file_stem}_{{}}"));

    let input = BufReader::new(File::open(input_file)?);
    let mode = match args.mode {
        Mode::Simulation => RunMode::Simulation(SystemSizes {
            pv: args.pv,
            storage: args.storage,
            pvt: args.pvt,
            solar_thermal: args.solar_thermal,
            clean_water_tanks: args.clean_water_tanks,
            hot_water_tanks: args.hot_water_tanks,
            buffer_tanks: args.buffer_tanks,
            converters: Default::default(),
        }),
        Mode::Optimisation => RunMode::Optimisation,
    };

    run_project(input, output, mode)
}
