// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The fluxion command line: simulate stock-and-flow projects and dump
//! diagnostics.
//!
//! Exit codes: 0 success, 1 parse/type error, 2 simulation error,
//! 3 unit inconsistency.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use fluxion_engine::datamodel;
use fluxion_engine::{json, serde as project_serde, Project, Results, Simulation, Vm};

const EXIT_COMPILE_ERROR: u8 = 1;
const EXIT_SIM_ERROR: u8 = 2;
const EXIT_UNIT_ERROR: u8 = 3;

#[derive(Parser)]
#[command(name = "fluxion", version, about = "Simulate system dynamics models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MethodArg {
    Euler,
    Rk4,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Tsv,
    Csv,
}

#[derive(Subcommand)]
enum Command {
    /// Run a simulation and write the results time series
    Simulate {
        /// project file (binary interchange format, or JSON with --json-input)
        path: PathBuf,
        /// write results here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
        /// results format
        #[arg(long, value_enum, default_value = "tsv")]
        format: FormatArg,
        /// override the project's integration method
        #[arg(long, value_enum)]
        method: Option<MethodArg>,
        /// seed for the rand() builtin
        #[arg(long)]
        seed: Option<u64>,
        /// augment the project with loop-score instrumentation
        #[arg(long)]
        ltm: bool,
        /// input is the JSON mirror instead of protobuf
        #[arg(long)]
        json_input: bool,
    },
    /// Check a project and report diagnostics without simulating
    Check {
        /// project file (binary interchange format, or JSON with --json-input)
        path: PathBuf,
        /// emit diagnostics as JSON
        #[arg(long)]
        json: bool,
        /// input is the JSON mirror instead of protobuf
        #[arg(long)]
        json_input: bool,
    },
    /// Convert between the binary interchange format and its JSON mirror
    Convert {
        path: PathBuf,
        /// write converted project here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
        /// input is the JSON mirror instead of protobuf
        #[arg(long)]
        json_input: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            path,
            output,
            format,
            method,
            seed,
            ltm,
            json_input,
        } => simulate(path, output, format, method, seed, ltm, json_input),
        Command::Check {
            path,
            json,
            json_input,
        } => check(path, json, json_input),
        Command::Convert {
            path,
            output,
            json_input,
        } => convert(path, output, json_input),
    }
}

fn load_project(path: &PathBuf, json_input: bool) -> Result<datamodel::Project, ExitCode> {
    let mut contents: Vec<u8> = vec![];
    let mut file = File::open(path).map_err(|err| {
        eprintln!("error: unable to open {}: {}", path.display(), err);
        ExitCode::from(EXIT_COMPILE_ERROR)
    })?;
    file.read_to_end(&mut contents).map_err(|err| {
        eprintln!("error: unable to read {}: {}", path.display(), err);
        ExitCode::from(EXIT_COMPILE_ERROR)
    })?;

    let project = if json_input {
        let contents = String::from_utf8(contents).map_err(|err| {
            eprintln!("error: {} isn't utf-8: {}", path.display(), err);
            ExitCode::from(EXIT_COMPILE_ERROR)
        })?;
        json::from_json(&contents)
    } else {
        project_serde::deserialize(&contents)
    };

    project.map_err(|err| {
        eprintln!("error: unable to parse {}: {}", path.display(), err);
        ExitCode::from(EXIT_COMPILE_ERROR)
    })
}

/// Report a project's problems to stderr and decide its fate: equation
/// and structural errors dominate unit inconsistencies.
fn triage(project: &Project) -> Option<u8> {
    let mut has_compile_errors = !project.errors.is_empty();
    let mut has_unit_errors = false;

    for err in project.errors.iter() {
        eprintln!("error: {}", err);
    }

    let mut model_names: Vec<_> = project
        .models
        .iter()
        .filter(|(_, model)| !model.implicit)
        .map(|(name, _)| name.clone())
        .collect();
    model_names.sort();

    for model_name in model_names.iter() {
        let model = &project.models[model_name];
        for (ident, errors) in model.get_variable_errors() {
            has_compile_errors = true;
            for err in errors {
                eprintln!("error: {}.{}: {}", model_name, ident, err);
            }
        }
        for (ident, errors) in model.get_unit_errors() {
            has_unit_errors = true;
            for err in errors {
                eprintln!("warning: {}.{}: {}", model_name, ident, err);
            }
        }
    }

    if has_compile_errors {
        Some(EXIT_COMPILE_ERROR)
    } else if has_unit_errors {
        Some(EXIT_UNIT_ERROR)
    } else {
        None
    }
}

fn simulate(
    path: PathBuf,
    output: Option<PathBuf>,
    format: FormatArg,
    method: Option<MethodArg>,
    seed: Option<u64>,
    ltm: bool,
    json_input: bool,
) -> ExitCode {
    let mut project_datamodel = match load_project(&path, json_input) {
        Ok(project) => project,
        Err(code) => return code,
    };

    if let Some(method) = method {
        project_datamodel.sim_specs.sim_method = match method {
            MethodArg::Euler => datamodel::SimMethod::Euler,
            MethodArg::Rk4 => datamodel::SimMethod::RungeKutta4,
        };
    }

    let compile_start = Instant::now();
    let mut project = Project::from(project_datamodel);

    if let Some(code) = triage(&project) {
        // unit inconsistencies are advisory when simulating; anything
        // else stops us here
        if code != EXIT_UNIT_ERROR {
            return ExitCode::from(code);
        }
    }

    if ltm {
        project = match project.with_ltm() {
            Ok(project) => project,
            Err(err) => {
                eprintln!("error: {}", err);
                return ExitCode::from(EXIT_COMPILE_ERROR);
            }
        };
    }

    let sim = match Simulation::new(&project, "main") {
        Ok(sim) => sim,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(EXIT_SIM_ERROR);
        }
    };
    let compiled = match sim.compile() {
        Ok(compiled) => compiled,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(EXIT_SIM_ERROR);
        }
    };
    info!(elapsed = ?compile_start.elapsed(), "compiled {}", project.name());

    let sim_start = Instant::now();
    let mut vm = match Vm::new_with_seed(compiled, seed.unwrap_or(fluxion_engine::DEFAULT_SEED)) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(EXIT_SIM_ERROR);
        }
    };
    if let Err(err) = vm.run_to_end() {
        eprintln!("error: {}", err);
        return ExitCode::from(EXIT_SIM_ERROR);
    }
    let results = vm.into_results();
    info!(
        elapsed = ?sim_start.elapsed(),
        steps = results.step_count,
        variables = results.step_size,
        "simulated",
    );

    if let Err(err) = write_results(&results, output, format) {
        eprintln!("error: writing results: {}", err);
        return ExitCode::from(EXIT_SIM_ERROR);
    }

    ExitCode::SUCCESS
}

fn write_results(
    results: &Results,
    output: Option<PathBuf>,
    format: FormatArg,
) -> std::io::Result<()> {
    let mut writer: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(std::io::stdout().lock()),
    };

    match format {
        FormatArg::Tsv => results.write_tsv(&mut writer)?,
        FormatArg::Csv => {
            // write through the csv crate so quoting stays correct if
            // variable names ever contain commas
            let mut csv_writer = csv::Writer::from_writer(writer);
            let mut columns: Vec<(&str, usize)> = results
                .offsets
                .iter()
                .map(|(name, off)| (name.as_str(), *off))
                .collect();
            columns.sort_by_key(|(_, off)| *off);

            csv_writer.write_record(columns.iter().map(|(name, _)| *name))?;
            for row in results.iter() {
                csv_writer
                    .write_record(columns.iter().map(|(_, off)| row[*off].to_string()))?;
            }
            csv_writer.flush()?;
            return Ok(());
        }
    }
    writer.flush()
}

#[derive(serde::Serialize)]
struct Diagnostic {
    model: String,
    variable: String,
    kind: String,
    detail: String,
}

fn check(path: PathBuf, as_json: bool, json_input: bool) -> ExitCode {
    let project_datamodel = match load_project(&path, json_input) {
        Ok(project) => project,
        Err(code) => return code,
    };

    let project = Project::from(project_datamodel);

    if as_json {
        let mut diagnostics: Vec<Diagnostic> = vec![];
        for (model_name, model) in project.models.iter() {
            if model.implicit {
                continue;
            }
            for (ident, errors) in model.get_variable_errors() {
                for err in errors {
                    diagnostics.push(Diagnostic {
                        model: model_name.clone(),
                        variable: ident.clone(),
                        kind: "equation".to_string(),
                        detail: err.to_string(),
                    });
                }
            }
            for (ident, errors) in model.get_unit_errors() {
                for err in errors {
                    diagnostics.push(Diagnostic {
                        model: model_name.clone(),
                        variable: ident.clone(),
                        kind: "units".to_string(),
                        detail: err.to_string(),
                    });
                }
            }
        }
        diagnostics.sort_by(|a, b| (&a.model, &a.variable).cmp(&(&b.model, &b.variable)));
        println!("{}", serde_json::to_string_pretty(&diagnostics).unwrap());

        let has_equation_errors = diagnostics.iter().any(|d| d.kind == "equation");
        let has_unit_errors = diagnostics.iter().any(|d| d.kind == "units");
        return if has_equation_errors || !project.errors.is_empty() {
            ExitCode::from(EXIT_COMPILE_ERROR)
        } else if has_unit_errors {
            ExitCode::from(EXIT_UNIT_ERROR)
        } else {
            ExitCode::SUCCESS
        };
    }

    match triage(&project) {
        Some(code) => ExitCode::from(code),
        None => {
            debug!("{}: ok", project.name());
            println!("ok");
            ExitCode::SUCCESS
        }
    }
}

fn convert(path: PathBuf, output: Option<PathBuf>, json_input: bool) -> ExitCode {
    let project = match load_project(&path, json_input) {
        Ok(project) => project,
        Err(code) => return code,
    };

    let result: Result<Vec<u8>, fluxion_engine::Error> = if json_input {
        // JSON in, protobuf out
        Ok(project_serde::serialize(&project))
    } else {
        // protobuf in, JSON out
        json::to_json(&project).map(|s| s.into_bytes())
    };

    let bytes = match result {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(EXIT_COMPILE_ERROR);
        }
    };

    let write_result = match output {
        Some(path) => File::create(path).and_then(|mut f| f.write_all(&bytes)),
        None => std::io::stdout().lock().write_all(&bytes),
    };
    if let Err(err) = write_result {
        eprintln!("error: {}", err);
        return ExitCode::from(EXIT_COMPILE_ERROR);
    }

    ExitCode::SUCCESS
}
