use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use cxvm::config::ConfigError;
use cxvm::error::exit_code;
use cxvm::{LoadError, NativeRegistry, Program, RuntimeConfig, RuntimeError, SerializeError};

#[derive(Parser)]
#[command(name = "cxvm")]
#[command(about = "Run, snapshot and inspect linked CX programs", long_about = None)]
struct Cli {
    /// Log loader, collector and serializer activity to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RuntimeArgs {
    /// TOML file with runtime settings; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stack region size in bytes
    #[arg(long)]
    stack_size: Option<u32>,

    /// Initial heap size in bytes
    #[arg(long)]
    heap_size: Option<u32>,

    /// Upper limit on heap growth in bytes
    #[arg(long)]
    max_heap_size: Option<u32>,

    /// Report only the failing instruction, not the whole call stack
    #[arg(long)]
    no_call_stack: bool,

    /// Print collector statistics when the program stops
    #[arg(long)]
    gc_stats: bool,
}

impl RuntimeArgs {
    fn config(&self) -> Result<RuntimeConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(size) = self.stack_size {
            config.stack_size = size;
        }
        if let Some(size) = self.heap_size {
            config.initial_heap_size = size;
        }
        if let Some(size) = self.max_heap_size {
            config.max_heap_size = size;
        }
        if self.no_call_stack {
            config.print_call_stack = false;
        }
        if self.gc_stats {
            config.gc_stats = true;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program from its JSON assembly or a serialized snapshot
    Run {
        /// Program file (.json assembly or snapshot blob)
        file: PathBuf,

        #[command(flatten)]
        runtime: RuntimeArgs,

        /// Stop after this many instructions
        #[arg(long)]
        steps: Option<u64>,

        /// Write a snapshot of the program here when it stops
        #[arg(long, value_name = "FILE")]
        snapshot: Option<PathBuf>,
    },
    /// Link a JSON assembly and write it as a snapshot blob, without running it
    Build {
        file: PathBuf,

        /// Output path (defaults to the input with a .cxb extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Describe a program's packages, functions and memory layout
    Inspect {
        file: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            CliError::Io { .. } | CliError::Config(_) | CliError::Json(_) => exit_code::IO_ERROR,
            CliError::Load(error) => error.exit_code(),
            CliError::Serialize(error) => error.exit_code(),
            CliError::Runtime(error) => error.exit_code(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            file,
            runtime,
            steps,
            snapshot,
        } => run(&file, &runtime, steps, snapshot.as_deref()),
        Commands::Build {
            file,
            output,
            runtime,
        } => build(&file, output, &runtime),
        Commands::Inspect { file, json } => inspect(&file, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read(path: &Path) -> Result<Vec<u8>, CliError> {
    fs::read(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, bytes: &[u8]) -> Result<(), CliError> {
    fs::write(path, bytes).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load either kind of program file, telling them apart by the blob magic.
fn open(path: &Path, config: RuntimeConfig) -> Result<Program, CliError> {
    let bytes = read(path)?;
    let natives = NativeRegistry::with_builtins();
    if cxvm::is_blob(&bytes) {
        debug!(path = %path.display(), "loading snapshot");
        return Ok(cxvm::deserialize(&bytes, natives, config)?);
    }
    let source = String::from_utf8(bytes)
        .map_err(|e| LoadError::invalid(path.display(), format!("not UTF-8: {}", e)))?;
    Ok(cxvm::load(&source, natives, config)?)
}

fn run(
    path: &Path,
    runtime: &RuntimeArgs,
    steps: Option<u64>,
    snapshot: Option<&Path>,
) -> Result<(), CliError> {
    let config = runtime.config()?;
    let gc_stats = config.gc_stats;
    let mut program = open(path, config)?;

    let outcome = match steps {
        Some(steps) => program.run_steps(steps).map(|terminated| {
            if !terminated {
                info!(steps, "stopped before termination");
            }
        }),
        None => program.run(),
    };
    if gc_stats {
        eprintln!("{}", program.gc_stats());
    }
    outcome?;

    if let Some(out) = snapshot {
        let blob = cxvm::serialize(&mut program)?;
        write(out, &blob)?;
    }
    Ok(())
}

fn build(path: &Path, output: Option<PathBuf>, runtime: &RuntimeArgs) -> Result<(), CliError> {
    let config = runtime.config()?;
    let mut program = open(path, config)?;
    let blob = cxvm::serialize(&mut program)?;
    let output = output.unwrap_or_else(|| path.with_extension("cxb"));
    write(&output, &blob)?;
    println!("wrote {} ({} bytes)", output.display(), blob.len());
    Ok(())
}

fn inspect(path: &Path, as_json: bool) -> Result<(), CliError> {
    let program = open(path, RuntimeConfig::default())?;
    let model = program.model();
    let machine = program.machine();

    let packages: Vec<_> = model
        .packages
        .iter()
        .map(|(_, package)| {
            json!({
                "name": package.name,
                "imports": package.imports.iter().map(|id| &model.package(*id).name).collect::<Vec<_>>(),
                "records": package.record_types.iter().map(|id| {
                    let record = model.record_type(*id);
                    json!({
                        "name": record.name,
                        "size": record.size,
                        "fields": record.fields.iter().map(|f| json!({
                            "name": f.name,
                            "type": f.declared_type().to_string(),
                            "offset": f.offset,
                        })).collect::<Vec<_>>(),
                    })
                }).collect::<Vec<_>>(),
                "globals": package.globals.iter().map(|g| json!({
                    "name": g.name,
                    "type": g.declared_type().to_string(),
                    "address": g.offset,
                })).collect::<Vec<_>>(),
                "functions": package.functions.iter().map(|id| {
                    let function = model.function(*id);
                    json!({
                        "name": function.name,
                        "frame_size": function.size,
                        "inputs": function.inputs.len(),
                        "outputs": function.outputs.len(),
                        "instructions": function.expressions.len(),
                    })
                }).collect::<Vec<_>>(),
            })
        })
        .collect();
    let calls: Vec<_> = machine
        .calls
        .iter()
        .map(|call| {
            json!({
                "function": model.function_key(call.operator),
                "line": call.line,
                "frame_pointer": call.frame_pointer,
            })
        })
        .collect();
    let summary = json!({
        "entry": model.entry.map(|id| model.function_key(id)),
        "stack_size": machine.stack_size,
        "data_size": machine.data_size,
        "heap_starts_at": machine.heap_starts_at,
        "heap_pointer": machine.heap_pointer,
        "heap_size": machine.heap_size,
        "stack_pointer": machine.stack_pointer,
        "terminated": machine.terminated,
        "calls": calls,
        "gc": machine.gc_stats,
        "packages": packages,
    });

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "entry: {}",
        model
            .entry
            .map(|id| model.function_key(id))
            .unwrap_or_else(|| "-".to_string())
    );
    println!(
        "memory: stack {} B, data {} B, heap {}/{} B at {:#x}",
        machine.stack_size,
        machine.data_size,
        machine.heap_pointer,
        machine.heap_size,
        machine.heap_starts_at
    );
    println!(
        "state: {}, {} active calls",
        if machine.terminated { "terminated" } else { "runnable" },
        machine.calls.len()
    );
    for (_, package) in model.packages.iter() {
        println!("package {}", package.name);
        for id in &package.record_types {
            let record = model.record_type(*id);
            println!("  record {} ({} B)", record.name, record.size);
            for field in &record.fields {
                println!("    {} {} @{}", field.name, field.declared_type(), field.offset);
            }
        }
        for global in &package.globals {
            println!("  global {} {} @{:#x}", global.name, global.declared_type(), global.offset);
        }
        for id in &package.functions {
            let function = model.function(*id);
            println!(
                "  func {} (frame {} B, {} instructions)",
                function.name,
                function.size,
                function.expressions.len()
            );
        }
    }
    Ok(())
}
