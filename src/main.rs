//! Kestrel command-line driver.
//!
//! Usage:
//! - `kestrel run <file> [--config cfg.json] [--stack-size N] [--fixed-stack] [--disassemble]`
//! - `kestrel compile <file> -o <out.kbc>`
//! - `kestrel exec <file.kbc> [--config cfg.json]`

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use kestrel::bytecode::{disassemble, FunctionPrototype};
use kestrel::{compile_source, serialize, Engine, Value, Vm, VmConfig};

#[derive(Parser, Debug)]
#[command(name = "kestrel", version)]
#[command(about = "Compile and run Kestrel scripts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile and run a source file
    Run {
        file: PathBuf,

        /// JSON VM configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Initial stack capacity in values
        #[arg(long = "stack-size")]
        stack_size: Option<usize>,

        /// Fail instead of growing the stack
        #[arg(long = "fixed-stack")]
        fixed_stack: bool,

        /// Print the bytecode before running
        #[arg(long)]
        disassemble: bool,
    },
    /// Compile a source file to a bytecode image
    Compile {
        file: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },
    /// Run a bytecode image
    Exec {
        file: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,kestrel=info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn load_config(path: Option<&Path>, file: &Path) -> Result<VmConfig> {
    let mut config = match path {
        Some(path) => VmConfig::load(path).with_context(|| format!("reading config {}", path.display()))?,
        None => VmConfig::default(),
    };
    if let Some(stem) = file.file_stem() {
        config.source_name = stem.to_string_lossy().into_owned();
    }
    Ok(config)
}

fn compile_file(file: &Path, config: &VmConfig) -> Result<FunctionPrototype> {
    let src = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let proto = compile_source(&src, &config.compile_options())?;
    info!(file = %file.display(), bytes = proto.chunk.code.len(), "compiled");
    Ok(proto)
}

fn execute(proto: &FunctionPrototype, config: VmConfig) -> Result<()> {
    let mut vm = Vm::new(Engine::new(), config);
    let value = vm.run(proto)?;
    if !matches!(value, Value::Null) {
        println!("{value}");
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            file,
            config,
            stack_size,
            fixed_stack,
            disassemble: show_bytecode,
        } => {
            let mut config = load_config(config.as_deref(), &file)?;
            if let Some(size) = stack_size {
                config.stack_size = size;
            }
            config.fixed_stack |= fixed_stack;
            let proto = compile_file(&file, &config)?;
            if show_bytecode {
                print!("{}", disassemble(&proto));
            }
            execute(&proto, config)
        }
        Command::Compile { file, output } => {
            let config = load_config(None, &file)?;
            let proto = compile_file(&file, &config)?;
            let bytes = serialize::to_bytes(&proto).map_err(kestrel::KestrelError::Serialize)?;
            fs::write(&output, &bytes).with_context(|| format!("writing {}", output.display()))?;
            info!(output = %output.display(), bytes = bytes.len(), "wrote bytecode image");
            Ok(())
        }
        Command::Exec { file, config } => {
            let config = load_config(config.as_deref(), &file)?;
            let bytes = fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let proto = serialize::from_bytes(&bytes).map_err(kestrel::KestrelError::Serialize)?;
            info!(file = %file.display(), module = %proto.source_name, "loaded bytecode image");
            execute(&proto, config)
        }
    }
}
