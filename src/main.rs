//! seccomp-policy CLI - check, compile, inspect and enforce syscall policies

use std::fs;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, ExitCode};

use clap::{Parser, Subcommand};
use tracing::{error, info};

use seccomp_policy::{logging, metrics, Engine, EngineConfig, PolicyError, Result, TargetArch};

#[derive(Parser)]
#[command(name = "seccomp-policy")]
#[command(version, about = "Compile and install seccomp syscall policies", long_about = None)]
#[command(after_help = "EXAMPLES:
    seccomp-policy check device.policy
    seccomp-policy --arch aarch64 compile device.policy -o device.bpf
    seccomp-policy eval device.policy ioctl --arg 3 --arg 0x5401
    seccomp-policy run device.policy -- /usr/libexec/device --fd 3

    The policy given to `run` must allow execve, or the exec that follows
    installation is itself filtered.
")]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Target architecture (overrides the config file)
    #[arg(long, value_name = "ARCH", global = true)]
    arch: Option<TargetArch>,

    /// Policy root directory (overrides the config file)
    #[arg(short, long, value_name = "DIR", global = true)]
    root: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Print Prometheus metrics to stderr when done
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse, resolve and compile a policy, reporting any error
    Check {
        policy: String,
    },

    /// Write the raw BPF program
    Compile {
        policy: String,

        /// Output file (default: the policy name with a .bpf extension)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Print the resolved policy as JSON
    Dump {
        policy: String,
    },

    /// Run one syscall through the compiled filter
    Eval {
        policy: String,

        syscall: String,

        /// Argument values in order (decimal, 0x hex, or negative)
        #[arg(long = "arg", value_name = "N", value_parser = parse_arg)]
        args: Vec<u64>,
    },

    /// Install the filter, then exec a program under it
    Run {
        policy: String,

        /// Program and its arguments, after `--`
        #[arg(last = true, required = true, value_name = "PROGRAM")]
        command: Vec<String>,
    },
}

fn parse_arg(text: &str) -> std::result::Result<u64, String> {
    let parsed = if let Some(neg) = text.strip_prefix('-') {
        neg.parse::<u64>().ok().map(|v| v.wrapping_neg())
    } else if let Some(hex) = text.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse::<u64>().ok()
    };
    parsed.ok_or_else(|| format!("invalid argument value '{}'", text))
}

fn engine_for(cli: &Cli) -> Result<Engine> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(arch) = cli.arch {
        config.target_arch = Some(arch);
    }
    if let Some(root) = &cli.root {
        config.policy_root = root.clone();
    }
    Engine::new(config)
}

fn run(cli: &Cli) -> Result<()> {
    let engine = engine_for(cli)?;

    match &cli.command {
        Commands::Check { policy } => {
            let resolved = engine.resolve(policy)?;
            let filter = engine.compile(&resolved)?;
            println!(
                "{}: ok ({} files, {} syscalls, {} instructions, default {}, {})",
                policy,
                resolved.files.len(),
                filter.syscalls(),
                filter.len(),
                filter.default_action(),
                filter.arch()
            );
        }
        Commands::Compile { policy, output } => {
            let filter = engine.build(policy)?;
            let output = output
                .clone()
                .unwrap_or_else(|| PathBuf::from(policy).with_extension("bpf"));
            fs::write(&output, filter.to_bytes()).map_err(|e| PolicyError::io(&output, e))?;
            info!(output = %output.display(), instructions = filter.len(), "wrote filter");
            println!(
                "wrote {} ({} instructions, {})",
                output.display(),
                filter.len(),
                filter.arch()
            );
        }
        Commands::Dump { policy } => {
            let resolved = engine.resolve(policy)?;
            let json = serde_json::to_string_pretty(&resolved)
                .map_err(|e| PolicyError::Config(format!("failed to serialize policy: {}", e)))?;
            println!("{}", json);
        }
        Commands::Eval { policy, syscall, args } => {
            if args.len() > 6 {
                return Err(PolicyError::Config("at most 6 arguments".to_string()));
            }
            let mut values = [0u64; 6];
            values[..args.len()].copy_from_slice(args);

            let resolved = engine.resolve(policy)?;
            let filter = engine.compile(&resolved)?;
            let verdict = filter.evaluate_syscall(syscall, &values)?;
            let expected = resolved.decide(syscall, &values, engine.arch());
            if verdict != expected {
                return Err(PolicyError::Compile(format!(
                    "filter returned '{}' but the policy says '{}'",
                    verdict, expected
                )));
            }
            println!("{}: {}", syscall, verdict);
        }
        Commands::Run { policy, command } => {
            let filter = engine.build(policy)?;
            let report = engine.installer().install(filter)?;
            info!(
                program = %command[0],
                scope = %report.scope,
                "executing under seccomp filter"
            );
            let err = Command::new(&command[0]).args(&command[1..]).exec();
            return Err(PolicyError::io(&command[0], err));
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logging(cli.json_logs) {
        eprintln!("warning: failed to initialize logging: {}", e);
    }

    let result = run(&cli);

    if cli.metrics {
        match metrics::render() {
            Ok(text) => eprint!("{}", text),
            Err(e) => eprintln!("warning: {}", e),
        }
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_installation() => {
            error!(error = %e, "refusing to continue without a filter");
            eprintln!("fatal: {}", e);
            std::process::abort();
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
