mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{compose::ComposeOutput, EXIT_FAILURE, EXIT_MANIFEST_ERROR, EXIT_POLICY_ERROR};
use kiln_core::{CompileRequest, Compiler, DISTRO_DIR, MODES_DIR, TARGETS_DIR};
use kiln_policy::SearchConfig;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Layered manifest compiler and policy engine for OS image builds"
)]
struct Cli {
    /// Data directory holding the shipped include tree and policies.
    #[arg(long, default_value = "/usr/share/kiln", global = true)]
    base_dir: PathBuf,

    /// Extra include directory, searched before the shipped tree. Repeatable.
    #[arg(short = 'I', long = "include", global = true)]
    include: Vec<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compose a manifest into a validated build plan.
    Compose {
        /// Path to the manifest (*.aib.yml or *.mpp.yml).
        manifest: PathBuf,
        /// Distribution to build for.
        #[arg(long, default_value = "cs9")]
        distro: String,
        /// Board target to build for.
        #[arg(long, default_value = "qemu")]
        target: String,
        /// Build mode.
        #[arg(long, default_value = "image")]
        mode: String,
        /// CPU architecture of the image.
        #[arg(long, default_value = std::env::consts::ARCH)]
        arch: String,
        /// Policy to validate against: a name, a *.aibp.yml file, or a path.
        #[arg(long)]
        policy: Option<String>,
        /// Set a variable at highest precedence (key=value). Repeatable.
        #[arg(long = "define", value_name = "KEY=VALUE")]
        defines: Vec<String>,
        /// Append to a sequence variable (key=value). Repeatable.
        #[arg(long = "extend-define", value_name = "KEY=VALUE")]
        extend_defines: Vec<String>,
        /// Merge an extra variable document between manifest and defines.
        #[arg(long = "define-file", value_name = "FILE")]
        define_files: Vec<PathBuf>,
        /// Write the plan here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Print the resolved variables instead of the plan.
        #[arg(long, default_value_t = false)]
        dump_vars: bool,
    },
    /// List available distributions.
    ListDistros,
    /// List available board targets.
    ListTargets,
    /// List available build modes.
    ListModes,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let mut include_dirs = cli.include.clone();
    include_dirs.push(cli.base_dir.join("include"));
    let local_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let search = SearchConfig::new(
        local_dir,
        PathBuf::from("/etc/kiln/policies"),
        cli.base_dir.join("policies"),
    );
    let compiler = Compiler::new(include_dirs, search);
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Compose {
            manifest,
            distro,
            target,
            mode,
            arch,
            policy,
            defines,
            extend_defines,
            define_files,
            out,
            dump_vars,
        } => {
            let request = CompileRequest {
                manifest,
                distro,
                target,
                mode,
                arch,
                policy,
                defines,
                extend_defines,
                define_files,
            };
            commands::compose::run(
                &compiler,
                &request,
                &ComposeOutput {
                    out: out.as_deref(),
                    dump_vars,
                    json: json_output,
                },
            )
        }
        Commands::ListDistros => {
            commands::list::run(compiler.include_dirs(), DISTRO_DIR, "distro", json_output)
        }
        Commands::ListTargets => {
            commands::list::run(compiler.include_dirs(), TARGETS_DIR, "target", json_output)
        }
        Commands::ListModes => {
            commands::list::run(compiler.include_dirs(), MODES_DIR, "mode", json_output)
        }
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("policy error:") {
                EXIT_POLICY_ERROR
            } else if msg.starts_with("manifest error:") {
                EXIT_MANIFEST_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
