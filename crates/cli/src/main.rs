use anyhow::Result;
use clap::{Parser, Subcommand};
use hotswap::commands::{
    demo_command, disasm_command, inspect_command, run_command, translate_command, RunOptions,
};
use hotswap_core::translate::VersionPolicy;

/// Live function-body hot swapping for the bytecode host runtime.
///
/// This CLI is a thin wrapper around `hotswap-core` (exposed in code as `hotswap_core`).
/// All substantive logic lives in the library so it can be tested thoroughly
/// and reused from other hosts.
#[derive(Parser, Debug)]
#[command(name = "hotswap", version, about = "Live function-body hot swapping", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the types and members of a module file, flagging reloadable members.
    Inspect {
        /// Path to the module file.
        #[arg(long)]
        module: String,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print the descriptive instruction listing of one member.
    Disasm {
        /// Path to the module file.
        #[arg(long)]
        module: String,

        /// Member identity, e.g. `TestMod.ModDialog.Show()`.
        #[arg(long)]
        member: String,
    },

    /// Translate one member into the host's executable form without installing it.
    ///
    /// The target module is loaded inert; `--live` modules are loaded live first so
    /// references into them resolve.
    Translate {
        /// Path to the module file holding the member.
        #[arg(long)]
        module: String,

        /// Member identity, e.g. `TestMod.ModDialog.Show()`.
        #[arg(long)]
        member: String,

        /// Modules to load live before translating (repeatable).
        #[arg(long)]
        live: Vec<String>,

        /// Symbol resolution policy: `lax` or `strict`.
        #[arg(long, default_value = "lax")]
        policy: VersionPolicy,
    },

    /// Sample host loop: load a module, watch for changes and call an entry point repeatedly.
    Run {
        /// Path to the module file to load.
        #[arg(long)]
        module: String,

        /// Static, parameterless entry point, e.g. `TestMod.ModDialog.Show()`.
        #[arg(long)]
        entry: String,

        /// Directories to watch for new module revisions (repeatable).
        #[arg(long)]
        watch: Vec<String>,

        /// Reloader configuration file (JSON or YAML).
        #[arg(long)]
        config: Option<String>,

        /// Delay between calls.
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,

        /// Number of calls to make; 0 runs until interrupted.
        #[arg(long, default_value_t = 0)]
        iterations: u64,
    },

    /// Write a sample reloadable module (`TestMod.ModDialog.Show()` printing a message).
    Demo {
        /// Output path of the module file.
        #[arg(long)]
        out: String,

        /// Message the sample member prints.
        #[arg(long, default_value = "v1")]
        message: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { module, json } => inspect_command(&module, json)?,
        Command::Disasm { module, member } => disasm_command(&module, &member)?,
        Command::Translate { module, member, live, policy } => {
            translate_command(&module, &member, &live, policy)?
        }
        Command::Run { module, entry, watch, config, interval_ms, iterations } => {
            run_command(&RunOptions { module, entry, watch, config, interval_ms, iterations })?
        }
        Command::Demo { out, message } => demo_command(&out, &message)?,
    }

    Ok(())
}
