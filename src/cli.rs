use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "companion service supervisor")]
pub struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<String>,

    /// Sub‑commands (run, check, etc.)
    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Check the environment, start the companion and supervise it (default)
    Run,
    /// Run the environment check only and print the status record as JSON
    /// (Exit 0 = ready, 1 = error)
    Check,
    /// Download and install an available artifact update.
    /// Use the status channel's /updates/apply while a supervisor is running.
    Update {
        /// Reinstall the latest artifact even if it is already installed
        #[arg(long)]
        force: bool,
    },
    /// Print the installed and available artifact versions
    Version,
}
