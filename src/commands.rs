//! CLI command definitions
//!
//! Defines the clap commands for the step server binary.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the step server until interrupted
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(long)]
        bind_address: Option<String>,

        /// Port to listen on (overrides the config file)
        #[arg(long, short = 'p')]
        bind_port: Option<u16>,

        /// Configuration file (default: platform config dir)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Also append logs to the default log file
        #[arg(long)]
        log: bool,

        /// Also append logs to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// List every registered step pattern
    Steps,

    /// Ask a running server which step matches a text
    Match {
        /// Step text, without the Given/When/Then keyword
        text: String,

        /// Server address
        #[arg(long, default_value = "127.0.0.1:31221")]
        address: String,
    },
}
