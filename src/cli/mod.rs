//! CLI command handling
//!
//! Runs the client-side commands and formats their output.

use crate::commands::Commands;
use crate::common::{Error, Result};
use crate::steps;
use crate::wire::WireClient;

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Serve { .. } => {
            // Should never happen - serve is handled in main
            unreachable!("Serve command should be handled in main")
        }

        Commands::Steps => {
            let registry = steps::builtin()?;
            for (id, pattern) in registry.steps() {
                println!("{} {}", id, pattern);
            }
            Ok(())
        }

        Commands::Match { text, address } => {
            let mut client = WireClient::connect(address.as_str())
                .await
                .map_err(|e| Error::Internal(format!("Cannot reach {}: {}", address, e)))?;

            match client.step_matches(&text).await? {
                Some(found) => {
                    println!("{}", found.id);
                    for (index, arg) in found.args.iter().enumerate() {
                        println!("  {}: {:?} at {}", index, arg.val, arg.pos);
                    }
                }
                None => println!("No step matches '{}'", text),
            }
            Ok(())
        }
    }
}
