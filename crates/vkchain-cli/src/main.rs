mod inspect;
mod verify;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "vkchain")]
#[command(about = "vkchain - inspect how the loader builds its layer and driver chain")]
#[command(version)]
struct Cli {
    /// Read this settings file instead of the platform locations
    #[arg(long, global = true)]
    settings_file: Option<PathBuf>,

    /// Resolve as if this executable were running (matched against app_keys)
    #[arg(long, global = true)]
    exe: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved loader settings
    Settings,

    /// Show the manifest search paths
    Paths,

    /// Show discovered layers and the chain an application would get
    Layers {
        /// Layer the application enables (repeatable, in order)
        #[arg(short, long)]
        layer: Vec<String>,

        /// List every discovered layer, not only the resolved chain
        #[arg(short, long)]
        all: bool,
    },

    /// Show discovered drivers and which of them the filters keep
    Drivers,

    /// Create an instance and list its physical devices
    Devices {
        /// Layer to enable on the instance (repeatable, in order)
        #[arg(short, long)]
        layer: Vec<String>,
    },

    /// Check settings, manifests and libraries for problems
    Verify {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    vkchain_common::init_logging();

    let cli = Cli::parse();
    let scope = inspect::Scope::new(cli.settings_file, cli.exe);

    match cli.command {
        Commands::Settings => {
            let settings = scope.settings()?;
            inspect::print_settings(&settings);
        }

        Commands::Paths => {
            let settings = scope.settings()?;
            inspect::print_search_paths(&settings);
        }

        Commands::Layers { layer, all } => {
            info!("resolving layers for {} requested", layer.len());
            inspect::print_layers(&scope, &layer, all)?;
        }

        Commands::Drivers => {
            inspect::print_drivers(&scope)?;
        }

        Commands::Devices { layer } => {
            inspect::print_devices(&scope, layer)?;
        }

        Commands::Verify { json } => {
            let failed = verify::run_verify(&scope, json);
            if failed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
