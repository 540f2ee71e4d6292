// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{error::Error, path::PathBuf, sync::Arc};

use clap::{crate_version, Parser, Subcommand};
use midiroute::{
    config::{self, Settings},
    engine::BlockClock,
    manager::DeviceManager,
    midi,
    persistence::{self, PersistError, DEVICES_FILE},
    routing::{InputRole, OutputRole},
};
use tracing::warn;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "Routes MIDI between devices and an audio engine."
)]
struct Cli {
    /// The path to a settings file. Settings can also be given as MIDIROUTE_* environment variables.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available MIDI input/output devices.
    Devices {},
    /// Selects devices for each role and saves the selection. An empty name unbinds the role.
    Select {
        /// The note input device.
        #[arg(long)]
        notes: Option<String>,
        /// The controller input device.
        #[arg(long)]
        cc: Option<String>,
        /// The pass-through output device.
        #[arg(long)]
        thru: Option<String>,
        /// The feedback output device.
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Prints the saved device selection.
    Show {},
    /// Restores the saved selection and routes MIDI until interrupted.
    Run {},
}

fn print_devices(kind: &str, devices: &[String]) {
    if devices.is_empty() {
        println!("No {} devices found.", kind);
        return;
    }

    println!("{} devices:", kind);
    for device in devices {
        println!("- {}", device);
    }
}

fn print_selection(manager: &DeviceManager) {
    for role in InputRole::ALL {
        println!("{:?} input: {}", role, manager.get_selected_in_device(role));
    }
    for role in OutputRole::ALL {
        println!("{:?} output: {}", role, manager.get_selected_out_device(role));
    }
}

/// Restores the saved selection. A missing devices file is not an error on first use.
fn restore(manager: &DeviceManager) -> Result<(), Box<dyn Error>> {
    match manager.read() {
        Ok(()) => Ok(()),
        Err(PersistError::Unreadable { path, reason }) => {
            warn!(path = %path.display(), reason, "No saved device selection.");
            Ok(())
        }
        Err(e @ PersistError::DeviceSetup(_)) => {
            warn!(err = %e, "Continuing without the saved device setup.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let settings: Settings = config::load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Devices {} => {
            let transport = midi::get_transport(settings.transport())?;
            print_devices("Input", &transport.input_names()?);
            print_devices("Output", &transport.output_names()?);
        }
        Commands::Select {
            notes,
            cc,
            thru,
            feedback,
        } => {
            let manager = DeviceManager::new(midi::get_transport(settings.transport())?, &settings);
            restore(&manager)?;

            for (role, device_name) in [(InputRole::Notes, notes), (InputRole::Cc, cc)] {
                match device_name.as_deref() {
                    None => {}
                    Some("") => manager.close_in_port(role),
                    Some(device_name) => {
                        manager.open_in_port(role, device_name);
                        if manager.get_selected_in_device(role).is_empty() {
                            return Err(format!("unable to open MIDI input {}", device_name).into());
                        }
                    }
                }
            }
            for (role, device_name) in [(OutputRole::Thru, thru), (OutputRole::Feedback, feedback)] {
                match device_name.as_deref() {
                    None => {}
                    Some("") => manager.close_out_port(role),
                    Some(device_name) => {
                        if !manager.open_out_port(role, device_name) {
                            return Err(format!("unable to open MIDI output {}", device_name).into());
                        }
                    }
                }
            }

            manager.save()?;
            print_selection(&manager);
        }
        Commands::Show {} => {
            let path = settings.settings_dir().join(DEVICES_FILE);
            let document = persistence::read_document(&path)?;
            println!("{} ({})", path.display(), document.tag());
            for role in InputRole::ALL {
                println!(
                    "{:?} input: {}",
                    role,
                    document.input_device(role).unwrap_or_default()
                );
            }
            for role in OutputRole::ALL {
                println!(
                    "{:?} output: {}",
                    role,
                    document.output_device(role).unwrap_or_default()
                );
            }
        }
        Commands::Run {} => {
            let manager = Arc::new(DeviceManager::new(
                midi::get_transport(settings.transport())?,
                &settings,
            ));
            restore(&manager)?;
            print_selection(&manager);

            let mut clock = BlockClock::start(manager.clone(), settings.block_size())?;
            tokio::signal::ctrl_c().await?;
            clock.stop();

            manager.save()?;
        }
    }

    Ok(())
}
