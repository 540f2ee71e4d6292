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
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::{
    collector::DEFAULT_CAPACITY,
    routing::{RoutingSnapshot, TransportMode},
};

use super::ConfigError;

/// Environment variables starting with this prefix override settings, e.g.
/// MIDIROUTE_THRU=true.
pub const ENV_PREFIX: &str = "MIDIROUTE";

const DEFAULT_TRANSPORT: &str = "midir";
const DEFAULT_SAMPLE_RATE: u32 = 44100;
const DEFAULT_BLOCK_SIZE: usize = 512;
const SETTINGS_FOLDER: &str = "midiroute";

/// Process settings.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Settings {
    /// The MIDI transport: "midir", or a name starting with "mock" for in-memory devices.
    transport: Option<String>,

    /// Whether the router runs standalone or embedded in a plugin host (default: standalone).
    mode: Option<TransportMode>,

    /// Mirror note input to the pass-through output (default: false).
    thru: Option<bool>,

    /// Treat controller messages from the note device as controller input (default: false).
    use_note_device_for_cc: Option<bool>,

    /// Reserved. Stored but not used for routing (default: false).
    cc_input_thru: Option<bool>,

    /// Per-collector queue capacity (default: 1024).
    collector_capacity: Option<usize>,

    /// Block clock sample rate in Hz (default: 44100).
    sample_rate: Option<u32>,

    /// Block clock frames per block (default: 512).
    block_size: Option<usize>,

    /// Folder holding the devices file (default: the platform config folder).
    settings_dir: Option<PathBuf>,
}

impl Settings {
    pub fn transport(&self) -> &str {
        self.transport.as_deref().unwrap_or(DEFAULT_TRANSPORT)
    }

    pub fn mode(&self) -> TransportMode {
        self.mode.unwrap_or_default()
    }

    /// The initial routing flags.
    pub fn routing(&self) -> RoutingSnapshot {
        RoutingSnapshot {
            thru: self.thru.unwrap_or(false),
            use_note_device_for_cc: self.use_note_device_for_cc.unwrap_or(false),
            cc_input_thru: self.cc_input_thru.unwrap_or(false),
        }
    }

    pub fn collector_capacity(&self) -> usize {
        self.collector_capacity.unwrap_or(DEFAULT_CAPACITY).max(1)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    pub fn block_size(&self) -> usize {
        self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE).max(1)
    }

    pub fn settings_dir(&self) -> PathBuf {
        match &self.settings_dir {
            Some(settings_dir) => settings_dir.clone(),
            None => dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(SETTINGS_FOLDER),
        }
    }

    pub fn with_transport(mut self, transport: &str) -> Settings {
        self.transport = Some(transport.to_string());
        self
    }

    pub fn with_mode(mut self, mode: TransportMode) -> Settings {
        self.mode = Some(mode);
        self
    }

    pub fn with_settings_dir(mut self, settings_dir: &Path) -> Settings {
        self.settings_dir = Some(settings_dir.to_path_buf());
        self
    }
}

/// Loads settings from the optional file, then the environment.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        builder = builder.add_source(File::from(path));
    }

    Ok(builder
        .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
        .build()?
        .try_deserialize::<Settings>()?)
}

#[cfg(test)]
mod test {
    use std::{env, error::Error, fs, path::PathBuf};

    use config::{Config, File, FileFormat};
    use serial_test::serial;

    use crate::routing::{RoutingSnapshot, TransportMode};

    use super::{load_settings, ConfigError, Settings};

    fn from_yaml(yaml: &str) -> Settings {
        Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults() {
        let settings = from_yaml("{}");
        assert_eq!("midir", settings.transport());
        assert_eq!(TransportMode::Standalone, settings.mode());
        assert_eq!(RoutingSnapshot::default(), settings.routing());
        assert_eq!(1024, settings.collector_capacity());
        assert_eq!(44100, settings.sample_rate());
        assert_eq!(512, settings.block_size());
        assert!(settings.settings_dir().ends_with("midiroute"));
    }

    #[test]
    fn full() {
        let settings = from_yaml(
            r#"
            transport: mock-transport
            mode: plugin
            thru: true
            use_note_device_for_cc: true
            cc_input_thru: true
            collector_capacity: 16
            sample_rate: 48000
            block_size: 128
            settings_dir: /tmp/midiroute-test
        "#,
        );
        assert_eq!("mock-transport", settings.transport());
        assert_eq!(TransportMode::Plugin, settings.mode());
        assert_eq!(
            RoutingSnapshot {
                thru: true,
                use_note_device_for_cc: true,
                cc_input_thru: true,
            },
            settings.routing()
        );
        assert_eq!(16, settings.collector_capacity());
        assert_eq!(48000, settings.sample_rate());
        assert_eq!(128, settings.block_size());
        assert_eq!(PathBuf::from("/tmp/midiroute-test"), settings.settings_dir());
    }

    #[test]
    fn zero_sizes_are_raised() {
        let settings = from_yaml("collector_capacity: 0\nblock_size: 0\n");
        assert_eq!(1, settings.collector_capacity());
        assert_eq!(1, settings.block_size());
    }

    #[test]
    #[serial]
    fn file_then_environment() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("midiroute.yaml");
        fs::write(&path, "transport: mock\nthru: false\nblock_size: 64\n")?;

        env::set_var("MIDIROUTE_THRU", "true");
        let settings = load_settings(Some(&path));
        env::remove_var("MIDIROUTE_THRU");

        let settings = settings?;
        assert_eq!("mock", settings.transport());
        assert!(settings.routing().thru);
        assert_eq!(64, settings.block_size());
        Ok(())
    }

    #[test]
    #[serial]
    fn missing_file() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        assert!(matches!(
            load_settings(Some(&dir.path().join("nope.yaml"))),
            Err(ConfigError::Missing(_))
        ));
        Ok(())
    }
}
