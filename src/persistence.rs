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
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    midi::DeviceSetup,
    routing::{InputRole, OutputRole},
};

/// The tag every devices document carries. Documents with any other tag are rejected.
pub const VERSION_TAG: &str = "DEVICES-1.0";

/// The name of the devices file inside the settings folder.
pub const DEVICES_FILE: &str = "devices.yaml";

/// Errors from saving or restoring the device selection. The display text is the
/// message reported to the user.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("document invalid")]
    Invalid,
    #[error("wrong version: found {found:?}, expected {:?}", VERSION_TAG)]
    WrongVersion { found: String },
    #[error("unable to read {}: {reason}", .path.display())]
    Unreadable { path: PathBuf, reason: String },
    #[error("the MIDI transport has no device setup to save")]
    NoDeviceSetup,
    #[error("the MIDI transport refused the stored device setup: {0}")]
    DeviceSetup(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to serialize devices document: {0}")]
    Serialize(#[from] serde_yml::Error),
}

/// The persisted device selection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicesDocument {
    #[serde(default)]
    tag: String,
    #[serde(rename = "DEVICESETUP", default, skip_serializing_if = "Option::is_none")]
    device_setup: Option<DeviceSetup>,
    #[serde(rename = "noteInputDeviceName", default)]
    note_input_device_name: Option<String>,
    #[serde(rename = "ccInputDeviceName", default)]
    cc_input_device_name: Option<String>,
    #[serde(rename = "thruOutputDeviceName", default)]
    thru_output_device_name: Option<String>,
    #[serde(rename = "feedbackOutputDeviceName", default)]
    feedback_output_device_name: Option<String>,
}

impl DevicesDocument {
    /// Creates an empty document with the current version tag.
    pub fn new() -> DevicesDocument {
        DevicesDocument::with_tag(VERSION_TAG)
    }

    /// Creates an empty document with an arbitrary tag.
    pub fn with_tag(tag: &str) -> DevicesDocument {
        DevicesDocument {
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    /// Sets the tag to the current version.
    pub fn stamp(&mut self) {
        self.tag = VERSION_TAG.to_string();
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn device_setup(&self) -> Option<&DeviceSetup> {
        self.device_setup.as_ref()
    }

    pub fn set_device_setup(&mut self, setup: DeviceSetup) {
        self.device_setup = Some(setup);
    }

    /// The stored device name for an input role. None when the attribute is missing.
    pub fn input_device(&self, role: InputRole) -> Option<&str> {
        match role {
            InputRole::Notes => self.note_input_device_name.as_deref(),
            InputRole::Cc => self.cc_input_device_name.as_deref(),
        }
    }

    pub fn set_input_device(&mut self, role: InputRole, device_name: &str) {
        let slot = match role {
            InputRole::Notes => &mut self.note_input_device_name,
            InputRole::Cc => &mut self.cc_input_device_name,
        };
        *slot = Some(device_name.to_string());
    }

    /// The stored device name for an output role. None when the attribute is missing.
    pub fn output_device(&self, role: OutputRole) -> Option<&str> {
        match role {
            OutputRole::Thru => self.thru_output_device_name.as_deref(),
            OutputRole::Feedback => self.feedback_output_device_name.as_deref(),
        }
    }

    pub fn set_output_device(&mut self, role: OutputRole, device_name: &str) {
        let slot = match role {
            OutputRole::Thru => &mut self.thru_output_device_name,
            OutputRole::Feedback => &mut self.feedback_output_device_name,
        };
        *slot = Some(device_name.to_string());
    }
}

/// Writes the document to the given path, creating the parent folder if needed.
pub fn write_document(path: &Path, document: &DevicesDocument) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let serialized = serde_yml::to_string(document)?;
    debug!(path = %path.display(), "Writing devices document.");
    let mut file = fs::File::create(path)?;
    file.write_all(serialized.as_bytes())?;
    Ok(())
}

/// Reads a document from the given path. A missing or unparseable file is reported
/// as unreadable, the version tag is not checked here.
pub fn read_document(path: &Path) -> Result<DevicesDocument, PersistError> {
    let unreadable = |reason: String| PersistError::Unreadable {
        path: path.to_path_buf(),
        reason,
    };

    let contents = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
    serde_yml::from_str::<DevicesDocument>(&contents).map_err(|e| unreadable(e.to_string()))
}

#[cfg(test)]
mod test {
    use std::{error::Error, fs};

    use crate::{
        midi::DeviceSetup,
        routing::{InputRole, OutputRole},
    };

    use super::{read_document, write_document, DevicesDocument, PersistError, VERSION_TAG};

    #[test]
    fn attribute_names() -> Result<(), Box<dyn Error>> {
        let mut document = DevicesDocument::new();
        document.set_input_device(InputRole::Notes, "keys");
        document.set_input_device(InputRole::Cc, "faders");
        document.set_output_device(OutputRole::Thru, "synth");
        document.set_output_device(OutputRole::Feedback, "");
        let mut setup = DeviceSetup::default();
        setup.set("audioOutputDeviceName", "interface");
        document.set_device_setup(setup);

        let serialized = serde_yml::to_string(&document)?;
        for expected in [
            "tag: DEVICES-1.0",
            "DEVICESETUP:",
            "audioOutputDeviceName: interface",
            "noteInputDeviceName: keys",
            "ccInputDeviceName: faders",
            "thruOutputDeviceName: synth",
            "feedbackOutputDeviceName:",
        ] {
            assert!(
                serialized.contains(expected),
                "{} missing from {}",
                expected,
                serialized
            );
        }
        Ok(())
    }

    #[test]
    fn missing_attributes() -> Result<(), Box<dyn Error>> {
        let document: DevicesDocument = serde_yml::from_str("tag: DEVICES-1.0\nccInputDeviceName: faders\n")?;
        assert_eq!(VERSION_TAG, document.tag());
        assert_eq!(None, document.input_device(InputRole::Notes));
        assert_eq!(Some("faders"), document.input_device(InputRole::Cc));
        assert_eq!(None, document.output_device(OutputRole::Thru));
        assert_eq!(None, document.device_setup());
        Ok(())
    }

    #[test]
    fn write_then_read() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("devices.yaml");

        let mut document = DevicesDocument::new();
        document.set_input_device(InputRole::Notes, "keys");
        write_document(&path, &document)?;

        assert_eq!(document, read_document(&path)?);
        Ok(())
    }

    #[test]
    fn unreadable_files() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            read_document(&missing),
            Err(PersistError::Unreadable { .. })
        ));

        let garbage = dir.path().join("garbage.yaml");
        fs::write(&garbage, "tag: [unterminated\n")?;
        assert!(matches!(
            read_document(&garbage),
            Err(PersistError::Unreadable { .. })
        ));
        Ok(())
    }

    #[test]
    fn error_messages() {
        assert_eq!("document invalid", PersistError::Invalid.to_string());
        assert!(PersistError::WrongVersion {
            found: "DEVICES-0.9".to_string()
        }
        .to_string()
        .starts_with("wrong version"));
    }
}
