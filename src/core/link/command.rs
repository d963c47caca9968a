// src/core/link/command.rs

//! The closed set of commands a streaming box understands.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Remote-control keys, carrying their Android key codes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKey {
    Home,
    Back,
    Up,
    Down,
    Left,
    Right,
    Select,
    VolumeUp,
    VolumeDown,
    Mute,
    Power,
    Menu,
    PlayPause,
    Rewind,
    FastForward,
    Sleep,
    Wakeup,
}

impl RemoteKey {
    pub fn code(self) -> u16 {
        match self {
            RemoteKey::Home => 3,
            RemoteKey::Back => 4,
            RemoteKey::Up => 19,
            RemoteKey::Down => 20,
            RemoteKey::Left => 21,
            RemoteKey::Right => 22,
            RemoteKey::Select => 23,
            RemoteKey::VolumeUp => 24,
            RemoteKey::VolumeDown => 25,
            RemoteKey::Power => 26,
            RemoteKey::Menu => 82,
            RemoteKey::PlayPause => 85,
            RemoteKey::Rewind => 89,
            RemoteKey::FastForward => 90,
            RemoteKey::Mute => 164,
            RemoteKey::Sleep => 223,
            RemoteKey::Wakeup => 224,
        }
    }
}

/// A single command addressed to a device.
///
/// Callers resolve what they want to do into one of these variants up front, so
/// the manager never inspects a command beyond handing it to a link.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceCommand {
    /// Presses a remote-control key.
    Key { key: RemoteKey },
    /// Launches an application by package name.
    LaunchApp { package: String },
    /// Force-stops an application by package name.
    StopApp { package: String },
    /// Types text into the focused input field.
    InputText { text: String },
    /// Runs a raw shell command on the device.
    Shell { command: String },
    /// A no-op used to check that the device answers.
    Ping,
}

impl DeviceCommand {
    pub fn key(key: RemoteKey) -> Self {
        DeviceCommand::Key { key }
    }

    pub fn launch_app(package: impl Into<String>) -> Self {
        DeviceCommand::LaunchApp {
            package: package.into(),
        }
    }

    pub fn shell(command: impl Into<String>) -> Self {
        DeviceCommand::Shell {
            command: command.into(),
        }
    }

    /// A short, stable name used in logs and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::Key { .. } => "key",
            DeviceCommand::LaunchApp { .. } => "launch_app",
            DeviceCommand::StopApp { .. } => "stop_app",
            DeviceCommand::InputText { .. } => "input_text",
            DeviceCommand::Shell { .. } => "shell",
            DeviceCommand::Ping => "ping",
        }
    }

    /// Renders the command as one line of the text control protocol.
    ///
    /// Embedded line breaks are replaced by spaces so a single command can never
    /// be read as two.
    pub fn to_wire(&self) -> String {
        let line = match self {
            DeviceCommand::Key { key } => format!("KEY {}", key.code()),
            DeviceCommand::LaunchApp { package } => format!("LAUNCH {package}"),
            DeviceCommand::StopApp { package } => format!("STOP {package}"),
            DeviceCommand::InputText { text } => format!("TEXT {text}"),
            DeviceCommand::Shell { command } => format!("SHELL {command}"),
            DeviceCommand::Ping => "PING".to_string(),
        };
        line.replace(['\r', '\n'], " ")
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// The device's answer to a command.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandReply {
    pub output: String,
}

impl CommandReply {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}
