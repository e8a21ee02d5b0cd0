// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Operator command vocabulary
//!
//! | Command                     | Effect                                          |
//! |-----------------------------|-------------------------------------------------|
//! | `start-check <json>`        | start routine `json.name`, enable plotting      |
//! | `stop-check <name>`         | stop a running routine                          |
//! | `pause-check <name>`        | pause a running routine                         |
//! | `resume-check <name>`       | resume a paused routine                         |
//! | `check-msg <args...>`       | post a message to every running routine         |
//! | `set <value> <tag...>`      | operator override of an engineering value       |
//! | `start-stream`              | enable the data stream                          |
//! | `stop-stream`               | disable the data stream                         |
//! | `stream-select <0..3>`      | scaled, raw, average or standard deviation      |
//! | `devices`                   | list of `{tag, type}`                           |
//! | `time`                      | Unix time in milliseconds                       |

use std::str::FromStr;
use std::sync::Arc;

use log::{debug, info};
use serde_json::Value;

use super::subscribers::{ControllerMessage, StreamMode, SubscriberId};
use super::{ControllerContext, ControllerError};

/// Log window forced on every device while a statistics stream is selected
pub const STATISTICS_WINDOW: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartCheck(Value),
    StopCheck(String),
    PauseCheck(String),
    ResumeCheck(String),
    CheckMsg(Vec<String>),
    Set { value: f64, tag: String },
    StartStream,
    StopStream,
    StreamSelect(StreamMode),
    Devices,
    Time,
}

fn invalid(reason: impl Into<String>) -> ControllerError {
    ControllerError::InvalidCommand(reason.into())
}

impl FromStr for Command {
    type Err = ControllerError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let name = || {
            if rest.is_empty() {
                Err(invalid(format!("{keyword} needs a routine name")))
            } else {
                Ok(rest.to_string())
            }
        };

        match keyword {
            "start-check" => {
                let params: Value = serde_json::from_str(rest)
                    .map_err(|e| invalid(format!("start-check needs a JSON object: {e}")))?;
                if !params.is_object() {
                    return Err(invalid("start-check needs a JSON object"));
                }
                Ok(Command::StartCheck(params))
            }
            "stop-check" => Ok(Command::StopCheck(name()?)),
            "pause-check" => Ok(Command::PauseCheck(name()?)),
            "resume-check" => Ok(Command::ResumeCheck(name()?)),
            "check-msg" => Ok(Command::CheckMsg(
                rest.split_whitespace().map(str::to_string).collect(),
            )),
            "set" => {
                let (value, tag) = rest
                    .split_once(' ')
                    .ok_or_else(|| invalid("set needs a value and a tag"))?;
                let value = value
                    .parse::<f64>()
                    .map_err(|e| invalid(format!("invalid value '{value}': {e}")))?;
                Ok(Command::Set {
                    value,
                    tag: tag.trim().to_string(),
                })
            }
            "start-stream" => Ok(Command::StartStream),
            "stop-stream" => Ok(Command::StopStream),
            "stream-select" => {
                let index = rest
                    .parse::<u8>()
                    .map_err(|e| invalid(format!("invalid stream index '{rest}': {e}")))?;
                let mode = StreamMode::try_from(index)
                    .map_err(|i| invalid(format!("unknown stream index {i}")))?;
                Ok(Command::StreamSelect(mode))
            }
            "devices" => Ok(Command::Devices),
            "time" => Ok(Command::Time),
            _ => Err(invalid("Unknown command")),
        }
    }
}

impl ControllerContext {
    /// Parse and execute one console line on behalf of `subscriber`
    ///
    /// Failures are reported to that subscriber as an error message.
    pub fn handle_command(self: &Arc<Self>, subscriber: SubscriberId, line: &str) {
        debug!("<< {}: '{}'", subscriber, line);
        let result = line
            .parse::<Command>()
            .and_then(|command| self.execute_command(subscriber, command));
        if let Err(err) = result {
            let message = match err {
                ControllerError::InvalidCommand(reason) => reason,
                other => format!("Error: {other}"),
            };
            self.subscribers()
                .send_to(subscriber, ControllerMessage::Error(message));
        }
    }

    pub fn execute_command(
        self: &Arc<Self>,
        subscriber: SubscriberId,
        command: Command,
    ) -> Result<(), ControllerError> {
        match command {
            Command::StartCheck(params) => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("start-check parameters need a name"))?
                    .to_string();
                self.subscribers().set_plot_enabled(subscriber, true);
                self.call_routine(&name, params)
            }
            Command::StopCheck(name) => self.stop_routine(&name),
            Command::PauseCheck(name) => self.pause_routine(&name),
            Command::ResumeCheck(name) => self.resume_routine(&name),
            Command::CheckMsg(args) => {
                let delivered = self.post_message(args);
                debug!("Message delivered to {} routine(s)", delivered);
                Ok(())
            }
            Command::Set { value, tag } => self.force_value(&tag, value),
            Command::StartStream => {
                self.subscribers().set_stream_enabled(subscriber, true);
                Ok(())
            }
            Command::StopStream => {
                self.subscribers().set_stream_enabled(subscriber, false);
                Ok(())
            }
            Command::StreamSelect(mode) => {
                if mode.uses_log() {
                    info!("Enabling {} s logging on every device", STATISTICS_WINDOW);
                    for device in self.devices() {
                        device.override_log_window(STATISTICS_WINDOW);
                    }
                } else {
                    for device in self.devices() {
                        device.restore_log_window();
                    }
                }
                self.subscribers().set_mode(subscriber, mode);
                Ok(())
            }
            Command::Devices => {
                let list = self.device_list();
                self.subscribers()
                    .send_to(subscriber, ControllerMessage::Devices(list));
                Ok(())
            }
            Command::Time => {
                self.subscribers()
                    .send_to(subscriber, ControllerMessage::Time(now_millis()));
                Ok(())
            }
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "set 1.5 Flow controller 1.SP".parse::<Command>().unwrap(),
            Command::Set {
                value: 1.5,
                tag: "Flow controller 1.SP".into()
            }
        );
        assert_eq!(
            "stream-select 3".parse::<Command>().unwrap(),
            Command::StreamSelect(StreamMode::Stddev)
        );
        assert_eq!(
            "check-msg continue now".parse::<Command>().unwrap(),
            Command::CheckMsg(vec!["continue".into(), "now".into()])
        );
        assert_eq!(
            "stop-check LEAK".parse::<Command>().unwrap(),
            Command::StopCheck("LEAK".into())
        );
        match r#"start-check {"name": "LEAK", "pressureSP": 2}"#.parse::<Command>() {
            Ok(Command::StartCheck(params)) => assert_eq!(params["name"], "LEAK"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rejects_malformed_commands() {
        for line in [
            "reload",
            "set",
            "set abc Valve 1",
            "stream-select 7",
            "stop-check",
            "start-check [1, 2]",
        ] {
            assert!(
                matches!(line.parse::<Command>(), Err(ControllerError::InvalidCommand(_))),
                "{line} should be rejected"
            );
        }
        match "bogus".parse::<Command>() {
            Err(ControllerError::InvalidCommand(reason)) => assert_eq!(reason, "Unknown command"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
