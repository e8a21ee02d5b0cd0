// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Messages fanned out to operator consoles and the bookkeeping of who
//! receives what

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::devices::StatusValue;

/// Snapshot flavour a subscriber streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Engineering values with the health sentinel
    #[default]
    Scaled = 0,
    Raw = 1,
    /// Rolling-log average
    Average = 2,
    /// Rolling-log population standard deviation
    Stddev = 3,
}

impl StreamMode {
    pub const ALL: [StreamMode; 4] = [
        StreamMode::Scaled,
        StreamMode::Raw,
        StreamMode::Average,
        StreamMode::Stddev,
    ];

    /// Modes computed from the rolling log
    pub fn uses_log(self) -> bool {
        matches!(self, StreamMode::Average | StreamMode::Stddev)
    }
}

impl TryFrom<u8> for StreamMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        StreamMode::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(value)
    }
}

/// Colour hint attached to status messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colour {
    Green,
    Amber,
    Red,
}

/// Outcome carried by a results message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Passed,
    Failed,
    Error,
    Stopped,
}

/// Discrete interlock events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    EstopOn,
    EstopOff,
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlEvent::EstopOn => f.write_str("estop on"),
            ControlEvent::EstopOff => f.write_str("estop off"),
        }
    }
}

/// Pause notifications of a running routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineState {
    Paused,
    Resumed,
}

impl fmt::Display for RoutineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutineState::Paused => f.write_str("paused"),
            RoutineState::Resumed => f.write_str("resumed"),
        }
    }
}

/// Entry of the device list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Everything the controller sends to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerMessage {
    Data(BTreeMap<String, StatusValue>),
    Plot(Map<String, Value>),
    Control(ControlEvent),
    State(RoutineState),
    Status {
        msg: String,
        colour: Option<Colour>,
    },
    Results {
        status: ResultStatus,
        data: Map<String, Value>,
    },
    Devices(Vec<DeviceInfo>),
    /// Unix time in milliseconds
    Time(i64),
    Error(String),
}

/// Console wire form: a keyword followed by compact JSON or plain text
impl fmt::Display for ControllerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn json<T: Serialize>(value: &T) -> String {
            serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
        }
        match self {
            ControllerMessage::Data(data) => write!(f, "data {}", json(data)),
            ControllerMessage::Plot(data) => write!(f, "plot {}", json(data)),
            ControllerMessage::Control(event) => write!(f, "control {event}"),
            ControllerMessage::State(state) => write!(f, "state {state}"),
            ControllerMessage::Status { msg, colour } => write!(
                f,
                "status {}",
                json(&serde_json::json!({ "msg": msg, "col": colour }))
            ),
            ControllerMessage::Results { status, data } => {
                let mut data = data.clone();
                data.insert("status".to_string(), serde_json::json!(status));
                write!(f, "results {}", json(&data))
            }
            ControllerMessage::Devices(devices) => write!(f, "devices {}", json(devices)),
            ControllerMessage::Time(ms) => write!(f, "time {ms}"),
            ControllerMessage::Error(msg) => write!(f, "error {msg}"),
        }
    }
}

pub type SubscriberId = u64;

#[derive(Debug)]
struct Subscriber {
    id: SubscriberId,
    sender: UnboundedSender<ControllerMessage>,
    stream_enabled: bool,
    mode: StreamMode,
    plot_enabled: bool,
}

/// Attached consoles and their streaming preferences
#[derive(Debug, Default)]
pub struct Subscribers {
    next_id: SubscriberId,
    list: Vec<Subscriber>,
}

impl Subscribers {
    /// Register a new subscriber, streaming disabled
    pub fn attach(&mut self) -> (SubscriberId, UnboundedReceiver<ControllerMessage>) {
        let (sender, receiver) = unbounded_channel();
        self.next_id += 1;
        let id = self.next_id;
        self.list.push(Subscriber {
            id,
            sender,
            stream_enabled: false,
            mode: StreamMode::default(),
            plot_enabled: false,
        });
        (id, receiver)
    }

    pub fn detach(&mut self, id: SubscriberId) {
        self.list.retain(|s| s.id != id);
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Send to every subscriber, dropping those whose receiver is gone
    ///
    /// A `stopped` result also ends plot streaming, the routine has no more
    /// data to plot.
    pub fn broadcast(&mut self, message: ControllerMessage) {
        if let ControllerMessage::Results {
            status: ResultStatus::Stopped,
            ..
        } = message
        {
            for subscriber in &mut self.list {
                subscriber.plot_enabled = false;
            }
        }
        self.list
            .retain(|s| s.sender.send(message.clone()).is_ok());
    }

    pub fn send_to(&mut self, id: SubscriberId, message: ControllerMessage) {
        self.list
            .retain(|s| s.id != id || s.sender.send(message.clone()).is_ok());
    }

    pub fn set_stream_enabled(&mut self, id: SubscriberId, enabled: bool) {
        if let Some(s) = self.get_mut(id) {
            s.stream_enabled = enabled;
        }
    }

    pub fn set_mode(&mut self, id: SubscriberId, mode: StreamMode) {
        if let Some(s) = self.get_mut(id) {
            s.mode = mode;
        }
    }

    pub fn set_plot_enabled(&mut self, id: SubscriberId, enabled: bool) {
        if let Some(s) = self.get_mut(id) {
            s.plot_enabled = enabled;
        }
    }

    fn get_mut(&mut self, id: SubscriberId) -> Option<&mut Subscriber> {
        self.list.iter_mut().find(|s| s.id == id)
    }

    /// Stream modes requested this cycle
    pub fn requested_modes(&self) -> Vec<StreamMode> {
        let mut modes: Vec<StreamMode> = self
            .list
            .iter()
            .filter(|s| s.stream_enabled)
            .map(|s| s.mode)
            .collect();
        modes.sort_by_key(|m| *m as u8);
        modes.dedup();
        modes
    }

    pub fn wants_plot(&self) -> bool {
        self.list.iter().any(|s| s.plot_enabled)
    }

    /// Deliver one snapshot per streaming subscriber and the plot payloads
    pub fn publish(
        &mut self,
        snapshots: &[(StreamMode, BTreeMap<String, StatusValue>)],
        plots: &[Map<String, Value>],
    ) {
        self.list.retain(|s| {
            if s.stream_enabled {
                if let Some((_, data)) = snapshots.iter().find(|(mode, _)| *mode == s.mode) {
                    if s.sender.send(ControllerMessage::Data(data.clone())).is_err() {
                        return false;
                    }
                }
            }
            if s.plot_enabled {
                for plot in plots {
                    if s.sender.send(ControllerMessage::Plot(plot.clone())).is_err() {
                        return false;
                    }
                }
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::RangeFlag;

    #[test]
    fn test_wire_form() {
        assert_eq!(
            ControllerMessage::Control(ControlEvent::EstopOn).to_string(),
            "control estop on"
        );
        assert_eq!(
            ControllerMessage::State(RoutineState::Resumed).to_string(),
            "state resumed"
        );
        assert_eq!(ControllerMessage::Time(42).to_string(), "time 42");

        let mut data = BTreeMap::new();
        data.insert("A".to_string(), StatusValue::Value(1.5));
        data.insert("B".to_string(), StatusValue::Flag(RangeFlag::Over));
        assert_eq!(
            ControllerMessage::Data(data).to_string(),
            r#"data {"A":1.5,"B":"OVER"}"#
        );

        let status = ControllerMessage::Status {
            msg: "Recording results".into(),
            colour: Some(Colour::Amber),
        };
        assert_eq!(
            status.to_string(),
            r#"status {"col":"amber","msg":"Recording results"}"#
        );

        let results = ControllerMessage::Results {
            status: ResultStatus::Stopped,
            data: Map::new(),
        };
        assert_eq!(results.to_string(), r#"results {"status":"stopped"}"#);
    }

    #[test]
    fn test_stream_mode_from_index() {
        assert_eq!(StreamMode::try_from(2), Ok(StreamMode::Average));
        assert_eq!(StreamMode::try_from(4), Err(4));
        assert!(StreamMode::Stddev.uses_log());
        assert!(!StreamMode::Raw.uses_log());
    }

    #[test]
    fn test_publish_respects_preferences() {
        let mut subscribers = Subscribers::default();
        let (quiet, mut quiet_rx) = subscribers.attach();
        let (raw, mut raw_rx) = subscribers.attach();
        subscribers.set_stream_enabled(raw, true);
        subscribers.set_mode(raw, StreamMode::Raw);
        subscribers.set_plot_enabled(quiet, true);
        assert_eq!(subscribers.requested_modes(), vec![StreamMode::Raw]);

        let mut snapshot = BTreeMap::new();
        snapshot.insert("X".to_string(), StatusValue::Value(7.0));
        let mut plot = Map::new();
        plot.insert("t".to_string(), Value::from(1));
        subscribers.publish(&[(StreamMode::Raw, snapshot.clone())], &[plot.clone()]);

        assert_eq!(raw_rx.try_recv().unwrap(), ControllerMessage::Data(snapshot));
        assert!(raw_rx.try_recv().is_err());
        assert_eq!(quiet_rx.try_recv().unwrap(), ControllerMessage::Plot(plot));
    }

    #[test]
    fn test_closed_receivers_are_dropped() {
        let mut subscribers = Subscribers::default();
        let (_, rx) = subscribers.attach();
        let (_, _kept) = subscribers.attach();
        drop(rx);
        subscribers.broadcast(ControllerMessage::Time(1));
        assert_eq!(subscribers.len(), 1);
    }

    #[test]
    fn test_stopped_result_ends_plotting() {
        let mut subscribers = Subscribers::default();
        let (id, _rx) = subscribers.attach();
        subscribers.set_plot_enabled(id, true);
        assert!(subscribers.wants_plot());
        subscribers.broadcast(ControllerMessage::Results {
            status: ResultStatus::Stopped,
            data: Map::new(),
        });
        assert!(!subscribers.wants_plot());
    }
}
