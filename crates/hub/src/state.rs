use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::gateway::CommandRejection;
use crate::policy::{ActuatorStates, ActuatorTarget, ControlState, Mode, Transition};
use crate::record::RunRecord;
use crate::stage::StageTable;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// The one lock every reader and writer goes through. Critical sections
/// only touch memory: sensor polls, relay writes and network I/O happen
/// outside it.
pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub stages: StageTable,
    pub control: ControlState,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Mode,
    Stage,
    Actuator,
    Alarm,
    Sensor,
    Command,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub mode: Mode,
    pub stage_index: usize,
    pub stage_name: String,
    pub stage_count: usize,
    pub target_temperature: f32,
    pub max_temperature: f32,
    pub target_humidity: f32,
    /// Last known values, `null` until the first successful read; check
    /// `reading_valid` before trusting them.
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub reading_valid: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub read_at: Option<OffsetDateTime>,
    pub alarm_active: bool,
    pub actuators: ActuatorStates,
    pub uptime_secs: u64,
    pub stage_elapsed_secs: u64,
    /// 0 in MANUAL and once the final stage has run its course.
    pub remaining_secs: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub now: OffsetDateTime,
    /// One-line summary; stale readings render as `--`.
    pub summary: String,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(stages: StageTable, now: Instant) -> Self {
        Self {
            started_at: now,
            stages,
            control: ControlState::new(now),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Install the result of a control tick. `fault` describes why the
    /// sample is missing, if it is.
    pub fn apply_tick(&mut self, tr: &Transition, fault: Option<&str>) {
        let prev = self.control;
        let next = tr.next;
        self.control = next;

        match (prev.reading.valid, next.reading.valid) {
            (true, false) => self.push_event(
                EventKind::Sensor,
                format!("sensor read failed: {}", fault.unwrap_or("no data")),
            ),
            (false, true) => self.push_event(
                EventKind::Sensor,
                format!(
                    "sensor online: {:.1}°C {:.1}%",
                    next.reading.temperature, next.reading.humidity
                ),
            ),
            _ => {}
        }

        if tr.alarm_changed {
            let target = self.stages.get(next.stage_index).target_temperature;
            let detail = if next.alarm_active {
                format!(
                    "alarm raised: {:.1}°C vs target {target:.1}°C",
                    next.reading.temperature
                )
            } else {
                "alarm cleared".to_string()
            };
            self.push_event(EventKind::Alarm, detail);
        }

        for (actuator, on) in &tr.changes {
            if actuator.is_governed() {
                self.push_event(
                    EventKind::Actuator,
                    format!("{actuator} {}", if *on { "ON" } else { "OFF" }),
                );
            }
        }

        if let Some(index) = tr.advanced_to {
            let name = self.stages.get(index).name.clone();
            self.push_event(EventKind::Stage, format!("auto-advanced to {name}"));
        }
    }

    /// Flip AUTO↔MANUAL. Entering MANUAL switches the heater off and freezes
    /// every other output where it is; entering AUTO leaves outputs for the
    /// next tick to recompute.
    pub fn toggle_mode(&mut self) -> Mode {
        let mode = self.control.mode.toggled();
        self.control.mode = mode;
        if mode == Mode::Manual {
            self.control.actuators.heater = false;
        }
        self.push_event(EventKind::Mode, format!("switched to {mode}"));
        mode
    }

    /// Move to the next stage (holding at the last) and restart its clock.
    pub fn advance_stage(&mut self, now: Instant) -> usize {
        let index = self.stages.next_index(self.control.stage_index);
        self.control.stage_index = index;
        self.control.stage_started_at = now;
        self.control.refresh_alarm(&self.stages);

        let name = self.stages.get(index).name.clone();
        self.push_event(EventKind::Stage, format!("manually advanced to {name}"));
        index
    }

    /// Start the profile over: first stage, AUTO, fresh clock.
    pub fn reset_run(&mut self, now: Instant) {
        self.control.mode = Mode::Auto;
        self.control.stage_index = 0;
        self.control.stage_started_at = now;
        self.control.refresh_alarm(&self.stages);
        self.push_event(EventKind::Stage, "run reset to first stage".to_string());
    }

    /// Flip an output (or output group) on operator request.
    ///
    /// Groups go to the inverse of "any member on", so a split pair ends up
    /// off. No state changes when the request is rejected.
    pub fn toggle_actuator(&mut self, target: ActuatorTarget) -> Result<bool, CommandRejection> {
        let members = target.members();
        if members.iter().any(|a| !a.is_governed()) {
            return Err(CommandRejection::AlarmGoverned);
        }
        if self.control.mode == Mode::Auto {
            return Err(CommandRejection::ModeConflict(target.label().to_string()));
        }

        let on = !members.iter().any(|a| self.control.actuators.get(*a));
        for a in members {
            self.control.actuators.set(*a, on);
        }
        self.push_event(
            EventKind::Command,
            format!("{} toggled {}", target.label(), if on { "ON" } else { "OFF" }),
        );
        Ok(on)
    }

    /// Record an operator command that was refused.
    pub fn record_rejection(&mut self, rejection: &CommandRejection) {
        self.push_event(EventKind::Command, format!("rejected: {rejection}"));
    }

    /// Record a relay write that did not go through.
    pub fn record_actuator_fault(&mut self, detail: String) {
        self.push_event(EventKind::Actuator, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, now: Instant, wall: OffsetDateTime) -> StatusResponse {
        let c = &self.control;
        let stage = self.stages.get(c.stage_index);
        let elapsed = now.saturating_duration_since(c.stage_started_at);
        let remaining_secs = match c.mode {
            Mode::Manual => 0,
            Mode::Auto => stage.duration().saturating_sub(elapsed).as_secs(),
        };

        StatusResponse {
            mode: c.mode,
            stage_index: c.stage_index,
            stage_name: stage.name.clone(),
            stage_count: self.stages.last_index() + 1,
            target_temperature: stage.target_temperature,
            max_temperature: stage.max_temperature,
            target_humidity: stage.target_humidity,
            temperature: c.reading.read_at.map(|_| c.reading.temperature),
            humidity: c.reading.read_at.map(|_| c.reading.humidity),
            reading_valid: c.reading.valid,
            read_at: c.reading.read_at,
            alarm_active: c.alarm_active,
            actuators: c.actuators,
            uptime_secs: now.saturating_duration_since(self.started_at).as_secs(),
            stage_elapsed_secs: elapsed.as_secs(),
            remaining_secs,
            now: wall,
            summary: self.summary(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    /// Run-log record for the current state.
    pub fn to_record(&self, wall: OffsetDateTime) -> RunRecord {
        let c = &self.control;
        let valid = c.reading.valid;
        RunRecord {
            ts: wall,
            mode: c.mode,
            stage_index: c.stage_index,
            stage_name: self.stages.get(c.stage_index).name.clone(),
            temperature: valid.then_some(c.reading.temperature),
            humidity: valid.then_some(c.reading.humidity),
            alarm_active: c.alarm_active,
            actuators: c.actuators,
        }
    }

    /// `T 25.0/30.0C H 60.0% YELLOWING AUTO H-F-D-!`
    pub fn summary(&self) -> String {
        let c = &self.control;
        let stage = self.stages.get(c.stage_index);
        let (t, h) = if c.reading.valid {
            (
                format!("{:.1}", c.reading.temperature),
                format!("{:.1}", c.reading.humidity),
            )
        } else {
            ("--".to_string(), "--".to_string())
        };
        format!(
            "T {t}/{:.1}C H {h}% {} {} {}{}",
            stage.target_temperature,
            stage.name,
            c.mode,
            c.actuators.flags(),
            if c.alarm_active { " ALARM" } else { "" }
        )
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
