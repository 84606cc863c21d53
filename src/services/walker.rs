// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Walker programs: an ordered list of area assignments, each with an exit
//! condition evaluated between locations.

use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalkerKind {
    Countdown,
    Timer,
    Period,
    Round,
    Coords,
    Idle,
}

impl WalkerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WalkerKind::Countdown => "countdown",
            WalkerKind::Timer => "timer",
            WalkerKind::Period => "period",
            WalkerKind::Round => "round",
            WalkerKind::Coords => "coords",
            WalkerKind::Idle => "idle",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkerStep {
    pub area_id: String,
    pub kind: WalkerKind,
    #[serde(default)]
    pub value: String,
    /// Upper bound of devices concurrently working the area.
    #[serde(default)]
    pub max_walkers: Option<usize>,
    /// Step only runs while this event is active.
    #[serde(default)]
    pub eventid: Option<i64>,
}

/// Runtime facts a step's exit condition is evaluated against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WalkerContext {
    pub step_started_at: i64,
    pub now_unix: i64,
    pub rounds: u32,
    pub route_exhausted: bool,
    pub current_event: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkerDecision {
    Continue,
    Exit,
    /// Inside an idle window: stop the client until the window closes.
    Idle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TimeWindow {
    from: NaiveTime,
    till: NaiveTime,
}

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let (h, m) = raw.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
}

fn parse_window(raw: &str) -> Option<TimeWindow> {
    let (from, till) = raw.split_once('-')?;
    Some(TimeWindow {
        from: parse_clock(from)?,
        till: parse_clock(till)?,
    })
}

impl TimeWindow {
    /// Windows crossing midnight are anchored on the side `now` is on.
    fn contains(&self, now: NaiveDateTime) -> bool {
        let now = now.with_second(0).unwrap_or(now);
        let date = now.date();
        let mut from = date.and_time(self.from);
        let mut till = date.and_time(self.till);
        if from > till {
            if now < from {
                from -= Duration::days(1);
            } else {
                till += Duration::days(1);
            }
        }
        from <= now && now <= till
    }
}

/// `HH:MM` means "until then today"; `HH:MM-HH:MM` means "inside window".
/// `None` when the value is malformed.
fn value_in_range(value: &str, now: NaiveDateTime) -> Option<bool> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.contains('-') {
        return parse_window(&compact).map(|w| w.contains(now));
    }
    let till = now.date().and_time(parse_clock(&compact)?);
    Some(now < till)
}

impl WalkerStep {
    /// Whether the step may be entered at all right now.
    pub fn pre_check(&self, current_event: i64, now: NaiveDateTime) -> bool {
        if self.eventid.is_some_and(|e| e != current_event) {
            return false;
        }
        match self.kind {
            WalkerKind::Timer | WalkerKind::Period | WalkerKind::Coords | WalkerKind::Idle => {
                if self.value.trim().is_empty() {
                    return true;
                }
                value_in_range(&self.value, now).unwrap_or(false)
            }
            WalkerKind::Countdown | WalkerKind::Round => true,
        }
    }

    pub fn should_continue(&self, ctx: &WalkerContext, now: NaiveDateTime) -> WalkerDecision {
        if self.eventid.is_some_and(|e| e != ctx.current_event) {
            tracing::info!(target: "walker", area = %self.area_id, "Another event started, leaving area");
            return WalkerDecision::Exit;
        }
        let value = self.value.trim();
        match self.kind {
            WalkerKind::Countdown => match value.parse::<i64>() {
                Ok(secs) if ctx.now_unix < ctx.step_started_at + secs => WalkerDecision::Continue,
                Ok(_) => WalkerDecision::Exit,
                Err(_) => self.invalid(),
            },
            WalkerKind::Round => match value.parse::<u32>() {
                Ok(rounds) if ctx.rounds < rounds => WalkerDecision::Continue,
                Ok(_) => WalkerDecision::Exit,
                Err(_) => self.invalid(),
            },
            WalkerKind::Timer | WalkerKind::Period => {
                if !value.contains(':') {
                    return self.invalid();
                }
                match value_in_range(value, now) {
                    Some(true) => WalkerDecision::Continue,
                    Some(false) => WalkerDecision::Exit,
                    None => self.invalid(),
                }
            }
            WalkerKind::Coords => {
                if ctx.route_exhausted {
                    WalkerDecision::Exit
                } else if value.is_empty() {
                    WalkerDecision::Continue
                } else {
                    match value_in_range(value, now) {
                        Some(true) => WalkerDecision::Continue,
                        Some(false) => WalkerDecision::Exit,
                        None => self.invalid(),
                    }
                }
            }
            WalkerKind::Idle => match value_in_range(value, now) {
                Some(true) => WalkerDecision::Idle,
                Some(false) => WalkerDecision::Exit,
                None => self.invalid(),
            },
        }
    }

    fn invalid(&self) -> WalkerDecision {
        tracing::error!(
            target: "walker",
            area = %self.area_id,
            kind = ?self.kind,
            value = %self.value,
            "Invalid walker value, leaving area"
        );
        WalkerDecision::Exit
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkerProgram {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<WalkerStep>,
}

impl WalkerProgram {
    /// First step at or after `start` (wrapping) whose pre-check passes.
    pub fn select_step(&self, start: usize, current_event: i64, now: NaiveDateTime) -> Option<usize> {
        let len = self.steps.len();
        if len == 0 {
            return None;
        }
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|idx| self.steps[*idx].pre_check(current_event, now))
    }

    pub fn step(&self, index: usize) -> Option<&WalkerStep> {
        self.steps.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 1)
            .and_then(|d| d.and_hms_opt(h, m, 30))
            .expect("valid time")
    }

    fn step(kind: WalkerKind, value: &str) -> WalkerStep {
        WalkerStep {
            area_id: "north".to_string(),
            kind,
            value: value.to_string(),
            max_walkers: None,
            eventid: None,
        }
    }

    #[test]
    fn countdown_and_round_use_context() {
        let ctx = WalkerContext {
            step_started_at: 1_000,
            now_unix: 1_500,
            rounds: 2,
            ..Default::default()
        };
        let now = at(12, 0);
        assert_eq!(step(WalkerKind::Countdown, "600").should_continue(&ctx, now), WalkerDecision::Continue);
        assert_eq!(step(WalkerKind::Countdown, "500").should_continue(&ctx, now), WalkerDecision::Exit);
        assert_eq!(step(WalkerKind::Round, "3").should_continue(&ctx, now), WalkerDecision::Continue);
        assert_eq!(step(WalkerKind::Round, "2").should_continue(&ctx, now), WalkerDecision::Exit);
        assert_eq!(step(WalkerKind::Round, "").should_continue(&ctx, now), WalkerDecision::Exit);
    }

    #[test]
    fn timer_and_period_follow_the_clock() {
        let ctx = WalkerContext::default();
        assert_eq!(step(WalkerKind::Timer, "13:00").should_continue(&ctx, at(12, 59)), WalkerDecision::Continue);
        assert_eq!(step(WalkerKind::Timer, "13:00").should_continue(&ctx, at(13, 0)), WalkerDecision::Exit);
        assert_eq!(step(WalkerKind::Period, "08:00-10:00").should_continue(&ctx, at(9, 0)), WalkerDecision::Continue);
        assert_eq!(step(WalkerKind::Period, "08:00-10:00").should_continue(&ctx, at(10, 1)), WalkerDecision::Exit);
        // Window across midnight.
        assert_eq!(step(WalkerKind::Period, "22:00 - 02:00").should_continue(&ctx, at(1, 0)), WalkerDecision::Continue);
        assert_eq!(step(WalkerKind::Period, "22:00-02:00").should_continue(&ctx, at(23, 0)), WalkerDecision::Continue);
        assert_eq!(step(WalkerKind::Period, "22:00-02:00").should_continue(&ctx, at(12, 0)), WalkerDecision::Exit);
        assert_eq!(step(WalkerKind::Timer, "noon").should_continue(&ctx, at(9, 0)), WalkerDecision::Exit);
    }

    #[test]
    fn coords_and_idle() {
        let mut ctx = WalkerContext::default();
        assert_eq!(step(WalkerKind::Coords, "").should_continue(&ctx, at(3, 0)), WalkerDecision::Continue);
        assert_eq!(step(WalkerKind::Coords, "01:00-02:00").should_continue(&ctx, at(3, 0)), WalkerDecision::Exit);
        ctx.route_exhausted = true;
        assert_eq!(step(WalkerKind::Coords, "").should_continue(&ctx, at(3, 0)), WalkerDecision::Exit);

        let idle = step(WalkerKind::Idle, "02:00-05:00");
        assert_eq!(idle.should_continue(&ctx, at(3, 0)), WalkerDecision::Idle);
        assert_eq!(idle.should_continue(&ctx, at(6, 0)), WalkerDecision::Exit);
    }

    #[test]
    fn select_step_wraps_and_skips_out_of_range() {
        let mut event_step = step(WalkerKind::Coords, "");
        event_step.eventid = Some(7);
        let program = WalkerProgram {
            name: "day".to_string(),
            steps: vec![
                step(WalkerKind::Period, "06:00-12:00"),
                event_step,
                step(WalkerKind::Idle, "02:00-05:00"),
                step(WalkerKind::Round, "1"),
            ],
        };
        assert_eq!(program.select_step(0, 1, at(7, 0)), Some(0));
        assert_eq!(program.select_step(1, 1, at(7, 0)), Some(3));
        assert_eq!(program.select_step(1, 7, at(7, 0)), Some(1));
        assert_eq!(program.select_step(2, 1, at(3, 0)), Some(2));
        assert_eq!(program.select_step(0, 1, at(13, 0)), Some(3));
        assert_eq!(WalkerProgram::default().select_step(0, 1, at(13, 0)), None);
    }
}
