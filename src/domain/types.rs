// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use crate::domain::proto::FortSearchOut;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Origin = String;

/// What a correlated wait produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceivedType {
    Undefined,
    Gmo,
    Mon,
    Gym,
    Stop,
    FortSearchResult(FortSearchResult),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FortSearchResult {
    Quest,
    Full,
    Time,
    OutOfRange,
    Cooldown,
    Inventory,
    Limit,
}

impl FortSearchResult {
    /// `None` for result codes that carry no actionable outcome.
    pub fn classify(search: &FortSearchOut) -> Option<Self> {
        match search.result {
            1 if search.items.is_empty() => Some(FortSearchResult::Time),
            1 if search.quest_type() == 0 => Some(FortSearchResult::Full),
            1 => Some(FortSearchResult::Quest),
            2 => Some(FortSearchResult::OutOfRange),
            3 => Some(FortSearchResult::Cooldown),
            4 => Some(FortSearchResult::Inventory),
            5 => Some(FortSearchResult::Limit),
            _ => None,
        }
    }

    pub fn is_softban(self) -> bool {
        matches!(self, FortSearchResult::Time | FortSearchResult::OutOfRange)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionStopType {
    GmoNotAvailable,
    GmoEmpty,
    Gym,
    VisitedStopInLevelModeToIgnore,
    StopDisabled,
    StopClosed,
    StopCooldown,
    NoFort,
    SpinnableStop,
}

impl PositionStopType {
    pub fn contains_stop_at_all(self) -> bool {
        matches!(
            self,
            PositionStopType::SpinnableStop
                | PositionStopType::VisitedStopInLevelModeToIgnore
                | PositionStopType::StopClosed
                | PositionStopType::StopCooldown
                | PositionStopType::StopDisabled
        )
    }

    pub fn needs_recheck(self) -> bool {
        matches!(
            self,
            PositionStopType::GmoNotAvailable | PositionStopType::GmoEmpty | PositionStopType::NoFort
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum QuestLayer {
    Ar = 0,
    NonAr = 1,
}

impl QuestLayer {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(QuestLayer::Ar),
            1 => Some(QuestLayer::NonAr),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Layer a device scans next given the quests it holds. A device holds at
/// most one quest per layer; `None` means the inventory does not settle it.
pub fn determine_current_quest_layer(quests_held: Option<&[i32]>) -> Option<QuestLayer> {
    match quests_held {
        None | Some([]) => Some(QuestLayer::Ar),
        Some([held]) => match QuestLayer::from_i32(*held)? {
            QuestLayer::NonAr => Some(QuestLayer::Ar),
            QuestLayer::Ar => Some(QuestLayer::NonAr),
        },
        Some(_) => None,
    }
}

/// How a mon was observed. Two chains: `NearbyCell < NearbyStop < Wild <
/// Encounter` and `LureWild < LureEncounter`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeenType {
    NearbyCell,
    NearbyStop,
    Wild,
    Encounter,
    LureWild,
    LureEncounter,
}

impl SeenType {
    pub const ALL: [SeenType; 6] = [
        SeenType::NearbyCell,
        SeenType::NearbyStop,
        SeenType::Wild,
        SeenType::Encounter,
        SeenType::LureWild,
        SeenType::LureEncounter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SeenType::NearbyCell => "nearby_cell",
            SeenType::NearbyStop => "nearby_stop",
            SeenType::Wild => "wild",
            SeenType::Encounter => "encounter",
            SeenType::LureWild => "lure_wild",
            SeenType::LureEncounter => "lure_encounter",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }

    fn rank(self) -> (u8, u8) {
        match self {
            SeenType::NearbyCell => (0, 0),
            SeenType::NearbyStop => (0, 1),
            SeenType::Wild => (0, 2),
            SeenType::Encounter => (0, 3),
            SeenType::LureWild => (1, 0),
            SeenType::LureEncounter => (1, 1),
        }
    }

    /// Whether replacing `self` by `next` moves forward in the lattice.
    /// Crossing chains is only allowed from a lure sighting into a wild
    /// sighting or encounter.
    pub fn can_advance_to(self, next: SeenType) -> bool {
        let (chain, level) = self.rank();
        let (next_chain, next_level) = next.rank();
        if chain == next_chain {
            return next_level > level;
        }
        match (self, next) {
            (SeenType::Encounter, _) | (SeenType::LureEncounter, _) => false,
            (SeenType::LureWild, SeenType::Wild | SeenType::Encounter) => true,
            _ => false,
        }
    }

    pub fn merge(current: Option<SeenType>, next: SeenType) -> SeenType {
        match current {
            Some(cur) if !cur.can_advance_to(next) => cur,
            _ => next,
        }
    }
}

impl fmt::Display for SeenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum TransportType {
    Teleport = 0,
    Walk = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum PositionType {
    Normal = 0,
    Prio = 1,
}

/// Area modes a device can be driven in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    MonMitm,
    IvMitm,
    RaidsMitm,
    Pokestops,
    InitMitm,
    Idle,
}

impl WorkerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerMode::MonMitm => "mon_mitm",
            WorkerMode::IvMitm => "iv_mitm",
            WorkerMode::RaidsMitm => "raids_mitm",
            WorkerMode::Pokestops => "pokestops",
            WorkerMode::InitMitm => "init_mitm",
            WorkerMode::Idle => "idle",
        }
    }

    pub fn scan_mode(self) -> ScanMode {
        match self {
            WorkerMode::MonMitm | WorkerMode::InitMitm => ScanMode::Mons,
            WorkerMode::IvMitm => ScanMode::Ivs,
            WorkerMode::RaidsMitm => ScanMode::Raids,
            WorkerMode::Pokestops => ScanMode::Quests,
            WorkerMode::Idle => ScanMode::Nothing,
        }
    }
}

/// Capture filter published to the device with every location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Mons,
    Ivs,
    Raids,
    Quests,
    Nothing,
}
