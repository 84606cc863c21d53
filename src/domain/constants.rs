// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

// =============================================================================
// DEDUP CACHE TTLS (seconds)
// =============================================================================

pub const CACHE_TTL_STOP: u64 = 15 * 60;
pub const CACHE_TTL_STOP_DETAILS: u64 = 15 * 60;
pub const CACHE_TTL_GYM: u64 = 15 * 60;
pub const CACHE_TTL_RAID: u64 = 15 * 60;
pub const CACHE_TTL_WEATHER: u64 = 15 * 60;
pub const CACHE_TTL_CELL_FORTS: u64 = 15 * 60;
pub const CACHE_TTL_S2_CELL: u64 = 60;
pub const CACHE_TTL_ROUTE: u64 = 15 * 60;
pub const CACHE_TTL_MON_NEARBY: u64 = 15 * 60;
pub const CACHE_TTL_MON_LURE_NOIV: u64 = 5 * 60;
pub const CACHE_TTL_MON_LURE_IV: u64 = 5 * 60;
pub const CACHE_TTL_INVENTORY: u64 = 60;
/// Fallback for mon keys whose despawn already passed.
pub const CACHE_TTL_MON_MIN: u64 = 1;

// =============================================================================
// GAME MECHANICS
// =============================================================================

pub const DEFAULT_SPAWNDEF: i64 = 240;
pub const DEFAULT_EVENT_ID: i64 = 1;
pub const EARLIEST_UNSEEN_UNKNOWN: i64 = 99_999_999;
/// Spawns reporting a time-till-hidden above this are treated as unknown.
pub const MAX_TIME_TILL_HIDDEN_MS: i64 = 90_000;
pub const DITTO_MON_ID: i32 = 132;
pub const DITTO_GENDER: i32 = 3;
pub const DITTO_MOVES: (i32, i32) = (242, 133);
pub const POTENTIAL_DITTOS: [i32; 11] = [46, 163, 165, 167, 187, 223, 293, 316, 322, 399, 590];
pub const LURE_IV_DESPAWN_SECS: i64 = 120;
pub const DEFAULT_LURE_DURATION_MINUTES: i64 = 30;
pub const MIN_LEVEL_IV: i32 = 30;
/// How long a device remembers a mon it IV-scanned.
pub const ENCOUNTERED_TTL_SECS: i64 = 30 * 60;

// =============================================================================
// STRATEGY DISTANCES (meters) AND TIMINGS (seconds)
// =============================================================================

pub const DISTANCE_CONSIDER_ENCOUNTERS: f64 = 70.0;
pub const DISTANCE_CONSIDER_IV_ENCOUNTERS: f64 = 65.0;
pub const MINIMUM_DISTANCE_ALLOWANCE_FOR_GMO: f64 = 5.0;
pub const RADIUS_FOR_CELLS_CONSIDERED_FOR_STOP_SCAN: f64 = 35.0;
pub const STOP_SPIN_DISTANCE: f64 = 40.0;
pub const STOP_DELETE_RADIUS: f64 = 100.0;
pub const STOP_DELETE_AGE_SECS: i64 = 3 * 24 * 3600;
pub const S2_GMO_CELL_LEVEL: u8 = 15;
pub const S2_WEATHER_CELL_LEVEL: u8 = 10;
pub const WALK_TIMESTAMP_BUFFER_SECS: i64 = 10;
pub const ENCOUNTER_WAIT_TIMEOUT_SECS: u64 = 10;
pub const GMO_WAIT_TIMEOUT_SECS: u64 = 30;
pub const FORT_SEARCH_WAIT_TIMEOUT_SECS: u64 = 35;
pub const INJECTION_POLL_ROUNDS: u32 = 20;
pub const SPINNABLE_FAILCOUNT_RESTART: u32 = 3;
pub const SOFTBAN_SPEED_MPS: f64 = 16.67;

/// `(max distance in meters, cooldown in seconds)`; first row whose bound
/// is not exceeded wins.
pub const SOFTBAN_COOLDOWN_TABLE: [(f64, i64); 4] = [
    (1_000.0, 10),
    (5_000.0, 90),
    (10_000.0, 450),
    (1_000_000.0, 7_200),
];
pub const SOFTBAN_COOLDOWN_MAX: i64 = 7_200;

/// Extra delay after a teleport when `cooldown_sleep` is enabled.
pub const TELEPORT_COOLDOWN_STEPS: [(f64, i64); 3] =
    [(10_000.0, 15), (5_000.0, 10), (2_500.0, 8)];

// =============================================================================
// STATS
// =============================================================================

pub const STATS_RETENTION_SECS: i64 = 7 * 24 * 3600;
pub const LOCATION_RAW_PERIOD_SECS: i64 = 3600;
