// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

pub mod constants;
pub mod error;
pub mod geo;
pub mod proto;
pub mod s2;
pub mod types;
