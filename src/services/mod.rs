// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

pub mod device;
pub mod ingress;
pub mod mapping;
pub mod mitm_mapper;
pub mod processor;
pub mod stats;
pub mod status;
pub mod strategy;
pub mod walker;
pub mod worker;
