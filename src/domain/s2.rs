// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Minimal S2 cell-id geometry: point to cell, parent, and cell centre.
//! Only what the GMO handling needs; the Hilbert lookup tables follow the
//! reference S2 library layout.

use crate::domain::geo::{Location, destination};
use lazy_static::lazy_static;
use std::collections::BTreeSet;

pub const MAX_LEVEL: u8 = 30;
const POS_BITS: u32 = 2 * MAX_LEVEL as u32 + 1;
const MAX_SIZE: u64 = 1 << MAX_LEVEL;
const LOOKUP_BITS: u32 = 4;
const SWAP_MASK: usize = 0x01;
const INVERT_MASK: usize = 0x02;
const POS_TO_IJ: [[usize; 4]; 4] = [[0, 1, 3, 2], [0, 2, 3, 1], [3, 2, 0, 1], [3, 1, 0, 2]];
const POS_TO_ORIENTATION: [usize; 4] = [SWAP_MASK, 0, 0, INVERT_MASK | SWAP_MASK];
const LOOKUP_LEN: usize = 1 << (2 * LOOKUP_BITS + 2);

struct Lookup {
    pos: Vec<usize>,
    ij: Vec<usize>,
}

lazy_static! {
    static ref LOOKUP: Lookup = build_lookup();
}

fn build_lookup() -> Lookup {
    let mut table = Lookup {
        pos: vec![0; LOOKUP_LEN],
        ij: vec![0; LOOKUP_LEN],
    };
    for orientation in [0, SWAP_MASK, INVERT_MASK, SWAP_MASK | INVERT_MASK] {
        init_lookup_cell(&mut table, 0, 0, 0, orientation, 0, orientation);
    }
    table
}

fn init_lookup_cell(
    table: &mut Lookup,
    level: u32,
    i: usize,
    j: usize,
    orig_orientation: usize,
    pos: usize,
    orientation: usize,
) {
    if level == LOOKUP_BITS {
        let ij = (i << LOOKUP_BITS) + j;
        table.pos[(ij << 2) + orig_orientation] = (pos << 2) + orientation;
        table.ij[(pos << 2) + orig_orientation] = (ij << 2) + orientation;
        return;
    }
    let r = POS_TO_IJ[orientation];
    for (index, cell) in r.iter().enumerate() {
        init_lookup_cell(
            table,
            level + 1,
            (i << 1) + (cell >> 1),
            (j << 1) + (cell & 1),
            orig_orientation,
            (pos << 2) + index,
            orientation ^ POS_TO_ORIENTATION[index],
        );
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub u64);

impl CellId {
    pub fn from_location(loc: &Location) -> Self {
        let lat = loc.lat.to_radians();
        let lng = loc.lng.to_radians();
        let xyz = [lat.cos() * lng.cos(), lat.cos() * lng.sin(), lat.sin()];
        let (face, u, v) = xyz_to_face_uv(xyz);
        let i = st_to_ij(uv_to_st(u));
        let j = st_to_ij(uv_to_st(v));
        Self::from_face_ij(face, i, j)
    }

    pub fn from_location_at(loc: &Location, level: u8) -> Self {
        Self::from_location(loc).parent(level)
    }

    fn from_face_ij(face: u64, i: u64, j: u64) -> Self {
        let lookup = &*LOOKUP;
        let mut n: u64 = face << (POS_BITS - 1);
        let mut bits = (face as usize) & SWAP_MASK;
        let mask = (1u64 << LOOKUP_BITS) - 1;
        for k in (0..8u32).rev() {
            bits += (((i >> (k * LOOKUP_BITS)) & mask) as usize) << (LOOKUP_BITS + 2);
            bits += (((j >> (k * LOOKUP_BITS)) & mask) as usize) << 2;
            bits = lookup.pos[bits];
            n |= ((bits >> 2) as u64) << (k * 2 * LOOKUP_BITS);
            bits &= SWAP_MASK | INVERT_MASK;
        }
        CellId(n * 2 + 1)
    }

    pub fn face(&self) -> u64 {
        self.0 >> POS_BITS
    }

    fn lsb(&self) -> u64 {
        self.0 & self.0.wrapping_neg()
    }

    pub fn level(&self) -> u8 {
        MAX_LEVEL - (self.0.trailing_zeros() / 2) as u8
    }

    pub fn is_leaf(&self) -> bool {
        self.0 & 1 == 1
    }

    pub fn parent(&self, level: u8) -> Self {
        let level = level.min(MAX_LEVEL);
        let lsb = 1u64 << (2 * (MAX_LEVEL - level) as u32);
        CellId((self.0 & lsb.wrapping_neg()) | lsb)
    }

    pub fn contains(&self, other: &CellId) -> bool {
        let lsb = self.lsb();
        other.0 >= self.0 - (lsb - 1) && other.0 <= self.0 + (lsb - 1)
    }

    fn to_face_ij(self) -> (u64, u64, u64) {
        let lookup = &*LOOKUP;
        let face = self.face();
        let mut bits = (face as usize) & SWAP_MASK;
        let (mut i, mut j) = (0u64, 0u64);
        for k in (0..8u32).rev() {
            let nbits = if k == 7 {
                MAX_LEVEL as u32 - 7 * LOOKUP_BITS
            } else {
                LOOKUP_BITS
            };
            bits += (((self.0 >> (k * 2 * LOOKUP_BITS + 1)) & ((1u64 << (2 * nbits)) - 1))
                as usize)
                << 2;
            bits = lookup.ij[bits];
            i += ((bits >> (LOOKUP_BITS + 2)) as u64) << (k * LOOKUP_BITS);
            j += (((bits >> 2) & ((1 << LOOKUP_BITS) - 1)) as u64) << (k * LOOKUP_BITS);
            bits &= SWAP_MASK | INVERT_MASK;
        }
        (face, i, j)
    }

    pub fn center(&self) -> Location {
        let (face, i, j) = self.to_face_ij();
        let delta = if self.is_leaf() {
            1
        } else if (i ^ (self.0 >> 2)) & 1 == 1 {
            2
        } else {
            0
        };
        let si = 2 * i + delta;
        let ti = 2 * j + delta;
        let s = si as f64 / (2 * MAX_SIZE) as f64;
        let t = ti as f64 / (2 * MAX_SIZE) as f64;
        let [x, y, z] = face_uv_to_xyz(face, st_to_uv(s), st_to_uv(t));
        let lat = z.atan2((x * x + y * y).sqrt()).to_degrees();
        let lng = y.atan2(x).to_degrees();
        Location::new(lat, lng)
    }

    /// Stored as the same bit pattern in a signed column.
    pub fn as_i64(&self) -> i64 {
        self.0 as i64
    }

    pub fn from_i64(raw: i64) -> Self {
        CellId(raw as u64)
    }
}

fn xyz_to_face_uv(p: [f64; 3]) -> (u64, f64, f64) {
    let abs = [p[0].abs(), p[1].abs(), p[2].abs()];
    let mut axis = if abs[0] > abs[1] { 0 } else { 1 };
    if abs[2] > abs[axis] {
        axis = 2;
    }
    let face = if p[axis] < 0.0 { axis + 3 } else { axis };
    let (u, v) = match face {
        0 => (p[1] / p[0], p[2] / p[0]),
        1 => (-p[0] / p[1], p[2] / p[1]),
        2 => (-p[0] / p[2], -p[1] / p[2]),
        3 => (p[2] / p[0], p[1] / p[0]),
        4 => (p[2] / p[1], -p[0] / p[1]),
        _ => (-p[1] / p[2], -p[0] / p[2]),
    };
    (face as u64, u, v)
}

fn face_uv_to_xyz(face: u64, u: f64, v: f64) -> [f64; 3] {
    match face {
        0 => [1.0, u, v],
        1 => [-u, 1.0, v],
        2 => [-u, -v, 1.0],
        3 => [-1.0, -v, -u],
        4 => [v, -1.0, -u],
        _ => [v, u, -1.0],
    }
}

fn uv_to_st(u: f64) -> f64 {
    if u >= 0.0 {
        0.5 * (1.0 + 3.0 * u).sqrt()
    } else {
        1.0 - 0.5 * (1.0 - 3.0 * u).sqrt()
    }
}

fn st_to_uv(s: f64) -> f64 {
    if s >= 0.5 {
        (1.0 / 3.0) * (4.0 * s * s - 1.0)
    } else {
        (1.0 / 3.0) * (1.0 - 4.0 * (1.0 - s) * (1.0 - s))
    }
}

fn st_to_ij(s: f64) -> u64 {
    let v = (MAX_SIZE as f64 * s).floor();
    v.clamp(0.0, (MAX_SIZE - 1) as f64) as u64
}

/// Cells at `level` touched by a disc of `radius_m` around `center`.
/// Sampled on the rim and half-rim; enough for radii well below the cell size.
pub fn cells_around(center: &Location, radius_m: f64, level: u8) -> BTreeSet<CellId> {
    let mut cells = BTreeSet::new();
    cells.insert(CellId::from_location_at(center, level));
    for step in 0..16 {
        let bearing = step as f64 * 22.5;
        cells.insert(CellId::from_location_at(
            &destination(center, bearing, radius_m),
            level,
        ));
        if step % 2 == 0 {
            cells.insert(CellId::from_location_at(
                &destination(center, bearing, radius_m / 2.0),
                level,
            ));
        }
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::distance_m;

    #[test]
    fn leaf_center_is_close_to_point() {
        for loc in [
            Location::new(52.52, 13.405),
            Location::new(-33.8688, 151.2093),
            Location::new(40.0, -105.0),
            Location::new(0.1, -179.9),
        ] {
            let id = CellId::from_location(&loc);
            assert_eq!(id.level(), 30);
            assert!(distance_m(&id.center(), &loc) < 0.05);
        }
    }

    #[test]
    fn parent_contains_child_and_reports_level() {
        let loc = Location::new(52.52, 13.405);
        let leaf = CellId::from_location(&loc);
        let cell15 = leaf.parent(15);
        assert_eq!(cell15.level(), 15);
        assert!(cell15.contains(&leaf));
        assert_eq!(cell15.parent(10), leaf.parent(10));
        // level 15 cells are a few hundred meters across
        assert!(distance_m(&cell15.center(), &loc) < 300.0);
    }

    #[test]
    fn cells_around_includes_own_cell() {
        let loc = Location::new(40.0, -105.0);
        let cells = cells_around(&loc, 35.0, 15);
        assert!(cells.contains(&CellId::from_location_at(&loc, 15)));
        assert!(cells.len() <= 4);
    }

    #[test]
    fn signed_storage_round_trips() {
        let id = CellId(0xB09E_9A8D_0000_0000 | (1 << 31));
        assert_eq!(CellId::from_i64(id.as_i64()), id);
    }
}
