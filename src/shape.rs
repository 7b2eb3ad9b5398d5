//! Block position generators for the bulk building commands.
use crate::prelude::*;

/// Number of blocks in the box spanned by two corners (inclusive).
pub fn cuboid_volume(a: BlockPos, b: BlockPos) -> u64 {
    let span = |p: i32, q: i32| (i64::from(p) - i64::from(q)).unsigned_abs() + 1;
    span(a.x, b.x) * span(a.y, b.y) * span(a.z, b.z)
}

pub fn cuboid(a: BlockPos, b: BlockPos) -> Vec<BlockPos> {
    let (lo, hi) = (
        V3(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
        V3(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
    );
    let mut out = Vec::with_capacity(cuboid_volume(a, b) as usize);
    for y in lo.y..=hi.y {
        for z in lo.z..=hi.z {
            for x in lo.x..=hi.x {
                out.push(V3(x, y, z));
            }
        }
    }
    out
}

/// Horizontal ring: every column whose distance from the centre rounds to `radius`.
pub fn circle(center: BlockPos, radius: i32) -> Vec<BlockPos> {
    let r = f64::from(radius);
    let mut out = vec![];
    for dx in -radius..=radius {
        for dz in -radius..=radius {
            let d = f64::from(dx * dx + dz * dz).sqrt();
            if (d - r).abs() < 0.5 {
                out.push(V3(center.x + dx, center.y, center.z + dz));
            }
        }
    }
    out
}

/// Hollow sphere, one block thick.
pub fn sphere(center: BlockPos, radius: i32) -> Vec<BlockPos> {
    let r = f64::from(radius);
    let mut out = vec![];
    for dx in -radius..=radius {
        for dy in -radius..=radius {
            for dz in -radius..=radius {
                let d = f64::from(dx * dx + dy * dy + dz * dz).sqrt();
                if d <= r && d >= r - 1.0 {
                    out.push(V3(center.x + dx, center.y + dy, center.z + dz));
                }
            }
        }
    }
    out
}

/// Straight wall from `(from.x, from.z)` to `(to.x, to.z)`, `height` blocks tall
/// starting at `base_y`.
pub fn wall(from: BlockPos, to: BlockPos, base_y: i32, height: i32) -> Vec<BlockPos> {
    let (dx, dz) = (to.x - from.x, to.z - from.z);
    let steps = dx.abs().max(dz.abs()).max(1);
    let mut columns: Vec<(i32, i32)> = Vec::with_capacity(steps as usize + 1);
    for i in 0..=steps {
        let along = |d: i32| (i64::from(d) * i64::from(i) / i64::from(steps)) as i32;
        let column = (from.x + along(dx), from.z + along(dz));
        if columns.last() != Some(&column) {
            columns.push(column);
        }
    }
    columns
        .into_iter()
        .flat_map(|(x, z)| (0..height.max(0)).map(move |h| V3(x, base_y + h, z)))
        .collect()
}
