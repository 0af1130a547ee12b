use anyhow::{anyhow, Result};
use std::collections::HashSet;

use crate::detect::Track;

/// Polygon used at the original installation, in bag-camera pixels.
pub const DEFAULT_ROI: [[i32; 2]; 4] = [[494, 335], [451, 709], [590, 677], [630, 363]];

/// Fixed counting region. Points on the boundary are inside.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionOfInterest {
    points: Vec<(i32, i32)>,
}

impl RegionOfInterest {
    pub fn new(points: Vec<(i32, i32)>) -> Result<Self> {
        if points.len() < 3 {
            return Err(anyhow!(
                "region of interest needs at least 3 points, got {}",
                points.len()
            ));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[(i32, i32)] {
        &self.points
    }

    pub fn contains(&self, (px, py): (i32, i32)) -> bool {
        let (px, py) = (px as i64, py as i64);
        let n = self.points.len();
        let mut inside = false;
        for i in 0..n {
            let (ax, ay) = self.points[i];
            let (bx, by) = self.points[(i + 1) % n];
            let (ax, ay, bx, by) = (ax as i64, ay as i64, bx as i64, by as i64);

            let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
            if cross == 0
                && px >= ax.min(bx)
                && px <= ax.max(bx)
                && py >= ay.min(by)
                && py <= ay.max(by)
            {
                return true;
            }

            if (ay > py) != (by > py) {
                // x of the edge at height py, compared without division
                let lhs = (px - ax) * (by - ay);
                let rhs = (bx - ax) * (py - ay);
                let crosses = if by > ay { lhs < rhs } else { lhs > rhs };
                if crosses {
                    inside = !inside;
                }
            }
        }
        inside
    }
}

impl Default for RegionOfInterest {
    fn default() -> Self {
        Self {
            points: DEFAULT_ROI.iter().map(|[x, y]| (*x, *y)).collect(),
        }
    }
}

/// Counts each tracked identity once, the first time its centroid is in the ROI.
///
/// Owned by a single bag stage.
#[derive(Debug)]
pub struct BagCounter {
    roi: RegionOfInterest,
    counted: HashSet<u64>,
    total: u64,
}

impl BagCounter {
    pub fn new(roi: RegionOfInterest) -> Self {
        Self {
            roi,
            counted: HashSet::new(),
            total: 0,
        }
    }

    pub fn roi(&self) -> &RegionOfInterest {
        &self.roi
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_counted(&self, id: u64) -> bool {
        self.counted.contains(&id)
    }

    /// Feed one frame of tracks. Returns the running total after each new count.
    pub fn observe(&mut self, tracks: &[Track]) -> Vec<u64> {
        let mut totals = Vec::new();
        for track in tracks {
            if self.counted.contains(&track.id) {
                continue;
            }
            if self.roi.contains(track.bbox.centroid()) {
                self.counted.insert(track.id);
                self.total += 1;
                totals.push(self.total);
            }
        }
        totals
    }
}
