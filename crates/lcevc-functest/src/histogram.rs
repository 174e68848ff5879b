//! Per-plane pixel deviation between two raw planar YUV files.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use lcevc_functest_error::{FunctestError, Result};
use tracing::debug;

/// J:a:b chroma subsampling, e.g. `420`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subsampling {
    pub luma: u32,
    pub first: u32,
    pub second: u32,
}

impl Subsampling {
    pub const YUV420: Self = Self {
        luma: 4,
        first: 2,
        second: 0,
    };

    /// Parse three digits such as `420`, `422` or `444`.
    pub fn parse(value: &str) -> Result<Self> {
        let digits: Vec<u32> = value.chars().filter_map(|c| c.to_digit(10)).collect();
        match digits.as_slice() {
            [luma, first, second] if digits.len() == value.len() && *luma > 0 => Ok(Self {
                luma: *luma,
                first: *first,
                second: *second,
            }),
            _ => Err(FunctestError::assertion(format!(
                "invalid subsampling '{value}'"
            ))),
        }
    }
}

/// Dimensions and sample layout of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u64,
    pub height: u64,
    pub bit_depth: u32,
    pub subsampling: Subsampling,
}

impl FrameGeometry {
    fn bytes_per_sample(&self) -> u64 {
        if self.bit_depth > 8 { 2 } else { 1 }
    }

    /// Byte sizes of the luma plane and of each chroma plane.
    #[must_use]
    pub fn plane_sizes(&self) -> (u64, u64) {
        let luma = self.width * self.height;
        let ratio = f64::from(self.subsampling.first + self.subsampling.second)
            / f64::from(self.subsampling.luma);
        let chroma = ((ratio * luma as f64) / 2.0) as u64;
        let bytes = self.bytes_per_sample();
        (luma * bytes, chroma * bytes)
    }

    #[must_use]
    pub fn frame_size(&self) -> u64 {
        let (luma, chroma) = self.plane_sizes();
        luma + 2 * chroma
    }
}

/// Percentage of samples at each `reference - sample` difference, averaged
/// over frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaneHistogram {
    levels: BTreeMap<i32, f64>,
}

impl PlaneHistogram {
    #[must_use]
    pub fn levels(&self) -> &BTreeMap<i32, f64> {
        &self.levels
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Percentage of samples within `±tolerance`, rounded to three decimals.
    #[must_use]
    pub fn within(&self, tolerance: u32) -> f64 {
        // Deviations of 16-bit samples never exceed this.
        let tolerance = tolerance.min(u32::from(u16::MAX)) as i32;
        let total: f64 = self
            .levels
            .range(-tolerance..=tolerance)
            .map(|(_, percent)| percent)
            .sum();
        (total * 1000.0).round() / 1000.0
    }
}

fn plane_histogram(reference: &[u8], sample: &[u8], wide: bool) -> BTreeMap<i32, f64> {
    let mut counts: BTreeMap<i32, u64> = BTreeMap::new();
    let mut total = 0_u64;
    if wide {
        for (r, s) in reference.chunks_exact(2).zip(sample.chunks_exact(2)) {
            let r = i32::from(u16::from_le_bytes([r[0], r[1]]));
            let s = i32::from(u16::from_le_bytes([s[0], s[1]]));
            *counts.entry(r - s).or_default() += 1;
            total += 1;
        }
    } else {
        for (r, s) in reference.iter().zip(sample) {
            *counts.entry(i32::from(*r) - i32::from(*s)).or_default() += 1;
            total += 1;
        }
    }
    counts
        .into_iter()
        .map(|(level, count)| (level, count as f64 * 100.0 / total as f64))
        .collect()
}

/// Y, U and V deviation histograms of `sample` against `reference`.
///
/// Both files must be the same size; trailing bytes short of a full frame
/// are ignored.
pub fn pixel_deviation_histogram(
    reference: &Path,
    sample: &Path,
    geometry: &FrameGeometry,
) -> Result<[PlaneHistogram; 3]> {
    let reference_size = std::fs::metadata(reference)?.len();
    let sample_size = std::fs::metadata(sample)?.len();
    if reference_size != sample_size {
        return Err(FunctestError::assertion(format!(
            "YUVs are different sizes ({reference_size} vs {sample_size}), cannot compare"
        )));
    }
    let frame_size = geometry.frame_size();
    if frame_size == 0 {
        return Err(FunctestError::assertion("frame size is zero"));
    }
    let frames = reference_size / frame_size;
    debug!(frames, frame_size, "computing pixel deviation");

    let (luma, chroma) = geometry.plane_sizes();
    let plane_sizes = [luma, chroma, chroma].map(|size| size as usize);
    let wide = geometry.bit_depth > 8;
    let mut reference = BufReader::new(File::open(reference)?);
    let mut sample = BufReader::new(File::open(sample)?);
    let mut sums: [BTreeMap<i32, f64>; 3] = Default::default();
    let mut reference_plane = Vec::new();
    let mut sample_plane = Vec::new();

    for _ in 0..frames {
        for (plane, size) in plane_sizes.iter().enumerate() {
            reference_plane.resize(*size, 0);
            sample_plane.resize(*size, 0);
            reference.read_exact(&mut reference_plane)?;
            sample.read_exact(&mut sample_plane)?;
            for (level, percent) in plane_histogram(&reference_plane, &sample_plane, wide) {
                *sums[plane].entry(level).or_default() += percent;
            }
        }
    }

    Ok(sums.map(|levels| PlaneHistogram {
        levels: levels
            .into_iter()
            .map(|(level, percent)| (level, percent / frames as f64))
            .collect(),
    }))
}

/// Fail unless every non-empty plane has at least `threshold` percent of
/// samples within `±tolerance`. A negative tolerance is rejected.
pub fn check_tolerance(
    histograms: &[PlaneHistogram; 3],
    tolerance: i32,
    threshold: f64,
) -> Result<()> {
    let Ok(tolerance) = u32::try_from(tolerance) else {
        return Err(FunctestError::assertion(format!(
            "tolerance must not be negative, got {tolerance}"
        )));
    };
    for (name, plane) in ["Y", "U", "V"].iter().zip(histograms) {
        if plane.is_empty() {
            continue;
        }
        let good = plane.within(tolerance);
        if good < threshold {
            return Err(FunctestError::assertion(format!(
                "cannot regen, too many pixels out of threshold in {name}: target {threshold}% within +/- {tolerance}, actual {good}%"
            )));
        }
    }
    Ok(())
}
