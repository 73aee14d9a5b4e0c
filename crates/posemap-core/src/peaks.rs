//! Peak extraction from batched confidence maps.
//!
//! Each channel's peak is recovered through two axis reductions: a
//! column-wise max over the image height and a row-wise max over the image
//! width. `x` is the arg-max of the column maxima, `y` the arg-max of the
//! row maxima and `value` the channel maximum. Ties resolve to the lowest
//! index of each reduction, so an all-constant map reports (0, 0).

use ndarray::{Array2, Array3, ArrayView4};

use crate::error::{Error, Result};

/// Memory layout of a batched map stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapLayout {
    /// (N, H, W, C)
    ChannelsLast,
    /// (N, C, H, W)
    ChannelsFirst,
}

impl std::str::FromStr for MapLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "channels_last" => Ok(Self::ChannelsLast),
            "channels_first" => Ok(Self::ChannelsFirst),
            other => Err(Error::Config(format!(
                "unknown map layout '{other}' (expected channels_last or channels_first)"
            ))),
        }
    }
}

/// One extracted peak; `x` is the column index, `y` the row index.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Peak {
    pub x: usize,
    pub y: usize,
    pub value: f32,
}

/// Extract per-channel peaks from a batch of maps. The outer Vec runs
/// over samples, the inner over channels in map order.
pub fn find_peaks(maps: ArrayView4<'_, f32>, layout: MapLayout) -> Result<Vec<Vec<Peak>>> {
    match layout {
        MapLayout::ChannelsLast => find_peaks_canonical(maps),
        MapLayout::ChannelsFirst => find_peaks_canonical(maps.permuted_axes([0, 2, 3, 1])),
    }
}

fn find_peaks_canonical(maps: ArrayView4<'_, f32>) -> Result<Vec<Vec<Peak>>> {
    let (n, h, w, c) = maps.dim();
    if n > 0 && c > 0 && (h == 0 || w == 0) {
        return Err(Error::Shape(format!(
            "find_peaks: maps must have non-empty height and width, got {h}x{w}"
        )));
    }
    let mut out = Vec::with_capacity(n);
    for s in 0..n {
        let mut peaks = Vec::with_capacity(c);
        for ch in 0..c {
            let mut col_max = vec![f32::NEG_INFINITY; w];
            let mut row_max = vec![f32::NEG_INFINITY; h];
            for i in 0..h {
                for j in 0..w {
                    let v = maps[[s, i, j, ch]];
                    if v > col_max[j] {
                        col_max[j] = v;
                    }
                    if v > row_max[i] {
                        row_max[i] = v;
                    }
                }
            }
            let x = argmax_first(&col_max);
            let y = argmax_first(&row_max);
            peaks.push(Peak {
                x,
                y,
                value: col_max[x],
            });
        }
        out.push(peaks);
    }
    Ok(out)
}

/// Index of the maximum value, first occurrence on ties.
#[inline]
fn argmax_first(vals: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in vals.iter().enumerate().skip(1) {
        if v > vals[best] {
            best = i;
        }
    }
    best
}

/// Split peak records into an integer position array (N, 2, C) with
/// [x, y] rows and a confidence array (N, C).
pub fn peaks_to_arrays(peaks: &[Vec<Peak>]) -> Result<(Array3<i64>, Array2<f32>)> {
    let n = peaks.len();
    let c = peaks.first().map_or(0, Vec::len);
    if peaks.iter().any(|row| row.len() != c) {
        return Err(Error::Shape(
            "peaks_to_arrays: samples differ in channel count".into(),
        ));
    }
    let mut positions = Array3::zeros((n, 2, c));
    let mut confidences = Array2::zeros((n, c));
    for (s, row) in peaks.iter().enumerate() {
        for (ch, p) in row.iter().enumerate() {
            positions[[s, 0, ch]] = p.x as i64;
            positions[[s, 1, ch]] = p.y as i64;
            confidences[[s, ch]] = p.value;
        }
    }
    Ok((positions, confidences))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_known_peak_position() {
        let mut maps = Array4::zeros((1, 64, 64, 1));
        maps[[0, 10, 40, 0]] = 1.0;
        let peaks = find_peaks(maps.view(), MapLayout::ChannelsLast).unwrap();
        assert_eq!(
            peaks[0][0],
            Peak {
                x: 40,
                y: 10,
                value: 1.0
            },
            "peak at row 10, col 40 must report x=40, y=10"
        );
    }

    #[test]
    fn test_constant_map_reports_origin() {
        let maps = Array4::from_elem((1, 8, 8, 2), 0.25);
        let peaks = find_peaks(maps.view(), MapLayout::ChannelsLast).unwrap();
        for p in &peaks[0] {
            assert_eq!((p.x, p.y), (0, 0), "constant map must report the origin");
            assert_eq!(p.value, 0.25, "the constant value is still echoed");
        }
    }

    #[test]
    fn test_tie_breaks_to_lowest_reduction_index() {
        // Equal maxima at (row 0, col 5) and (row 3, col 2). The column
        // reduction sees the max first at col 2, the row reduction at
        // row 0, so the reported peak is (x=2, y=0).
        let mut maps = Array4::zeros((1, 6, 8, 1));
        maps[[0, 0, 5, 0]] = 1.0;
        maps[[0, 3, 2, 0]] = 1.0;
        let peaks = find_peaks(maps.view(), MapLayout::ChannelsLast).unwrap();
        assert_eq!(peaks[0][0].x, 2);
        assert_eq!(peaks[0][0].y, 0);
        assert_eq!(peaks[0][0].value, 1.0);
    }

    #[test]
    fn test_channels_first_matches_channels_last() {
        let last = Array4::from_shape_fn((2, 5, 7, 3), |(s, i, j, c)| {
            ((s * 31 + i * 17 + j * 7 + c * 3) % 23) as f32
        });
        let first = Array4::from_shape_fn((2, 3, 5, 7), |(s, c, i, j)| last[[s, i, j, c]]);

        let from_last = find_peaks(last.view(), MapLayout::ChannelsLast).unwrap();
        let from_first = find_peaks(first.view(), MapLayout::ChannelsFirst).unwrap();
        assert_eq!(from_last, from_first, "layouts must agree channel for channel");
    }

    #[test]
    fn test_peaks_are_per_sample_and_per_channel() {
        let mut maps = Array4::zeros((2, 12, 12, 2));
        maps[[0, 1, 2, 0]] = 0.9;
        maps[[0, 3, 4, 1]] = 0.8;
        maps[[1, 5, 6, 0]] = 0.7;
        maps[[1, 7, 8, 1]] = 0.6;
        let peaks = find_peaks(maps.view(), MapLayout::ChannelsLast).unwrap();
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0].len(), 2);
        assert_eq!((peaks[0][0].x, peaks[0][0].y), (2, 1));
        assert_eq!((peaks[0][1].x, peaks[0][1].y), (4, 3));
        assert_eq!((peaks[1][0].x, peaks[1][0].y), (6, 5));
        assert_eq!((peaks[1][1].x, peaks[1][1].y), (8, 7));
    }

    #[test]
    fn test_empty_plane_is_rejected() {
        let maps = Array4::<f32>::zeros((1, 0, 4, 1));
        assert!(find_peaks(maps.view(), MapLayout::ChannelsLast).is_err());
    }

    #[test]
    fn test_layout_parse() {
        use std::str::FromStr;
        assert_eq!(
            MapLayout::from_str("channels_last").unwrap(),
            MapLayout::ChannelsLast
        );
        assert_eq!(
            MapLayout::from_str("channels_first").unwrap(),
            MapLayout::ChannelsFirst
        );
        assert!(MapLayout::from_str("nhwc").is_err());
    }

    #[test]
    fn test_peaks_to_arrays_layout() {
        let peaks = vec![
            vec![
                Peak {
                    x: 3,
                    y: 4,
                    value: 0.5,
                },
                Peak {
                    x: 1,
                    y: 2,
                    value: 0.25,
                },
            ],
            vec![
                Peak {
                    x: 7,
                    y: 0,
                    value: 1.0,
                },
                Peak {
                    x: 6,
                    y: 5,
                    value: 0.75,
                },
            ],
        ];
        let (pos, conf) = peaks_to_arrays(&peaks).unwrap();
        assert_eq!(pos.dim(), (2, 2, 2));
        assert_eq!(conf.dim(), (2, 2));
        assert_eq!(pos[[0, 0, 0]], 3, "x of sample 0 channel 0");
        assert_eq!(pos[[0, 1, 0]], 4, "y of sample 0 channel 0");
        assert_eq!(pos[[1, 0, 1]], 6);
        assert_eq!(pos[[1, 1, 1]], 5);
        assert_eq!(conf[[0, 1]], 0.25);
        assert_eq!(conf[[1, 0]], 1.0);

        let ragged = vec![vec![], vec![Peak { x: 0, y: 0, value: 0.0 }]];
        assert!(peaks_to_arrays(&ragged).is_err());
    }
}
