//! Low-rank approximation by truncated singular value decomposition.
//!
//! In the time-space domain the section (or sliding windows of it) is
//! approximated directly. In the frequency-space domain each frequency slice
//! across channels is embedded in a Hankel matrix and reduced (Cadzow /
//! f-x singular spectrum analysis); a linear moveout event is rank one in
//! every slice.

use crate::data_container::Section;
use crate::error::{DasError, Result};
use crate::filters::filter::{Filter, FilterConfig, FilterDomain};
use crate::spectrum::TimeSpectrum;
use nalgebra::{ComplexField, DMatrix};
use ndarray::{s, Array1, Array2, ArrayViewMut1, Zip};
use num_complex::Complex64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Number of singular components kept.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankSelection {
    Fixed(usize),
    /// Smallest rank whose cumulative `σ²` reaches this fraction of the total.
    EnergyFraction(f64),
}

impl Default for RankSelection {
    fn default() -> Self {
        RankSelection::Fixed(1)
    }
}

impl RankSelection {
    fn validate(&self) -> Result<()> {
        match *self {
            RankSelection::Fixed(0) => Err(DasError::InvalidParameter {
                parameter: "rank",
                value: 0.0,
                constraint: "at least one component must be kept",
            }),
            RankSelection::EnergyFraction(f) if !(f > 0.0 && f <= 1.0) => {
                Err(DasError::InvalidParameter {
                    parameter: "energy_fraction",
                    value: f,
                    constraint: "must be in (0, 1]",
                })
            }
            _ => Ok(()),
        }
    }

    /// Rank for singular values sorted in descending order.
    pub fn rank(&self, singular_values: &[f64]) -> usize {
        let n = singular_values.len();
        match *self {
            RankSelection::Fixed(k) => k.min(n),
            RankSelection::EnergyFraction(fraction) => {
                let total: f64 = singular_values.iter().map(|s| s * s).sum();
                if total <= 0.0 {
                    return n;
                }
                let target = fraction * total * (1.0 - 1e-12);
                let mut cumulative = 0.0;
                for (i, s) in singular_values.iter().enumerate() {
                    cumulative += s * s;
                    if cumulative >= target {
                        return i + 1;
                    }
                }
                n
            }
        }
    }
}

/// Sliding window for the time-space decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SvdWindow {
    pub channels: usize,
    pub samples: usize,
    /// Fractional overlap of neighbouring windows along both axes.
    #[serde(default = "default_overlap")]
    pub overlap: f64,
}

fn default_overlap() -> f64 {
    0.5
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RankDomain {
    /// SVD of the whole matrix, or of overlapping windows averaged together.
    TimeSpace {
        #[serde(default)]
        window: Option<SvdWindow>,
    },
    /// Hankel rank reduction of every frequency slice inside `band` (Hz), all
    /// slices when no band is given.
    FrequencySpace {
        #[serde(default)]
        band: Option<(f64, f64)>,
    },
}

impl Default for RankDomain {
    fn default() -> Self {
        RankDomain::FrequencySpace { band: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RankReduction {
    pub selection: RankSelection,
    pub domain: RankDomain,
}

impl RankReduction {
    pub fn new(selection: RankSelection, domain: RankDomain) -> Self {
        RankReduction { selection, domain }
    }

    fn validate(&self) -> Result<()> {
        self.selection.validate()?;
        match self.domain {
            RankDomain::TimeSpace {
                window: Some(window),
            } => {
                if window.channels == 0 || window.samples == 0 {
                    return Err(DasError::InvalidParameter {
                        parameter: "window",
                        value: window.channels.min(window.samples) as f64,
                        constraint: "window dimensions must be positive",
                    });
                }
                if !(0.0..1.0).contains(&window.overlap) {
                    return Err(DasError::InvalidParameter {
                        parameter: "overlap",
                        value: window.overlap,
                        constraint: "must be in [0, 1)",
                    });
                }
            }
            RankDomain::FrequencySpace {
                band: Some((low, high)),
            } => {
                if !(low >= 0.0 && low < high) {
                    return Err(DasError::InvalidParameter {
                        parameter: "band",
                        value: low,
                        constraint: "band must satisfy 0 <= low < high",
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Largest rank any single decomposition of `section` can have.
    fn max_rank(&self, section: &Section) -> usize {
        let (n_channels, n_samples) = section.data().dim();
        match self.domain {
            RankDomain::TimeSpace { window: None } => n_channels.min(n_samples),
            RankDomain::TimeSpace {
                window: Some(window),
            } => window.channels.min(n_channels).min(window.samples.min(n_samples)),
            RankDomain::FrequencySpace { .. } => {
                let (rows, cols) = hankel_shape(n_channels);
                rows.min(cols)
            }
        }
    }
}

impl Filter for RankReduction {
    fn config(&self) -> FilterConfig {
        let domain = match self.domain {
            RankDomain::TimeSpace { .. } => "time-space",
            RankDomain::FrequencySpace { .. } => "frequency-space (Cadzow)",
        };
        FilterConfig {
            name: "Rank Reduction".to_string(),
            description: format!(
                "Truncated SVD in the {domain} domain keeping {:?} components.",
                self.selection
            ),
            hyperlink: Some((
                Some("Oropeza & Sacchi (2011)".to_string()),
                "https://doi.org/10.1190/1.3552706".to_string(),
            )),
            domain: FilterDomain::Decomposition,
        }
    }

    fn filter(&self, section: &mut Section) -> Result<()> {
        let start = Instant::now();
        self.validate()?;
        let max_rank = self.max_rank(section);
        if let RankSelection::Fixed(k) = self.selection {
            if k > max_rank {
                log::warn!("rank {k} clamped to the available rank {max_rank}");
            }
            if k >= max_rank {
                log::debug!("full rank requested, section left unchanged");
                return Ok(());
            }
        }

        let reduced = match self.domain {
            RankDomain::TimeSpace { window: None } => {
                low_rank(to_dmatrix(section.data()), self.selection).map(|m| from_dmatrix(&m))
            }
            RankDomain::TimeSpace {
                window: Some(window),
            } => Some(windowed(section.data(), window, self.selection)),
            RankDomain::FrequencySpace { band } => {
                cadzow(section.data(), section.sampling_rate(), band, self.selection)?
            }
        };
        if let Some(reduced) = reduced {
            section.replace_data(reduced)?;
        }
        log::debug!("rank reduction. This took {:?}", start.elapsed());
        Ok(())
    }
}

fn to_dmatrix(data: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(data.nrows(), data.ncols(), |i, j| data[[i, j]])
}

fn from_dmatrix(matrix: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((matrix.nrows(), matrix.ncols()), |(i, j)| matrix[(i, j)])
}

/// Truncated SVD reconstruction, `None` when the selection keeps every
/// component.
///
/// The reconstruction is checked against the energy of the discarded
/// singular values. For some exactly rank-deficient inputs the SVD returns
/// inconsistent singular vectors; the projection then comes from the
/// eigenvectors of the smaller Gram matrix instead.
fn low_rank<T>(matrix: DMatrix<T>, selection: RankSelection) -> Option<DMatrix<T>>
where
    T: ComplexField<RealField = f64> + Copy,
{
    let max_rank = matrix.nrows().min(matrix.ncols());
    let svd = matrix.clone().svd(true, true);
    let sigma = &svd.singular_values;

    let mut order: Vec<usize> = (0..sigma.len()).collect();
    order.sort_by(|&a, &b| sigma[b].total_cmp(&sigma[a]));
    let sorted: Vec<f64> = order.iter().map(|&i| sigma[i]).collect();
    let rank = selection.rank(&sorted);
    if rank >= max_rank {
        return None;
    }

    let reconstruction = match (&svd.u, &svd.v_t) {
        (Some(u), Some(v_t)) => {
            let mut out = DMatrix::<T>::zeros(u.nrows(), v_t.ncols());
            for &i in order.iter().take(rank) {
                out += (u.column(i) * T::from_real(sigma[i])) * v_t.row(i);
            }
            Some(out)
        }
        _ => {
            log::warn!("SVD returned no singular vectors, projecting on the Gram matrix eigenvectors");
            None
        }
    };
    let discarded: f64 = sorted[rank..].iter().map(|s| s * s).sum();
    let total = matrix.norm_squared();
    match reconstruction {
        Some(out) if ((&matrix - &out).norm_squared() - discarded).abs() <= 1e-8 * total => Some(out),
        Some(_) => {
            log::debug!("inconsistent SVD, projecting on the Gram matrix eigenvectors");
            Some(gram_projection(&matrix, rank))
        }
        None => Some(gram_projection(&matrix, rank)),
    }
}

/// Projection of `matrix` on its `rank` dominant singular subspace, computed
/// from the eigenvectors of `A·Aᴴ` or `Aᴴ·A`, whichever is smaller.
fn gram_projection<T>(matrix: &DMatrix<T>, rank: usize) -> DMatrix<T>
where
    T: ComplexField<RealField = f64> + Copy,
{
    let wide = matrix.nrows() <= matrix.ncols();
    let gram = if wide {
        matrix * matrix.adjoint()
    } else {
        matrix.adjoint() * matrix
    };
    let n = gram.nrows();
    let eigen = gram.symmetric_eigen();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let basis = DMatrix::from_fn(n, rank, |i, j| eigen.eigenvectors[(i, order[j])]);
    if wide {
        &basis * (basis.adjoint() * matrix)
    } else {
        (matrix * &basis) * basis.adjoint()
    }
}

/// Window start positions covering `n` with windows of `size` every `step`.
fn window_starts(n: usize, size: usize, step: usize) -> Vec<usize> {
    if size >= n {
        return vec![0];
    }
    let mut starts: Vec<usize> = (0..=n - size).step_by(step.max(1)).collect();
    if starts.last() != Some(&(n - size)) {
        starts.push(n - size);
    }
    starts
}

fn windowed(data: &Array2<f64>, window: SvdWindow, selection: RankSelection) -> Array2<f64> {
    let (n_channels, n_samples) = data.dim();
    let wc = window.channels.min(n_channels);
    let ws = window.samples.min(n_samples);
    let step = |size: usize| ((size as f64 * (1.0 - window.overlap)).round() as usize).max(1);
    let mut origins = Vec::new();
    for c in window_starts(n_channels, wc, step(wc)) {
        for t in window_starts(n_samples, ws, step(ws)) {
            origins.push((c, t));
        }
    }

    let patches: Vec<Array2<f64>> = origins
        .par_iter()
        .map(|&(c, t)| {
            let patch = data.slice(s![c..c + wc, t..t + ws]).to_owned();
            match low_rank(to_dmatrix(&patch), selection) {
                Some(reduced) => from_dmatrix(&reduced),
                None => patch,
            }
        })
        .collect();

    let mut sum = Array2::<f64>::zeros(data.dim());
    let mut weight = Array2::<f64>::zeros(data.dim());
    for (&(c, t), patch) in origins.iter().zip(patches.iter()) {
        let mut target = sum.slice_mut(s![c..c + wc, t..t + ws]);
        target += patch;
        weight.slice_mut(s![c..c + wc, t..t + ws]).mapv_inplace(|w| w + 1.0);
    }
    sum / weight
}

/// Hankel matrix shape for a slice of `n` channels.
fn hankel_shape(n: usize) -> (usize, usize) {
    let rows = n / 2 + 1;
    (rows, n + 1 - rows)
}

/// Rank-reduces one frequency slice in place, returns whether it changed.
fn cadzow_slice(mut slice: ArrayViewMut1<Complex64>, selection: RankSelection) -> bool {
    let n = slice.len();
    let (rows, cols) = hankel_shape(n);
    let hankel = DMatrix::from_fn(rows, cols, |i, j| slice[i + j]);
    let Some(reduced) = low_rank(hankel, selection) else {
        return false;
    };
    let mut sum = Array1::<Complex64>::zeros(n);
    let mut count = Array1::<f64>::zeros(n);
    for i in 0..rows {
        for j in 0..cols {
            sum[i + j] += reduced[(i, j)];
            count[i + j] += 1.0;
        }
    }
    Zip::from(&mut slice)
        .and(&sum)
        .and(&count)
        .for_each(|x, &s, &c| *x = s / c);
    true
}

fn cadzow(
    data: &Array2<f64>,
    sampling_rate: f64,
    band: Option<(f64, f64)>,
    selection: RankSelection,
) -> Result<Option<Array2<f64>>> {
    let mut spectrum = TimeSpectrum::forward(data, sampling_rate)?;
    let mut changed = Array1::from_elem(spectrum.frequencies.len(), false);
    Zip::from(spectrum.data.columns_mut())
        .and(&spectrum.frequencies)
        .and(&mut changed)
        .par_for_each(|column, &f, changed| {
            let in_band = band.map_or(true, |(low, high)| f >= low && f <= high);
            if in_band {
                *changed = cadzow_slice(column, selection);
            }
        });
    if !changed.iter().any(|c| *c) {
        return Ok(None);
    }
    Ok(Some(spectrum.inverse()?))
}
