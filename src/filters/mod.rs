//! Processing filters for DAS sections.
//!
//! Every filter implements the `Filter` trait defined in the `filter` module
//! and works in place on a section. Filters are grouped by the domain they
//! operate in.
//!
//! # Filter Categories
//!
//! * **Time Domain Filters**: Zero-phase IIR and FIR band filters applied to
//!   each channel separately.
//!
//! * **Frequency-Wavenumber Filters**: Velocity fan and polygon masks applied
//!   to the 2-D spectrum.
//!
//! * **Denoising and Decomposition**: Common-mode removal, rank reduction and
//!   the separation of the coherent wavefield.

/// Core filter interfaces and shared components.
/// Defines the `Filter` trait and supporting structures used by all filter implementations.
pub mod filter;

/// Butterworth design in second-order sections and zero-phase IIR filtering.
pub mod iir;

/// Windowed-sinc FIR design and zero-phase FIR filtering.
pub mod fir;

/// Band filters in the time domain with IIR or FIR design.
pub mod time_domain;

/// Frequency-wavenumber filter with velocity fan and polygon masks.
pub mod fk;

/// Removes the signal shared by all channels.
pub mod common_mode;

/// Truncated SVD in the time-space or frequency-space domain.
pub mod rank_reduction;

/// Separates the coherent wavefield inside an apparent velocity fan from the rest.
pub mod wavefield;
