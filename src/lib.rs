//! Processing and wavefield analysis of Distributed Acoustic Sensing (DAS)
//! sections.
//!
//! A [`Section`](data_container::Section) holds a `channels × samples` strain
//! rate matrix with its acquisition metadata. The [`filters`] change it in
//! place, [`attributes`] estimate apparent velocity and channel quality from
//! it, [`conversion`] turns strain rate into particle velocity and
//! [`pipeline`] chains all of these.

pub mod attributes;
pub mod conversion;
pub mod data_container;
pub mod error;
pub mod filters;
pub mod math_tools;
pub mod pipeline;
pub mod spectrum;

#[cfg(test)]
mod test_utils;
