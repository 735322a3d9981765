//! This module provides the `Filter` trait and related structures describing a
//! processing stage that transforms a [`Section`].
//!
//! Filters are plain values carrying their own parameters. They are composed
//! by holding them in a [`Pipeline`](crate::pipeline::Pipeline), either as
//! concrete types or as `Box<dyn Filter>`.

use crate::data_container::Section;
use crate::error::Result;
use std::fmt::Debug;

/// The `Filter` trait defines the structure and behavior of a section filter.
///
/// Filters must implement:
/// - A `config` function to provide metadata for the filter.
/// - A `filter` function that modifies a `Section` in place.
///
/// The value-returning `filtered` is provided and leaves the input untouched.
///
/// **Example**:
/// ```rust
/// use das_processing::data_container::Section;
/// use das_processing::error::Result;
/// use das_processing::filters::filter::{Filter, FilterConfig, FilterDomain};
///
/// #[derive(Clone, Debug)]
/// struct Gain(f64);
///
/// impl Filter for Gain {
///     fn config(&self) -> FilterConfig {
///         FilterConfig {
///             name: "Gain".to_string(),
///             description: "Multiplies every sample by a constant.".to_string(),
///             hyperlink: None,
///             domain: FilterDomain::Time,
///         }
///     }
///
///     fn filter(&self, section: &mut Section) -> Result<()> {
///         section.data_mut().mapv_inplace(|x| x * self.0);
///         Ok(())
///     }
/// }
/// ```
pub trait Filter: Send + Sync + Debug + CloneBoxedFilter {
    /// Returns the filter configuration, including name, description and domain.
    fn config(&self) -> FilterConfig;

    /// Applies the filter to the given `Section` in place.
    ///
    /// On error the section is left unchanged.
    fn filter(&self, section: &mut Section) -> Result<()>;

    /// Applies the filter to a copy of `section`.
    fn filtered(&self, section: &Section) -> Result<Section> {
        let mut output = section.clone();
        self.filter(&mut output)?;
        Ok(output)
    }
}

/// The `FilterDomain` enum specifies the domain a filter operates in.
///
/// # Variants
/// - `Time`: Filters that act on each channel's time series independently.
/// - `FrequencyWavenumber`: Filters applied to the 2-D FK spectrum.
/// - `Spatial`: Filters that combine channels sample by sample.
/// - `Decomposition`: Low-rank and wavefield decompositions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDomain {
    /// Filters that act on each channel's time series independently.
    Time,
    /// Filters applied to the 2-D frequency-wavenumber spectrum.
    FrequencyWavenumber,
    /// Filters that combine channels sample by sample.
    Spatial,
    /// Low-rank and wavefield decompositions.
    Decomposition,
}

/// A structure representing the configuration and metadata of a filter.
///
/// # Fields
/// - `name`: A human-readable name for the filter.
/// - `description`: A detailed description of what the filter does.
/// - `hyperlink`: Optional DOI or reference link with label.
/// - `domain`: The working domain, represented as a `FilterDomain`.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// The name of the filter, used for identification and in the processing history.
    pub name: String,
    /// A description of the filter, explaining its purpose and functionality.
    pub description: String,
    /// An optional hyperlink to a DOI or reference, with an optional label.
    pub hyperlink: Option<(Option<String>, String)>, // (optional_label, url)
    /// The domain in which the filter operates, represented by `FilterDomain`.
    pub domain: FilterDomain,
}

/// A trait to allow cloning of boxed filters.
/// This is necessary because `Box<dyn Filter>` cannot be cloned directly.
pub trait CloneBoxedFilter {
    fn clone_box(&self) -> Box<dyn Filter>;
}

impl<T> CloneBoxedFilter for T
where
    T: 'static + Filter + Clone,
{
    fn clone_box(&self) -> Box<dyn Filter> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn Filter> {
    fn clone(&self) -> Box<dyn Filter> {
        self.as_ref().clone_box()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::plane_wave_section;

    #[derive(Clone, Debug)]
    struct Gain(f64);

    impl Filter for Gain {
        fn config(&self) -> FilterConfig {
            FilterConfig {
                name: "Gain".to_string(),
                description: "Multiplies every sample by a constant.".to_string(),
                hyperlink: None,
                domain: FilterDomain::Time,
            }
        }

        fn filter(&self, section: &mut Section) -> Result<()> {
            section.data_mut().mapv_inplace(|x| x * self.0);
            Ok(())
        }
    }

    #[test]
    fn test_filtered_leaves_input_untouched() {
        let section = plane_wave_section(4, 100, 0.0, 1);
        let boxed: Box<dyn Filter> = Box::new(Gain(2.0));
        let cloned = boxed.clone();
        let output = cloned.filtered(&section).unwrap();
        assert_eq!(output.data(), &(section.data() * 2.0));
        assert_eq!(cloned.config().name, "Gain");
    }
}
