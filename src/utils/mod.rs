use crate::Float;

/// Useful enumerations for lepton flavors, final states and systematic variations.
pub mod enums;
/// A four-momentum type built from the detector-level `(pt, eta, phi, E)` representation.
pub mod vectors;

/// A helper method to get histogram edges from evenly-spaced `bins` over a given `range`
/// # See Also
/// [`Histogram`](crate::histograms::Histogram)
/// [`get_bin_index`]
pub fn get_bin_edges(bins: usize, range: (Float, Float)) -> Vec<Float> {
    let bin_width = (range.1 - range.0) / (bins as Float);
    (0..=bins)
        .map(|i| range.0 + (i as Float * bin_width))
        .collect()
}

/// A helper method to obtain the index of a bin where a value should go in a histogram with evenly
/// spaced `bins` over a given `range`
///
/// Bins are half-open, so a value equal to the upper limit is out of range.
///
/// # See Also
/// [`Histogram`](crate::histograms::Histogram)
/// [`get_bin_edges`]
pub fn get_bin_index(value: Float, bins: usize, limits: (Float, Float)) -> Option<usize> {
    if value >= limits.0 && value < limits.1 {
        let bin_width = (limits.1 - limits.0) / bins as Float;
        let bin_index = ((value - limits.0) / bin_width).floor() as usize;
        Some(bin_index.min(bins - 1))
    } else {
        None
    }
}
