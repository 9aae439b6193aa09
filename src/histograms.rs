use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use accurate::{sum::Klein, traits::*};
use auto_ops::*;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    utils::{get_bin_edges, get_bin_index},
    Float, HzzError, HzzResult, Variation,
};

/// Regularly spaced bins over `[low, high)`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Binning {
    /// Number of bins.
    pub bins: usize,
    /// Lower edge of the first bin.
    pub low: Float,
    /// Upper edge of the last bin (excluded).
    pub high: Float,
}

impl Default for Binning {
    /// 34 bins of 5 GeV between 80 and 250 GeV.
    fn default() -> Self {
        Self::new(34, 80.0, 250.0)
    }
}

impl Binning {
    /// Create a new [`Binning`].
    pub fn new(bins: usize, low: Float, high: Float) -> Self {
        Self { bins, low, high }
    }

    /// The `bins + 1` bin edges.
    pub fn edges(&self) -> Vec<Float> {
        get_bin_edges(self.bins, (self.low, self.high))
    }

    /// The bin containing `value`, if it is inside `[low, high)`.
    pub fn index(&self, value: Float) -> Option<usize> {
        get_bin_index(value, self.bins, (self.low, self.high))
    }
}

/// A weighted histogram with regular binning.
///
/// Alongside the sum of weights, every bin tracks the sum of squared weights so that the
/// statistical uncertainty of the bin content is $`\sqrt{\sum w^2}`$. Entries outside the
/// binning are accumulated in underflow and overflow sums; `NaN` values count as overflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// The binning of the histogram.
    pub binning: Binning,
    /// Sum of weights in each bin.
    pub sumw: Vec<Float>,
    /// Sum of squared weights in each bin.
    pub sumw2: Vec<Float>,
    /// Sum of weights below the first bin.
    pub underflow: Float,
    /// Sum of weights above the last bin.
    pub overflow: Float,
}

impl Histogram {
    /// Create an empty [`Histogram`].
    pub fn new(binning: Binning) -> Self {
        Self {
            binning,
            sumw: vec![0.0; binning.bins],
            sumw2: vec![0.0; binning.bins],
            underflow: 0.0,
            overflow: 0.0,
        }
    }

    /// Add `weight` at `value`.
    pub fn fill(&mut self, value: Float, weight: Float) {
        match self.binning.index(value) {
            Some(index) => {
                self.sumw[index] += weight;
                self.sumw2[index] += weight * weight;
            }
            None if value < self.binning.low => self.underflow += weight,
            None => self.overflow += weight,
        }
    }

    /// Fill every `(value, weight)` pair.
    pub fn fill_many<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (Float, Float)>,
    {
        for (value, weight) in entries {
            self.fill(value, weight);
        }
    }

    /// The bin contents.
    pub fn yields(&self) -> &[Float] {
        &self.sumw
    }

    /// The statistical uncertainty of each bin, $`\sqrt{\sum w^2}`$.
    pub fn stdev(&self) -> Vec<Float> {
        self.sumw2.iter().map(|s| s.sqrt()).collect()
    }

    /// The sum of all bin contents, excluding under- and overflow.
    pub fn integral(&self) -> Float {
        self.sumw
            .iter()
            .copied()
            .sum_with_accumulator::<Klein<Float>>()
    }

    /// The bin edges.
    pub fn edges(&self) -> Vec<Float> {
        self.binning.edges()
    }

    /// Add `other` into `self`, failing if the binnings differ.
    pub fn try_add_assign(&mut self, other: &Histogram) -> HzzResult<()> {
        if self.binning != other.binning {
            return Err(HzzError::BinningMismatch(format!(
                "{:?} and {:?}",
                self.binning, other.binning
            )));
        }
        for (a, b) in self.sumw.iter_mut().zip(&other.sumw) {
            *a += b;
        }
        for (a, b) in self.sumw2.iter_mut().zip(&other.sumw2) {
            *a += b;
        }
        self.underflow += other.underflow;
        self.overflow += other.overflow;
        Ok(())
    }

    /// The sum of two histograms, failing if the binnings differ.
    pub fn try_add(&self, other: &Histogram) -> HzzResult<Histogram> {
        let mut sum = self.clone();
        sum.try_add_assign(other)?;
        Ok(sum)
    }

    fn scaled(&self, factor: Float) -> Histogram {
        Histogram {
            binning: self.binning,
            sumw: self.sumw.iter().map(|w| w * factor).collect(),
            sumw2: self.sumw2.iter().map(|w2| w2 * factor * factor).collect(),
            underflow: self.underflow * factor,
            overflow: self.overflow * factor,
        }
    }

    fn add_or_panic(&self, other: &Histogram) -> Histogram {
        match self.try_add(other) {
            Ok(sum) => sum,
            Err(err) => panic!("{err}"),
        }
    }
}

// Operator forms panic on a binning mismatch, use `try_add` for fallible addition.
impl_op_ex!(+ |a: &Histogram, b: &Histogram| -> Histogram { a.add_or_panic(b) });
impl_op_ex!(+= |a: &mut Histogram, b: &Histogram| { *a = a.add_or_panic(b) });
impl_op_ex_commutative!(*|a: &Histogram, b: &Float| -> Histogram { a.scaled(*b) });

/// Histograms keyed by sample name and then by variation name, both in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSet {
    histograms: IndexMap<String, IndexMap<String, Histogram>>,
}

impl HistogramSet {
    /// Create an empty [`HistogramSet`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the set holds no histograms.
    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }

    /// Look up a histogram.
    pub fn get(&self, sample: &str, variation: Variation) -> Option<&Histogram> {
        self.get_by_name(sample, variation.name())
    }

    /// Look up a histogram by the variation's name.
    pub fn get_by_name(&self, sample: &str, variation: &str) -> Option<&Histogram> {
        self.histograms.get(sample)?.get(variation)
    }

    /// Look up a histogram, failing with [`HzzError::MissingHistogram`] if it was never filled.
    pub fn require(&self, sample: &str, variation: &str) -> HzzResult<&Histogram> {
        self.get_by_name(sample, variation)
            .ok_or_else(|| HzzError::MissingHistogram {
                sample: sample.to_string(),
                variation: variation.to_string(),
            })
    }

    /// A mutable histogram, inserted empty with `binning` if it does not exist yet.
    pub fn get_mut_or_insert(
        &mut self,
        sample: &str,
        variation: Variation,
        binning: Binning,
    ) -> &mut Histogram {
        self.histograms
            .entry(sample.to_string())
            .or_default()
            .entry(variation.name().to_string())
            .or_insert_with(|| Histogram::new(binning))
    }

    /// Insert or replace a histogram.
    pub fn insert(&mut self, sample: &str, variation: Variation, histogram: Histogram) {
        self.histograms
            .entry(sample.to_string())
            .or_default()
            .insert(variation.name().to_string(), histogram);
    }

    /// The sample names, in insertion order.
    pub fn samples(&self) -> impl Iterator<Item = &str> {
        self.histograms.keys().map(String::as_str)
    }

    /// The variation names filled for `sample`.
    pub fn variations(&self, sample: &str) -> Vec<&str> {
        self.histograms
            .get(sample)
            .map(|v| v.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Iterate over `(sample, variation, histogram)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &Histogram)> {
        self.histograms.iter().flat_map(|(sample, variations)| {
            variations
                .iter()
                .map(move |(variation, h)| (sample.as_str(), variation.as_str(), h))
        })
    }

    /// Add every histogram of `other` into `self`, inserting those not present yet.
    pub fn merge(&mut self, other: &HistogramSet) -> HzzResult<()> {
        for (sample, variation, histogram) in other.iter() {
            let variations = self.histograms.entry(sample.to_string()).or_default();
            match variations.get_mut(variation) {
                Some(existing) => existing.try_add_assign(histogram)?,
                None => {
                    variations.insert(variation.to_string(), histogram.clone());
                }
            }
        }
        Ok(())
    }

    /// Save the set to a file. The format follows the extension: `.pkl` writes a Python pickle,
    /// `.json` writes JSON, and anything else writes `bincode`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> HzzResult<()> {
        let path = expand(path.as_ref())?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(File::create(&path)?);
        match Format::of(&path) {
            Format::Pickle => {
                serde_pickle::to_writer(&mut writer, self, serde_pickle::SerOptions::new())?
            }
            Format::Json => serde_json::to_writer(&mut writer, self)?,
            Format::Bincode => bincode::serialize_into(&mut writer, self)?,
        }
        debug!(path = %path.display(), "saved histograms");
        Ok(())
    }

    /// Load a set written by [`HistogramSet::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> HzzResult<Self> {
        let path = expand(path.as_ref())?;
        let reader = BufReader::new(File::open(&path)?);
        let set = match Format::of(&path) {
            Format::Pickle => serde_pickle::from_reader(reader, serde_pickle::DeOptions::new())?,
            Format::Json => serde_json::from_reader(reader)?,
            Format::Bincode => bincode::deserialize_from(reader)?,
        };
        debug!(path = %path.display(), "loaded histograms");
        Ok(set)
    }
}

enum Format {
    Pickle,
    Json,
    Bincode,
}

impl Format {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("pkl") | Some("pickle") => Format::Pickle,
            Some("json") => Format::Json,
            _ => Format::Bincode,
        }
    }
}

fn expand(path: &Path) -> HzzResult<PathBuf> {
    Ok(PathBuf::from(&*shellexpand::full(&path.to_string_lossy())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fill_and_flow() {
        let mut h = Histogram::new(Binning::default());
        h.fill(80.0, 1.0);
        h.fill(84.9, 2.0);
        h.fill(125.0, 0.5);
        h.fill(250.0, 3.0);
        h.fill(79.9, 4.0);
        h.fill(Float::NAN, 5.0);
        assert_eq!(h.sumw.len(), 34);
        assert_relative_eq!(h.sumw[0], 3.0);
        assert_relative_eq!(h.sumw2[0], 5.0);
        assert_relative_eq!(h.sumw[9], 0.5);
        assert_relative_eq!(h.integral(), 3.5);
        assert_relative_eq!(h.underflow, 4.0);
        assert_relative_eq!(h.overflow, 8.0);
        assert_relative_eq!(h.stdev()[0], 5.0f64.sqrt());
    }

    #[test]
    fn test_addition_and_scaling() {
        let binning = Binning::new(2, 0.0, 2.0);
        let mut a = Histogram::new(binning);
        a.fill_many([(0.5, 1.0), (1.5, 2.0)]);
        let mut b = Histogram::new(binning);
        b.fill(0.5, 3.0);
        let sum = &a + &b;
        assert_eq!(sum.sumw, vec![4.0, 2.0]);
        assert_eq!(sum.sumw2, vec![10.0, 4.0]);
        let scaled = &a * 2.0;
        assert_eq!(scaled.sumw, vec![2.0, 4.0]);
        assert_eq!(scaled.sumw2, vec![4.0, 16.0]);
        a += &b;
        assert_eq!(a, sum);

        let other = Histogram::new(Binning::new(3, 0.0, 2.0));
        assert!(matches!(
            a.try_add(&other),
            Err(HzzError::BinningMismatch(_))
        ));
    }

    fn example_set() -> HistogramSet {
        let binning = Binning::default();
        let mut set = HistogramSet::new();
        set.get_mut_or_insert("Signal", Variation::Nominal, binning)
            .fill(125.0, 0.1);
        set.get_mut_or_insert("Signal", Variation::M4lUp, binning)
            .fill(126.25, 0.1);
        set.get_mut_or_insert("Data", Variation::Nominal, binning)
            .fill(124.0, 1.0);
        set
    }

    #[test]
    fn test_merge() {
        let mut a = example_set();
        let mut b = HistogramSet::new();
        b.get_mut_or_insert("Background ZZ", Variation::Nominal, Binning::default())
            .fill(91.0, 2.0);
        b.merge(&example_set()).unwrap();
        a.merge(&example_set()).unwrap();
        assert_relative_eq!(
            a.get("Signal", Variation::Nominal).unwrap().integral(),
            0.2
        );
        assert_eq!(a.samples().collect::<Vec<_>>(), ["Signal", "Data"]);
        assert_eq!(a.variations("Signal"), ["nominal", "m4lUP"]);
        assert_eq!(b.samples().count(), 3);
        assert!(a.require("Data", "m4lUP").is_err());
    }

    #[test]
    fn test_save_and_load_formats() {
        let dir = tempfile::tempdir().unwrap();
        let set = example_set();
        for name in ["histograms.bin", "histograms.pkl", "histograms.json"] {
            let path = dir.path().join(name);
            set.save(&path).unwrap();
            let loaded = HistogramSet::load(&path).unwrap();
            assert_eq!(loaded, set);
        }
    }
}
