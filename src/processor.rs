//! Turning delivered events into histograms.

#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    delivery::Delivered,
    histograms::{Binning, Histogram, HistogramSet},
    selection::{four_lepton_mass, lepton_filter, CutStage, Cutflow},
    weights::{cross_section_weight, event_weight},
    Float, HzzResult, Variation,
};

/// The accumulated output of processing one or more delivered chunks.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorOutput {
    /// Filled histograms keyed by sample and variation.
    pub histograms: HistogramSet,
    /// Selection counts keyed by sample.
    pub cutflow: Cutflow,
}

impl ProcessorOutput {
    /// Add `other` into `self`.
    pub fn merge(&mut self, other: &ProcessorOutput) -> HzzResult<()> {
        self.histograms.merge(&other.histograms)?;
        self.cutflow.merge(&other.cutflow);
        Ok(())
    }
}

/// Something which turns one delivered chunk into a [`ProcessorOutput`].
pub trait Processor: Sync {
    /// Process the events of one chunk.
    fn process(&self, chunk: &Delivered) -> HzzResult<ProcessorOutput>;
}

/// Fills the four-lepton mass with every [`Variation`].
///
/// Collision data fills only the nominal histogram with unit weights. Simulated events are
/// weighted by [`event_weight`] and fill all five variations: the scale-factor variations
/// rescale the weight, and the mass variations rescale the four-lepton mass.
#[derive(Clone, Debug)]
pub struct HzzProcessor {
    /// Binning of the four-lepton mass (GeV).
    pub binning: Binning,
    /// Integrated luminosity in inverse femtobarns.
    pub luminosity: Float,
}

impl HzzProcessor {
    /// Create a new [`HzzProcessor`].
    pub fn new(binning: Binning, luminosity: Float) -> Self {
        Self {
            binning,
            luminosity,
        }
    }
}

impl Processor for HzzProcessor {
    fn process(&self, chunk: &Delivered) -> HzzResult<ProcessorOutput> {
        let metadata = &chunk.metadata;
        let sample = metadata.sample.as_str();
        let xsec_weight = cross_section_weight(metadata, self.luminosity)?;
        let variations: &[Variation] = if metadata.is_data {
            &[Variation::Nominal]
        } else {
            &Variation::ALL
        };
        let mut histograms: Vec<Histogram> =
            variations.iter().map(|_| Histogram::new(self.binning)).collect();
        let mut output = ProcessorOutput::default();
        let cutflow = output.cutflow.sample_mut(sample);
        for event in &chunk.dataset {
            let weight = if metadata.is_data {
                1.0
            } else {
                event_weight(event, xsec_weight)
            };
            cutflow.record(CutStage::Delivered, weight);
            if !lepton_filter(event) {
                continue;
            }
            cutflow.record(CutStage::LeptonFilter, weight);
            let mass = four_lepton_mass(event);
            if self.binning.index(mass).is_some() {
                cutflow.record(CutStage::InRange, weight);
            }
            for (histogram, variation) in histograms.iter_mut().zip(variations) {
                histogram.fill(
                    mass * variation.mass_factor(),
                    weight * variation.weight_factor(),
                );
            }
        }
        for (histogram, &variation) in histograms.into_iter().zip(variations) {
            output.histograms.insert(sample, variation, histogram);
        }
        debug!(
            sample,
            path = %metadata.path,
            xsec_weight,
            n_events = chunk.dataset.len(),
            "processed chunk"
        );
        Ok(output)
    }
}

/// Process every chunk with `processor` and merge the outputs in chunk order.
#[cfg(feature = "rayon")]
pub fn run<P: Processor>(processor: &P, chunks: &[Delivered]) -> HzzResult<ProcessorOutput> {
    info!(n_chunks = chunks.len(), "processing");
    let outputs: Vec<ProcessorOutput> = chunks
        .par_iter()
        .map(|chunk| processor.process(chunk))
        .collect::<HzzResult<_>>()?;
    merge_outputs(outputs)
}

/// Process every chunk with `processor` and merge the outputs in chunk order.
#[cfg(not(feature = "rayon"))]
pub fn run<P: Processor>(processor: &P, chunks: &[Delivered]) -> HzzResult<ProcessorOutput> {
    info!(n_chunks = chunks.len(), "processing");
    let outputs: Vec<ProcessorOutput> = chunks
        .iter()
        .map(|chunk| processor.process(chunk))
        .collect::<HzzResult<_>>()?;
    merge_outputs(outputs)
}

fn merge_outputs(outputs: Vec<ProcessorOutput>) -> HzzResult<ProcessorOutput> {
    outputs
        .iter()
        .try_fold(ProcessorOutput::default(), |mut acc, output| {
            acc.merge(output)?;
            Ok(acc)
        })
}
