//! Local delivery of events from a fileset.
//!
//! Every file is read independently with only the lepton and weight columns projected, the
//! event-level [`Query`] predicate is applied while reading, and the surviving events are
//! handed to processing together with the metadata needed to normalize them.

#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    data::{
        io::{read_parquet, DatasetIoOptions},
        Dataset, Event,
    },
    Float, HzzError, HzzResult,
};

/// Metadata attached to one file of the fileset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// The sample the file belongs to.
    pub sample: String,
    /// The (expanded) path of the file.
    pub path: String,
    /// Whether the file holds collision data.
    pub is_data: bool,
    /// Production cross section in picobarns.
    pub cross_section: Float,
    /// Sum of generator weights before any selection.
    pub sum_of_weights: Float,
    /// Generator filter efficiency.
    pub filter_efficiency: Float,
}

impl FileMetadata {
    /// Metadata for a collision-data file.
    pub fn data<S: Into<String>, P: Into<String>>(sample: S, path: P) -> Self {
        Self {
            sample: sample.into(),
            path: path.into(),
            is_data: true,
            cross_section: 0.0,
            sum_of_weights: 0.0,
            filter_efficiency: 1.0,
        }
    }

    /// Metadata for a simulated file.
    pub fn simulation<S: Into<String>, P: Into<String>>(
        sample: S,
        path: P,
        cross_section: Float,
        sum_of_weights: Float,
        filter_efficiency: Float,
    ) -> Self {
        Self {
            sample: sample.into(),
            path: path.into(),
            is_data: false,
            cross_section,
            sum_of_weights,
            filter_efficiency,
        }
    }
}

/// The event-level request made of every file: events with exactly `n_leptons` leptons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// The required number of leptons.
    pub n_leptons: usize,
}

impl Default for Query {
    fn default() -> Self {
        Self { n_leptons: 4 }
    }
}

impl Query {
    /// Create a query requiring exactly `n_leptons` leptons.
    pub fn new(n_leptons: usize) -> Self {
        Self { n_leptons }
    }

    /// Whether an event passes the query.
    pub fn accepts(&self, event: &Event) -> bool {
        event.n_leptons() == self.n_leptons
    }
}

/// The events delivered from one file.
#[derive(Clone, Debug)]
pub struct Delivered {
    /// The file the events came from.
    pub metadata: FileMetadata,
    /// The events which passed the query.
    pub dataset: Dataset,
    /// The number of events read before the query was applied.
    pub n_read: usize,
}

/// Deliver a single file.
pub fn deliver_file(
    metadata: &FileMetadata,
    query: &Query,
    options: &DatasetIoOptions,
) -> HzzResult<Delivered> {
    let read = read_parquet(&metadata.path, options).map_err(|err| HzzError::DeliveryError {
        path: metadata.path.clone(),
        source: Box::new(err),
    })?;
    let n_read = read.len();
    let dataset = read.filter(|event| query.accepts(event));
    debug!(
        sample = %metadata.sample,
        path = %metadata.path,
        n_read,
        n_delivered = dataset.len(),
        "delivered file"
    );
    Ok(Delivered {
        metadata: metadata.clone(),
        dataset,
        n_read,
    })
}

/// Deliver every file of a fileset, one job per file.
///
/// The result is in fileset order regardless of scheduling. The first file which fails aborts
/// the delivery with an error naming it.
#[cfg(feature = "rayon")]
pub fn deliver(
    files: &[FileMetadata],
    query: &Query,
    options: &DatasetIoOptions,
) -> HzzResult<Vec<Delivered>> {
    info!(n_files = files.len(), n_leptons = query.n_leptons, "delivering fileset");
    files
        .par_iter()
        .map(|file| deliver_file(file, query, options))
        .collect()
}

/// Deliver every file of a fileset, one job per file.
///
/// The result is in fileset order. The first file which fails aborts the delivery with an
/// error naming it.
#[cfg(not(feature = "rayon"))]
pub fn deliver(
    files: &[FileMetadata],
    query: &Query,
    options: &DatasetIoOptions,
) -> HzzResult<Vec<Delivered>> {
    info!(n_files = files.len(), n_leptons = query.n_leptons, "delivering fileset");
    files
        .iter()
        .map(|file| deliver_file(file, query, options))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{io::write_parquet, test_event},
        histograms::Binning,
        processor::{HzzProcessor, Processor},
    };

    #[test]
    fn test_query_filters_lepton_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mc.parquet");
        let path = path.to_str().unwrap().to_string();
        let mut three = test_event();
        three.leptons.pop();
        let dataset = Dataset::new(vec![test_event(), three, test_event()]);
        write_parquet(&dataset, &path, &DatasetIoOptions::default()).unwrap();

        let files = vec![
            FileMetadata::simulation("Signal", path.clone(), 1.0, 100.0, 1.0),
            FileMetadata::data("Data", path),
        ];
        let delivered = deliver(&files, &Query::default(), &DatasetIoOptions::default()).unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].metadata.sample, "Signal");
        assert_eq!(delivered[1].metadata.sample, "Data");
        for chunk in &delivered {
            assert_eq!(chunk.n_read, 3);
            assert_eq!(chunk.dataset.len(), 2);
        }
    }

    #[test]
    fn test_empty_file_delivers_an_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.parquet");
        let path = path.to_str().unwrap().to_string();
        write_parquet(&Dataset::default(), &path, &DatasetIoOptions::default()).unwrap();

        let files = vec![FileMetadata::simulation("Signal", path, 1.0, 100.0, 1.0)];
        let delivered = deliver(&files, &Query::default(), &DatasetIoOptions::default()).unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].n_read, 0);
        assert!(delivered[0].dataset.is_empty());

        let processor = HzzProcessor::new(Binning::default(), 10.0);
        let output = processor.process(&delivered[0]).unwrap();
        assert_eq!(output.histograms.variations("Signal").len(), 5);
        for (_, _, histogram) in output.histograms.iter() {
            assert_eq!(histogram.integral(), 0.0);
        }
        assert_eq!(output.cutflow.get("Signal").unwrap().delivered.events, 0);
    }

    #[test]
    fn test_missing_file_names_the_path() {
        let files = vec![FileMetadata::data("Data", "/nonexistent/data_A.parquet")];
        let err = deliver(&files, &Query::default(), &DatasetIoOptions::default()).unwrap_err();
        match err {
            HzzError::DeliveryError { path, .. } => {
                assert_eq!(path, "/nonexistent/data_A.parquet")
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
