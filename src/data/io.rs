//! Dataset I/O: reading the delivered lepton columns from Parquet and writing them back.

use super::*;
use crate::{HzzError, HzzResult};
use arrow::{
    array::{Array, ArrayRef, AsArray, Float64Array, Int32Array, ListArray},
    compute::cast,
    datatypes::{DataType, Float64Type, Int32Type},
    record_batch::RecordBatch,
};
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter, ProjectionMask};
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;

/// Number of leptons per event.
pub const LEP_N: &str = "lep_n";
/// Lepton transverse momenta.
pub const LEP_PT: &str = "lep_pt";
/// Lepton pseudorapidities.
pub const LEP_ETA: &str = "lep_eta";
/// Lepton azimuthal angles.
pub const LEP_PHI: &str = "lep_phi";
/// Lepton energies.
pub const LEP_E: &str = "lep_E";
/// Lepton charges.
pub const LEP_CHARGE: &str = "lep_charge";
/// Lepton PDG type ids.
pub const LEP_TYPEID: &str = "lep_typeid";
/// Generator weight.
pub const MC_WEIGHT: &str = "mcWeight";
/// Pile-up scale factor.
pub const SF_PILEUP: &str = "scaleFactor_PILEUP";
/// Electron scale factor.
pub const SF_ELE: &str = "scaleFactor_ELE";
/// Muon scale factor.
pub const SF_MUON: &str = "scaleFactor_MUON";
/// Lepton trigger scale factor.
pub const SF_LEP_TRIGGER: &str = "scaleFactor_LepTRIGGER";

/// Per-lepton list columns which every input file must provide.
pub const LEPTON_COLUMNS: [&str; 6] = [LEP_PT, LEP_ETA, LEP_PHI, LEP_E, LEP_CHARGE, LEP_TYPEID];
/// Per-event weight columns, absent from collision data.
pub const WEIGHT_COLUMNS: [&str; 5] = [MC_WEIGHT, SF_PILEUP, SF_ELE, SF_MUON, SF_LEP_TRIGGER];

/// Options which control how columns are interpreted when reading and writing.
#[derive(Clone, Debug)]
pub struct DatasetIoOptions {
    /// Factor converting stored momenta and energies to GeV (stored values are multiplied by
    /// this factor when read and divided by it when written). Defaults to `1e-3` (MeV).
    pub momentum_scale: Float,
}

impl Default for DatasetIoOptions {
    fn default() -> Self {
        Self {
            momentum_scale: 1e-3,
        }
    }
}

impl DatasetIoOptions {
    /// Set the factor converting stored momenta to GeV.
    pub fn with_momentum_scale(mut self, momentum_scale: Float) -> Self {
        self.momentum_scale = momentum_scale;
        self
    }
}

fn canonicalize_dataset_path(file_path: &str) -> HzzResult<PathBuf> {
    Ok(Path::new(&*shellexpand::full(file_path)?).canonicalize()?)
}

fn expand_output_path(file_path: &str) -> HzzResult<PathBuf> {
    Ok(PathBuf::from(&*shellexpand::full(file_path)?))
}

/// Load a [`Dataset`] from a Parquet file.
///
/// Only the lepton and weight columns are read. Missing weight columns are treated as unit
/// weights, while missing lepton columns are an error.
pub fn read_parquet(file_path: &str, options: &DatasetIoOptions) -> HzzResult<Dataset> {
    let path = canonicalize_dataset_path(file_path)?;
    let file = File::open(&path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = builder.schema().clone();
    for column in LEPTON_COLUMNS {
        if schema.column_with_name(column).is_none() {
            return Err(HzzError::MissingColumn {
                column: column.to_string(),
                path: file_path.to_string(),
            });
        }
    }
    let roots: Vec<usize> = schema
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, f)| {
            let name = f.name().as_str();
            name == LEP_N || LEPTON_COLUMNS.contains(&name) || WEIGHT_COLUMNS.contains(&name)
        })
        .map(|(i, _)| i)
        .collect();
    let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
    let total_rows = builder.metadata().file_metadata().num_rows() as usize;
    let reader = builder.with_projection(mask).build()?;
    let mut events = Vec::with_capacity(total_rows);
    for batch in reader {
        append_record_batch(&batch?, options, file_path, &mut events)?;
    }
    debug!(path = %path.display(), n_events = events.len(), "read parquet file");
    Ok(Dataset::new(events))
}

fn missing(column: &str, file_path: &str) -> HzzError {
    HzzError::MissingColumn {
        column: column.to_string(),
        path: file_path.to_string(),
    }
}

/// A list column flattened into its offsets and (cast) child values.
struct ListColumn<T> {
    offsets: Vec<usize>,
    values: Vec<T>,
}

impl<T: Copy> ListColumn<T> {
    fn row(&self, row: usize) -> &[T] {
        &self.values[self.offsets[row]..self.offsets[row + 1]]
    }
    fn row_len(&self, row: usize) -> usize {
        self.offsets[row + 1] - self.offsets[row]
    }
}

/// Null slots have no sensible default for a kinematic or weight column.
fn reject_nulls(array: &dyn Array, name: &str, file_path: &str) -> HzzResult<()> {
    if array.null_count() > 0 {
        return Err(HzzError::Custom(format!(
            "Column \"{name}\" in \"{file_path}\" contains {} null values",
            array.null_count()
        )));
    }
    Ok(())
}

fn list_offsets(list: &ListArray) -> Vec<usize> {
    list.value_offsets().iter().map(|&o| o as usize).collect()
}

fn prepare_float_list(
    batch: &RecordBatch,
    name: &str,
    file_path: &str,
) -> HzzResult<ListColumn<Float>> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| missing(name, file_path))?;
    let list = column.as_list_opt::<i32>().ok_or_else(|| {
        HzzError::Custom(format!(
            "Column \"{name}\" in \"{file_path}\" must be a list of floats, found {}",
            column.data_type()
        ))
    })?;
    reject_nulls(list, name, file_path)?;
    reject_nulls(list.values(), name, file_path)?;
    let values = cast(list.values(), &DataType::Float64)?;
    Ok(ListColumn {
        offsets: list_offsets(list),
        values: values.as_primitive::<Float64Type>().values().to_vec(),
    })
}

fn prepare_int_list(batch: &RecordBatch, name: &str, file_path: &str) -> HzzResult<ListColumn<i32>> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| missing(name, file_path))?;
    let list = column.as_list_opt::<i32>().ok_or_else(|| {
        HzzError::Custom(format!(
            "Column \"{name}\" in \"{file_path}\" must be a list of integers, found {}",
            column.data_type()
        ))
    })?;
    reject_nulls(list, name, file_path)?;
    reject_nulls(list.values(), name, file_path)?;
    let values = cast(list.values(), &DataType::Int32)?;
    Ok(ListColumn {
        offsets: list_offsets(list),
        values: values.as_primitive::<Int32Type>().values().to_vec(),
    })
}

fn prepare_optional_scalar(
    batch: &RecordBatch,
    name: &str,
    file_path: &str,
) -> HzzResult<Option<Vec<Float>>> {
    match batch.column_by_name(name) {
        Some(column) => {
            reject_nulls(column, name, file_path)?;
            let values = cast(column, &DataType::Float64)?;
            Ok(Some(values.as_primitive::<Float64Type>().values().to_vec()))
        }
        None => Ok(None),
    }
}

fn append_record_batch(
    batch: &RecordBatch,
    options: &DatasetIoOptions,
    file_path: &str,
    events_out: &mut Vec<Event>,
) -> HzzResult<()> {
    let n_rows = batch.num_rows();
    let pt = prepare_float_list(batch, LEP_PT, file_path)?;
    let eta = prepare_float_list(batch, LEP_ETA, file_path)?;
    let phi = prepare_float_list(batch, LEP_PHI, file_path)?;
    let energy = prepare_float_list(batch, LEP_E, file_path)?;
    let charge = prepare_int_list(batch, LEP_CHARGE, file_path)?;
    let type_id = prepare_int_list(batch, LEP_TYPEID, file_path)?;
    let lep_n = match batch.column_by_name(LEP_N) {
        Some(column) => {
            reject_nulls(column, LEP_N, file_path)?;
            let values = cast(column, &DataType::Int32)?;
            Some(values.as_primitive::<Int32Type>().values().to_vec())
        }
        None => None,
    };
    let weights = WEIGHT_COLUMNS
        .iter()
        .map(|name| prepare_optional_scalar(batch, name, file_path))
        .collect::<HzzResult<Vec<_>>>()?;
    let weight_at = |column: usize, row: usize| -> Float {
        weights[column].as_ref().map_or(1.0, |values| values[row])
    };

    let scale = options.momentum_scale;
    for row in 0..n_rows {
        let n = pt.row_len(row);
        for (name, len) in [
            (LEP_ETA, eta.row_len(row)),
            (LEP_PHI, phi.row_len(row)),
            (LEP_E, energy.row_len(row)),
            (LEP_CHARGE, charge.row_len(row)),
            (LEP_TYPEID, type_id.row_len(row)),
        ] {
            if len != n {
                return Err(HzzError::LengthMismatch {
                    context: format!("column \"{name}\" of \"{file_path}\""),
                    expected: n,
                    actual: len,
                });
            }
        }
        if let Some(lep_n) = &lep_n {
            if lep_n[row] as usize != n {
                return Err(HzzError::LengthMismatch {
                    context: format!("column \"{LEP_N}\" of \"{file_path}\""),
                    expected: n,
                    actual: lep_n[row] as usize,
                });
            }
        }
        let leptons = pt
            .row(row)
            .iter()
            .zip(eta.row(row))
            .zip(phi.row(row))
            .zip(energy.row(row))
            .zip(charge.row(row).iter().zip(type_id.row(row)))
            .map(|((((&pt, &eta), &phi), &e), (&q, &id))| {
                Lepton::new(pt * scale, eta, phi, e * scale, q, id.abs())
            })
            .collect();
        events_out.push(Event {
            leptons,
            mc_weight: weight_at(0, row),
            scale_factor_pileup: weight_at(1, row),
            scale_factor_ele: weight_at(2, row),
            scale_factor_muon: weight_at(3, row),
            scale_factor_lep_trigger: weight_at(4, row),
        });
    }
    Ok(())
}

/// Convert a [`Dataset`] into a single [`RecordBatch`] with the delivered column layout.
///
/// Weight columns are always written, so a dataset written this way reads back as simulation
/// with whatever weights the events carry.
pub fn dataset_to_record_batch(
    dataset: &Dataset,
    options: &DatasetIoOptions,
) -> HzzResult<RecordBatch> {
    let scale = options.momentum_scale;
    let float_list = |f: &dyn Fn(&Lepton) -> Float| -> ArrayRef {
        Arc::new(ListArray::from_iter_primitive::<Float64Type, _, _>(
            dataset
                .iter()
                .map(|event| Some(event.leptons.iter().map(|l| Some(f(l))).collect::<Vec<_>>())),
        ))
    };
    let int_list = |f: &dyn Fn(&Lepton) -> i32| -> ArrayRef {
        Arc::new(ListArray::from_iter_primitive::<Int32Type, _, _>(
            dataset
                .iter()
                .map(|event| Some(event.leptons.iter().map(|l| Some(f(l))).collect::<Vec<_>>())),
        ))
    };
    let scalar = |f: &dyn Fn(&Event) -> Float| -> ArrayRef {
        Arc::new(Float64Array::from_iter_values(dataset.iter().map(f)))
    };
    let lep_n: ArrayRef = Arc::new(Int32Array::from_iter_values(
        dataset.iter().map(|e| e.n_leptons() as i32),
    ));
    Ok(RecordBatch::try_from_iter(vec![
        (LEP_N, lep_n),
        (LEP_PT, float_list(&|l| l.p4.pt() / scale)),
        (LEP_ETA, float_list(&|l| l.p4.eta())),
        (LEP_PHI, float_list(&|l| l.p4.phi())),
        (LEP_E, float_list(&|l| l.p4.e / scale)),
        (LEP_CHARGE, int_list(&|l| l.charge)),
        (LEP_TYPEID, int_list(&|l| l.type_id)),
        (MC_WEIGHT, scalar(&|e| e.mc_weight)),
        (SF_PILEUP, scalar(&|e| e.scale_factor_pileup)),
        (SF_ELE, scalar(&|e| e.scale_factor_ele)),
        (SF_MUON, scalar(&|e| e.scale_factor_muon)),
        (SF_LEP_TRIGGER, scalar(&|e| e.scale_factor_lep_trigger)),
    ])?)
}

/// Write a [`Dataset`] to a Parquet file with the delivered column layout.
pub fn write_parquet(
    dataset: &Dataset,
    file_path: &str,
    options: &DatasetIoOptions,
) -> HzzResult<()> {
    let path = expand_output_path(file_path)?;
    let batch = dataset_to_record_batch(dataset, options)?;
    let file = File::create(&path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    debug!(path = %path.display(), n_events = dataset.len(), "wrote parquet file");
    Ok(())
}
