//! Fault-tolerant batch collation
//!
//! Assembles a list of per-example feature records into one batch of
//! stacked arrays. Labels follow strict rules and fail loudly; every
//! other field is stacked when its records agree and otherwise falls back
//! to repeating the first record's value so a malformed example never
//! stops training.

use ndarray::{Array1, ArrayD, ArrayView, Axis, IxDyn};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::error::{Error, Result};

const LABEL: &str = "label";
const LABEL_IDS: &str = "label_ids";
/// Output key for labels, whichever input key they came from
const LABELS: &str = crate::constants::data::LABELS;

/// One value of a feature record
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Ints(ArrayD<i64>),
    Floats(ArrayD<f64>),
    Text(String),
    Missing,
}

impl FieldValue {
    /// 1-D integer field from token ids
    pub fn ids(ids: &[u32]) -> Self {
        FieldValue::Ints(Array1::from_iter(ids.iter().map(|&id| i64::from(id))).into_dyn())
    }

    pub fn ints(values: Vec<i64>) -> Self {
        FieldValue::Ints(Array1::from_vec(values).into_dyn())
    }

    pub fn floats(values: Vec<f64>) -> Self {
        FieldValue::Floats(Array1::from_vec(values).into_dyn())
    }

    /// 2-D integer field from nested rows; ragged rows are rejected
    pub fn int_rows(rows: Vec<Vec<i64>>) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != cols) {
            return Err(Error::invalid_data("ragged nested sequence"));
        }
        let shape = IxDyn(&[rows.len(), cols]);
        let flat: Vec<i64> = rows.into_iter().flatten().collect();
        Ok(FieldValue::Ints(ArrayD::from_shape_vec(shape, flat)?))
    }

    fn is_skipped(&self) -> bool {
        matches!(self, FieldValue::Text(_) | FieldValue::Missing)
    }

    /// Scalar view, including zero-dimensional arrays
    fn scalar(&self) -> Option<Scalar> {
        match self {
            FieldValue::Int(v) => Some(Scalar::Int(*v)),
            FieldValue::Float(v) => Some(Scalar::Float(*v)),
            FieldValue::Ints(a) if a.ndim() == 0 => a.iter().next().map(|v| Scalar::Int(*v)),
            FieldValue::Floats(a) if a.ndim() == 0 => a.iter().next().map(|v| Scalar::Float(*v)),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::Ints(_) => "int array",
            FieldValue::Floats(_) => "float array",
            FieldValue::Text(_) => "text",
            FieldValue::Missing => "missing",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Scalar {
    Int(i64),
    Float(f64),
}

impl Scalar {
    fn as_i64(self) -> i64 {
        match self {
            Scalar::Int(v) => v,
            Scalar::Float(v) => v as i64,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Scalar::Int(v) => v as f64,
            Scalar::Float(v) => v,
        }
    }
}

/// A stacked batch field with a leading batch dimension
#[derive(Debug, Clone, PartialEq)]
pub enum Stacked {
    Int(ArrayD<i64>),
    Float(ArrayD<f64>),
}

impl Stacked {
    pub fn shape(&self) -> &[usize] {
        match self {
            Stacked::Int(a) => a.shape(),
            Stacked::Float(a) => a.shape(),
        }
    }

    pub fn as_int(&self) -> Option<&ArrayD<i64>> {
        match self {
            Stacked::Int(a) => Some(a),
            Stacked::Float(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<&ArrayD<f64>> {
        match self {
            Stacked::Float(a) => Some(a),
            Stacked::Int(_) => None,
        }
    }
}

/// Field name → value for one example
pub type FeatureRecord = BTreeMap<String, FieldValue>;

/// Collated batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub fields: BTreeMap<String, Stacked>,
    /// Fields filled by repeating the first record's value
    pub degraded: BTreeSet<String>,
}

impl Batch {
    pub fn get(&self, name: &str) -> Option<&Stacked> {
        self.fields.get(name)
    }

    pub fn labels(&self) -> Option<&Stacked> {
        self.fields.get(LABELS)
    }

    /// Batch dimension
    pub fn len(&self) -> usize {
        self.fields
            .values()
            .next()
            .and_then(|s| s.shape().first().copied())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Collator that never aborts on malformed non-label fields
#[derive(Debug, Clone, Default)]
pub struct FaultTolerantCollator;

impl FaultTolerantCollator {
    pub fn new() -> Self {
        Self
    }

    pub fn collate(&self, features: &[FeatureRecord]) -> Result<Batch> {
        let first = features
            .first()
            .ok_or_else(|| Error::invalid_data("cannot collate an empty list of records"))?;
        let mut batch = Batch::default();

        match (first.get(LABEL), first.get(LABEL_IDS)) {
            (Some(label), _) if !label.is_skipped() => {
                batch.fields.insert(LABELS.to_string(), stack_scalar_labels(label, features)?);
            }
            (_, Some(label_ids)) if !label_ids.is_skipped() => {
                batch.fields.insert(LABELS.to_string(), stack_label_ids(label_ids, features)?);
            }
            _ => {}
        }

        for (name, value) in first {
            if name == LABEL || name == LABEL_IDS || value.is_skipped() {
                continue;
            }
            match stack_field(name, value, features) {
                Ok(stacked) => {
                    batch.fields.insert(name.clone(), stacked);
                }
                Err(err) => {
                    warn!(
                        field = %name,
                        records = features.len(),
                        error = %err,
                        "Inconsistent field across records, repeating the first record's value"
                    );
                    batch.fields.insert(name.clone(), broadcast_first(value, features.len()));
                    batch.degraded.insert(name.clone());
                }
            }
        }

        Ok(batch)
    }
}

fn stack_scalar_labels(first: &FieldValue, features: &[FeatureRecord]) -> Result<Stacked> {
    let first_scalar = first.scalar().ok_or_else(|| {
        Error::invalid_data(format!("'{}' must be a scalar, found {}", LABEL, first.kind()))
    })?;
    let values = features
        .iter()
        .enumerate()
        .map(|(i, f)| {
            f.get(LABEL).and_then(FieldValue::scalar).ok_or_else(|| {
                Error::invalid_data(format!("record {} has no scalar '{}'", i, LABEL))
            })
        })
        .collect::<Result<Vec<Scalar>>>()?;

    Ok(match first_scalar {
        Scalar::Int(_) => Stacked::Int(Array1::from_iter(values.into_iter().map(Scalar::as_i64)).into_dyn()),
        Scalar::Float(_) => {
            Stacked::Float(Array1::from_iter(values.into_iter().map(Scalar::as_f64)).into_dyn())
        }
    })
}

fn stack_label_ids(first: &FieldValue, features: &[FeatureRecord]) -> Result<Stacked> {
    let values: Vec<&FieldValue> = features
        .iter()
        .enumerate()
        .map(|(i, f)| {
            f.get(LABEL_IDS)
                .filter(|v| !v.is_skipped())
                .ok_or_else(|| Error::invalid_data(format!("record {} has no '{}'", i, LABEL_IDS)))
        })
        .collect::<Result<_>>()?;

    match first {
        FieldValue::Ints(_) | FieldValue::Int(_) => Ok(Stacked::Int(stack_ints(&values)?)),
        FieldValue::Floats(_) | FieldValue::Float(_) => Ok(Stacked::Float(stack_floats(&values)?)),
        other => Err(Error::invalid_data(format!(
            "'{}' must be numeric, found {}",
            LABEL_IDS,
            other.kind()
        ))),
    }
}

/// Stack one non-label field; mixed int/float promotes to float
fn stack_field(name: &str, first: &FieldValue, features: &[FeatureRecord]) -> Result<Stacked> {
    let values: Vec<&FieldValue> = features
        .iter()
        .enumerate()
        .map(|(i, f)| match f.get(name) {
            Some(v) if !v.is_skipped() => Ok(v),
            Some(v) => Err(Error::invalid_data(format!(
                "record {} has {} value for '{}'",
                i,
                v.kind(),
                name
            ))),
            None => Err(Error::invalid_data(format!("record {} is missing '{}'", i, name))),
        })
        .collect::<Result<_>>()?;

    let any_float = values
        .iter()
        .any(|v| matches!(v, FieldValue::Float(_) | FieldValue::Floats(_)));

    if first.scalar().is_some() {
        let scalars = values
            .iter()
            .map(|v| {
                v.scalar().ok_or_else(|| {
                    Error::invalid_data(format!("'{}' mixes scalars with {}", name, v.kind()))
                })
            })
            .collect::<Result<Vec<Scalar>>>()?;
        return Ok(if any_float {
            Stacked::Float(Array1::from_iter(scalars.into_iter().map(Scalar::as_f64)).into_dyn())
        } else {
            Stacked::Int(Array1::from_iter(scalars.into_iter().map(Scalar::as_i64)).into_dyn())
        });
    }

    if any_float {
        Ok(Stacked::Float(stack_floats(&values)?))
    } else {
        Ok(Stacked::Int(stack_ints(&values)?))
    }
}

fn stack_ints(values: &[&FieldValue]) -> Result<ArrayD<i64>> {
    let arrays = values
        .iter()
        .map(|v| match v {
            FieldValue::Ints(a) => Ok(a.clone()),
            FieldValue::Floats(a) => Ok(a.mapv(|x| x as i64)),
            other => Err(Error::invalid_data(format!("expected array, found {}", other.kind()))),
        })
        .collect::<Result<Vec<_>>>()?;
    stack_arrays(&arrays)
}

fn stack_floats(values: &[&FieldValue]) -> Result<ArrayD<f64>> {
    let arrays = values
        .iter()
        .map(|v| match v {
            FieldValue::Floats(a) => Ok(a.clone()),
            FieldValue::Ints(a) => Ok(a.mapv(|x| x as f64)),
            other => Err(Error::invalid_data(format!("expected array, found {}", other.kind()))),
        })
        .collect::<Result<Vec<_>>>()?;
    stack_arrays(&arrays)
}

fn stack_arrays<T: Clone>(arrays: &[ArrayD<T>]) -> Result<ArrayD<T>> {
    let views: Vec<ArrayView<'_, T, IxDyn>> = arrays.iter().map(|a| a.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

/// Repeat the first record's value `n` times along a new leading axis
fn broadcast_first(value: &FieldValue, n: usize) -> Stacked {
    match value {
        FieldValue::Int(v) => Stacked::Int(Array1::from_elem(n, *v).into_dyn()),
        FieldValue::Float(v) => Stacked::Float(Array1::from_elem(n, *v).into_dyn()),
        FieldValue::Ints(a) => Stacked::Int(repeat(a, n)),
        FieldValue::Floats(a) => Stacked::Float(repeat(a, n)),
        // Skipped kinds never reach the fallback
        FieldValue::Text(_) | FieldValue::Missing => Stacked::Int(ArrayD::zeros(IxDyn(&[n]))),
    }
}

fn repeat<T: Clone>(array: &ArrayD<T>, n: usize) -> ArrayD<T> {
    let mut shape = Vec::with_capacity(array.ndim() + 1);
    shape.push(n);
    shape.extend_from_slice(array.shape());
    let data: Vec<T> = (0..n).flat_map(|_| array.iter().cloned()).collect();
    // Element count equals the product of `shape` by construction
    ArrayD::from_shape_vec(IxDyn(&shape), data).unwrap_or_else(|_| array.clone().insert_axis(Axis(0)))
}
