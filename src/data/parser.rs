use std::collections::HashMap;

use axum::body::Bytes;
use ndarray::{Array2, ArrayD, Ix2, IxDyn};
use ndarray_npy::ReadNpyExt;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{data::impute_column_means, data::NumericTable, error::DataError, format::FormatTag};

const TIMESTAMP_COLUMN: &str = "Timestamp";
const MISSING_TOKENS: &[&str] = &["", "NaN", "nan", "NA", "N/A", "null", "NULL", "None"];

/// Where a dataset comes from.
#[derive(Debug, Clone)]
pub enum DataSource {
    Upload { filename: String, bytes: Bytes },
    Url(String),
}

/// Parses raw bytes of the given format into a validated table.
pub fn parse(raw: &[u8], format: FormatTag) -> Result<NumericTable, DataError> {
    let result = match format {
        FormatTag::Csv => parse_csv(raw),
        FormatTag::Json => parse_json(raw),
        FormatTag::Npy => parse_npy(raw),
        FormatTag::Pickle | FormatTag::Hdf5 => {
            Err(DataError::UnsupportedFormat(format.name().to_string()))
        }
    };

    match &result {
        Ok(table) => debug!(%format, shape = ?table.shape(), "parsed data"),
        Err(err) => warn!(%format, error = %err, "failed to parse data"),
    }
    result
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

enum ColumnKind {
    Numeric(Vec<f64>),
    Boolean(Vec<f64>),
    Text,
}

pub fn parse_csv(raw: &[u8]) -> Result<NumericTable, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(raw);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| DataError::Csv(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut cells: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
    for record in reader.records() {
        let record = record.map_err(|e| DataError::Csv(e.to_string()))?;
        for (column, field) in cells.iter_mut().zip(record.iter()) {
            column.push(field.to_string());
        }
    }
    let n_rows = cells.first().map_or(0, Vec::len);

    let mut names = Vec::new();
    let mut columns = Vec::new();
    let mut dropped = Vec::new();
    for (name, column) in headers.into_iter().zip(cells) {
        if name == TIMESTAMP_COLUMN {
            continue;
        }
        match classify(&column) {
            ColumnKind::Numeric(values) | ColumnKind::Boolean(values) => {
                names.push(name);
                columns.push(values);
            }
            ColumnKind::Text => dropped.push(name),
        }
    }

    if !dropped.is_empty() {
        warn!(columns = ?dropped, "dropped non-numeric columns");
    }
    if columns.is_empty() {
        return Err(DataError::EmptyData);
    }

    let values = Array2::from_shape_fn((n_rows, columns.len()), |(row, col)| columns[col][row]);
    finalize(values.into_dyn(), Some(names))
}

fn classify(column: &[String]) -> ColumnKind {
    if !column.is_empty() && column.iter().all(|cell| parse_bool(cell).is_some()) {
        return ColumnKind::Boolean(column.iter().filter_map(|c| parse_bool(c)).collect());
    }

    let mut values = Vec::with_capacity(column.len());
    for cell in column {
        if MISSING_TOKENS.contains(&cell.as_str()) {
            values.push(f64::NAN);
        } else if let Ok(v) = cell.parse::<f64>() {
            values.push(v);
        } else {
            return ColumnKind::Text;
        }
    }
    ColumnKind::Numeric(values)
}

fn parse_bool(cell: &str) -> Option<f64> {
    match cell {
        "True" | "true" | "TRUE" => Some(1.0),
        "False" | "false" | "FALSE" => Some(0.0),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// Accepted shapes:
///
/// * `{"data": [[...], ...]}`
/// * `[[...], ...]` or `[...]`
/// * `[{"a": 1, "b": 2}, ...]` (rows, keys are columns)
/// * `{"a": [...], "b": [...]}` (values are columns)
pub fn parse_json(raw: &[u8]) -> Result<NumericTable, DataError> {
    let root: Value =
        serde_json::from_slice(raw).map_err(|e| DataError::InvalidJson(e.to_string()))?;

    match root {
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => array_to_table(items),
            Some(other) => Err(DataError::UnsupportedStructure(format!(
                "\"data\" must be an array, found {}",
                json_kind(&other)
            ))),
            None => columns_to_table(map),
        },
        Value::Array(items) => array_to_table(items),
        other => Err(DataError::UnsupportedStructure(format!(
            "top-level {}",
            json_kind(&other)
        ))),
    }
}

fn array_to_table(items: Vec<Value>) -> Result<NumericTable, DataError> {
    if !items.is_empty() && items.iter().all(Value::is_object) {
        return records_to_table(items);
    }
    let array = nested_to_array(&Value::Array(items))?;
    finalize(array, None)
}

fn records_to_table(records: Vec<Value>) -> Result<NumericTable, DataError> {
    let mut names: Vec<String> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for record in &records {
        if let Value::Object(fields) = record {
            for key in fields.keys() {
                if !positions.contains_key(key) {
                    positions.insert(key.clone(), names.len());
                    names.push(key.clone());
                }
            }
        }
    }

    let mut values = Array2::from_elem((records.len(), names.len()), f64::NAN);
    for (row, record) in records.iter().enumerate() {
        if let Value::Object(fields) = record {
            for (key, cell) in fields {
                values[[row, positions[key]]] = cell_value(cell)?;
            }
        }
    }

    finalize(values.into_dyn(), Some(names))
}

fn columns_to_table(map: Map<String, Value>) -> Result<NumericTable, DataError> {
    if map.is_empty() {
        return Err(DataError::EmptyData);
    }

    let mut names = Vec::with_capacity(map.len());
    let mut columns: Vec<Vec<f64>> = Vec::with_capacity(map.len());
    for (name, value) in map {
        let cells = match value {
            Value::Array(cells) => cells,
            other => {
                return Err(DataError::UnsupportedStructure(format!(
                    "column \"{name}\" is a {}, expected an array",
                    json_kind(&other)
                )));
            }
        };
        let column = cells.iter().map(cell_value).collect::<Result<Vec<_>, _>>()?;
        if let Some(first) = columns.first() {
            if first.len() != column.len() {
                return Err(DataError::UnsupportedStructure(format!(
                    "column \"{name}\" has {} values, expected {}",
                    column.len(),
                    first.len()
                )));
            }
        }
        names.push(name);
        columns.push(column);
    }

    let n_rows = columns[0].len();
    let values = Array2::from_shape_fn((n_rows, columns.len()), |(row, col)| columns[col][row]);
    finalize(values.into_dyn(), Some(names))
}

fn nested_to_array(value: &Value) -> Result<ArrayD<f64>, DataError> {
    let mut shape = Vec::new();
    let mut cursor = value;
    while let Value::Array(items) = cursor {
        shape.push(items.len());
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }

    let mut leaves = Vec::with_capacity(shape.iter().product());
    collect_leaves(value, &shape, 0, &mut leaves)?;
    ArrayD::from_shape_vec(IxDyn(&shape), leaves)
        .map_err(|e| DataError::UnsupportedStructure(e.to_string()))
}

fn collect_leaves(
    value: &Value,
    shape: &[usize],
    depth: usize,
    out: &mut Vec<f64>,
) -> Result<(), DataError> {
    if depth == shape.len() {
        out.push(cell_value(value)?);
        return Ok(());
    }
    match value {
        Value::Array(items) if items.len() == shape[depth] => {
            for item in items {
                collect_leaves(item, shape, depth + 1, out)?;
            }
            Ok(())
        }
        _ => Err(DataError::UnsupportedStructure(format!(
            "ragged array at depth {depth}"
        ))),
    }
}

fn cell_value(value: &Value) -> Result<f64, DataError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| DataError::UnsupportedStructure(format!("unrepresentable number {n}"))),
        Value::Null => Ok(f64::NAN),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => Err(DataError::UnsupportedStructure(format!(
            "non-numeric value \"{s}\""
        ))),
        Value::Array(_) | Value::Object(_) => Err(DataError::UnsupportedStructure(
            "ragged or nested value".to_string(),
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// NPY
// ---------------------------------------------------------------------------

pub fn parse_npy(raw: &[u8]) -> Result<NumericTable, DataError> {
    let array = read_npy_as_f64(raw)?;
    finalize(array, None)
}

/// `.npy` payloads carry their own dtype; try every numeric one we accept.
fn read_npy_as_f64(raw: &[u8]) -> Result<ArrayD<f64>, DataError> {
    macro_rules! attempt {
        ($($ty:ty),+) => {
            $(
                if let Ok(array) = ArrayD::<$ty>::read_npy(raw) {
                    return Ok(array.mapv(|v| v as f64));
                }
            )+
        };
    }

    attempt!(f32, i64, i32, i16, i8, u64, u32, u16, u8);
    ArrayD::<f64>::read_npy(raw).map_err(|e| DataError::Npy(e.to_string()))
}

// ---------------------------------------------------------------------------
// Shared post-processing
// ---------------------------------------------------------------------------

fn finalize(array: ArrayD<f64>, names: Option<Vec<String>>) -> Result<NumericTable, DataError> {
    let mut values = match array.ndim() {
        0 => {
            return Err(DataError::UnsupportedStructure(
                "scalar value, expected an array".to_string(),
            ));
        }
        1 => {
            let column: Vec<f64> = array.iter().copied().collect();
            Array2::from_shape_vec((column.len(), 1), column)
                .map_err(|e| DataError::UnsupportedStructure(e.to_string()))?
        }
        2 => array
            .into_dimensionality::<Ix2>()
            .map_err(|e| DataError::UnsupportedStructure(e.to_string()))?,
        n => return Err(DataError::TooManyDimensions(n)),
    };

    if values.is_empty() {
        return Err(DataError::EmptyData);
    }

    // infinities count as missing
    let infinite = values.iter().filter(|v| v.is_infinite()).count();
    if infinite > 0 {
        warn!(cells = infinite, "treating infinite values as missing");
        values.mapv_inplace(|v| if v.is_infinite() { f64::NAN } else { v });
    }

    impute_column_means(&mut values);

    Ok(match names {
        Some(names) => NumericTable::with_names(values, names),
        None => NumericTable::new(values),
    })
}
