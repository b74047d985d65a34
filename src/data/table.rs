use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::error::ServiceError;

/// Validated 2D observations × features matrix with one name per column.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericTable {
    values: Array2<f64>,
    feature_names: Vec<String>,
}

impl NumericTable {
    /// Builds a table with synthesized `feature_<i>` names.
    pub fn new(values: Array2<f64>) -> Self {
        let feature_names = (0..values.ncols()).map(|i| format!("feature_{i}")).collect();
        Self {
            values,
            feature_names,
        }
    }

    /// Builds a table with source column names. Falls back to synthesized
    /// names when the count does not match.
    pub fn with_names(values: Array2<f64>, names: Vec<String>) -> Self {
        if names.len() == values.ncols() {
            Self {
                values,
                feature_names: names,
            }
        } else {
            tracing::debug!(
                names = names.len(),
                cols = values.ncols(),
                "column names do not match width, synthesizing"
            );
            Self::new(values)
        }
    }

    /// Replaces the feature names with caller-supplied ones.
    pub fn rename(&mut self, names: Vec<String>) -> Result<(), ServiceError> {
        if names.len() != self.n_features() {
            return Err(ServiceError::InvalidRequest(format!(
                "expected {} feature names, got {}",
                self.n_features(),
                names.len()
            )));
        }
        self.feature_names = names;
        Ok(())
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn column(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.column(index)
    }

    pub fn into_values(self) -> Array2<f64> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn synthesizes_names_per_column() {
        let table = NumericTable::new(array![[1.0, 2.0, 3.0]]);
        assert_eq!(table.feature_names(), ["feature_0", "feature_1", "feature_2"]);
    }

    #[test]
    fn rename_requires_matching_width() {
        let mut table = NumericTable::new(array![[1.0, 2.0]]);
        assert!(table.rename(vec!["a".into()]).is_err());
        table.rename(vec!["a".into(), "b".into()]).unwrap();
        assert_eq!(table.feature_names(), ["a", "b"]);
    }
}
