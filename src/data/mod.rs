mod impute;
mod parser;
mod table;

pub use impute::impute_column_means;
pub use parser::{DataSource, parse, parse_csv, parse_json, parse_npy};
pub use table::NumericTable;
