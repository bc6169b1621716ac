pub mod analyzer;
pub mod package;
pub mod processor;
pub mod types;
pub mod utils;
pub mod workbook;

pub use analyzer::{compute_progress, locate_header};
pub use package::replace_sheet_rows;
pub use processor::{drop_columns, read_records, write_records};
pub use types::*;
pub use workbook::{load_sheet, load_workbook, load_workbook_from_bytes, save_bytes, workbook_to_bytes};
