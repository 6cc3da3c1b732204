//! nodule-export: Pure table serializers (sans-IO)
//!
//! Converts analysis results into output formats. Currently supports
//! the per-nodule CSV table.

pub mod table;

pub use table::{CSV_HEADER, CsvRow, ExportError, rows, to_csv};
