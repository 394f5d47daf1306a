// Clippy allows for the whole crate
#![allow(clippy::should_implement_trait)]

//! buscount: BUS-record quantification.
//!
//! Converts a sorted pseudoalignment record stream (barcode, UMI,
//! equivalence class, multiplicity) into a gene-by-cell sparse count
//! matrix, with barcode error correction, UMI deduplication and
//! knee-point cell calling.
//!
//! # Features
//!
//! - **Parallel processing**: disjoint barcode groups run on Rayon workers
//! - **Sorted-stream validation**: out-of-order input fails fast
//! - **Deterministic output**: independent of thread count
//!
//! # Example
//!
//! ```rust,no_run
//! use buscount::{commands::CountCommand, config::CountConfig};
//!
//! let config = CountConfig::new().with_expected_cells(Some(1000));
//! let summary = CountCommand::new()
//!     .with_config(config)
//!     .run(
//!         "output.bus.sorted.txt",
//!         "matrix.ec",
//!         "transcripts.txt",
//!         "t2g.tsv",
//!         "counts",
//!     )
//!     .unwrap();
//! eprintln!("{}", summary);
//! ```

pub mod bus;
pub mod commands;
pub mod config;
pub mod correct;
pub mod dedup;
pub mod knee;
pub mod matrix;
pub mod t2g;

// Re-export commonly used types
pub use bus::{BusError, BusReader, BusRecord, Result};
pub use config::{CountConfig, MultiGenePolicy};
pub use matrix::CountMatrix;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bus::{load_records, verify_sorted, BusError, BusReader, BusRecord, Result};
    pub use crate::commands::{CountCommand, RunSummary};
    pub use crate::config::{CountConfig, MultiGenePolicy};
    pub use crate::matrix::CountMatrix;
    pub use crate::t2g::{EcMap, GeneTable};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_workflow() {
        use crate::bus::parse_records;
        use crate::commands::CountCommand;
        use crate::t2g::{EcMap, GeneTable};

        let content = "AAA\tU1\t0\t1\nAAA\tU2\t0\t1\nAAT\tU1\t0\t1\n";
        let records = parse_records(content).unwrap();

        let mut table = GeneTable::new();
        table.insert("tx0", "geneX");
        let mut ec_map = EcMap::new();
        ec_map.insert(0, vec![0]);

        let (matrix, summary) = CountCommand::new()
            .quantify(&records, &ec_map, &table)
            .unwrap();

        assert_eq!(summary.retained_cells, 2);
        assert_eq!(matrix.column_sum(0), 3.0);
    }
}
