//! Count command: the full quantification pass.
//!
//! Single forward pass over the sorted record stream with one full
//! buffering point (aggregation completes before ranking). Barcode
//! correction and cell calling are the only global steps; everything
//! between runs per disjoint barcode group.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::bus::{self, BusError, Result};
use crate::config::CountConfig;
use crate::correct;
use crate::dedup::{self, DedupMetrics};
use crate::knee;
use crate::matrix::CountMatrix;
use crate::t2g::{EcMap, GeneTable};

/// Run summary written to run_info.txt and printed behind --stats.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub records: usize,
    pub barcodes_observed: usize,
    pub barcodes_corrected: usize,
    pub dropped_unmapped_class: u64,
    pub dropped_ambiguous_umi: u64,
    pub dropped_multi_gene: u64,
    pub retained_cells: usize,
    pub knee_rank: usize,
    pub genes: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "records\t{}", self.records)?;
        writeln!(f, "barcodes_observed\t{}", self.barcodes_observed)?;
        writeln!(f, "barcodes_corrected\t{}", self.barcodes_corrected)?;
        writeln!(f, "dropped_unmapped_class\t{}", self.dropped_unmapped_class)?;
        writeln!(f, "dropped_ambiguous_umi\t{}", self.dropped_ambiguous_umi)?;
        writeln!(f, "dropped_multi_gene\t{}", self.dropped_multi_gene)?;
        writeln!(f, "retained_cells\t{}", self.retained_cells)?;
        writeln!(f, "knee_rank\t{}", self.knee_rank)?;
        write!(f, "genes\t{}", self.genes)
    }
}

/// Quantification command.
#[derive(Debug, Clone, Default)]
pub struct CountCommand {
    config: CountConfig,
}

impl CountCommand {
    pub fn new() -> Self {
        Self {
            config: CountConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CountConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CountConfig {
        &self.config
    }

    /// Run the full pass: read, resolve, correct, deduplicate, call
    /// cells, write the matrix and companion files into `outdir`.
    pub fn run<P: AsRef<Path>>(
        &self,
        bus_path: P,
        ec_path: P,
        transcripts_path: P,
        t2g_path: P,
        outdir: P,
    ) -> Result<RunSummary> {
        let table = GeneTable::from_file(&t2g_path)?;
        if table.is_empty() {
            return Err(BusError::InvalidFormat(
                "transcript-to-gene table contains no genes".to_string(),
            ));
        }
        let ec_map = EcMap::from_files(&ec_path, &transcripts_path, &table)?;

        // Both the parallel input parse and the aggregation schedule
        // on the current pool, so the whole pass must run inside the
        // configured one, not just the dedup step.
        let bus_path = bus_path.as_ref();
        let pass = || -> Result<(CountMatrix, RunSummary)> {
            let records = bus::load_records(bus_path)?;
            self.quantify(&records, &ec_map, &table)
        };
        let (matrix, summary) = if self.config.threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.threads)
                .build()
                .map_err(|e| BusError::InvalidFormat(format!("thread pool: {}", e)))?;
            pool.install(pass)?
        } else {
            pass()?
        };

        matrix.write(&outdir)?;
        write_run_info(outdir.as_ref(), &summary)?;
        Ok(summary)
    }

    /// The in-memory pipeline, independent of file layout. Exposed so
    /// tests can drive it with synthetic records.
    pub fn quantify(
        &self,
        records: &[bus::BusRecord],
        ec_map: &EcMap,
        table: &GeneTable,
    ) -> Result<(CountMatrix, RunSummary)> {
        let totals = correct::barcode_totals(records);
        let correction = correct::correction_map(&totals, self.config.correction_multiplier);

        let (groups, partition_metrics) =
            dedup::partition_by_barcode(records, &correction, ec_map);
        let (aggregate, dedup_metrics) =
            dedup::aggregate(&groups, self.config.multi_gene_policy);

        let mut metrics = DedupMetrics::default();
        metrics.merge(&partition_metrics);
        metrics.merge(&dedup_metrics);

        let (retained, knee_rank) = knee::call_cells(&aggregate, &self.config);
        if retained.is_empty() {
            return Err(BusError::EmptyCellSet);
        }

        let matrix = CountMatrix::assemble(&retained, &aggregate, table.genes());
        let summary = RunSummary {
            records: records.len(),
            barcodes_observed: totals.len(),
            barcodes_corrected: correction.len(),
            dropped_unmapped_class: metrics.dropped_unmapped_class,
            dropped_ambiguous_umi: metrics.dropped_ambiguous_umi,
            dropped_multi_gene: metrics.dropped_multi_gene,
            retained_cells: retained.len(),
            knee_rank,
            genes: table.num_genes(),
        };
        Ok((matrix, summary))
    }
}

/// Write the run summary next to the matrix.
fn write_run_info(outdir: &Path, summary: &RunSummary) -> Result<()> {
    let mut writer = BufWriter::new(File::create(outdir.join("run_info.txt"))?);
    writeln!(writer, "{}", summary)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusRecord;

    fn fixture() -> (EcMap, GeneTable) {
        let mut table = GeneTable::new();
        table.insert("tx0", "geneX");
        table.insert("tx1", "geneY");
        let mut ec_map = EcMap::new();
        ec_map.insert(0, vec![0]);
        ec_map.insert(1, vec![1]);
        (ec_map, table)
    }

    #[test]
    fn test_quantify_small_run() {
        let (ec_map, table) = fixture();
        let records = vec![
            BusRecord::new("AAA", "U1", 0, 1),
            BusRecord::new("AAA", "U1", 0, 1),
            BusRecord::new("AAA", "U2", 0, 1),
            BusRecord::new("AAT", "U3", 1, 1),
        ];

        let cmd = CountCommand::new();
        let (matrix, summary) = cmd.quantify(&records, &ec_map, &table).unwrap();

        assert_eq!(summary.records, 4);
        assert_eq!(summary.barcodes_observed, 2);
        // Ratio 3:1 is below the default multiplier; no correction.
        assert_eq!(summary.barcodes_corrected, 0);
        // Two barcodes, no knee to speak of: both retained.
        assert_eq!(summary.retained_cells, 2);
        assert_eq!(matrix.column_sum(0), 2.0);
        assert_eq!(matrix.column_sum(1), 1.0);
    }

    #[test]
    fn test_quantify_empty_cell_set() {
        let (ec_map, table) = fixture();
        // Every record's class is unknown: nothing survives.
        let records = vec![BusRecord::new("AAA", "U1", 42, 1)];

        let cmd = CountCommand::new();
        let result = cmd.quantify(&records, &ec_map, &table);
        assert!(matches!(result, Err(BusError::EmptyCellSet)));
    }

    #[test]
    fn test_summary_display_is_tabular() {
        let summary = RunSummary {
            records: 10,
            retained_cells: 2,
            ..Default::default()
        };
        let text = summary.to_string();
        assert!(text.contains("records\t10"));
        assert!(text.contains("retained_cells\t2"));
        assert!(text.contains("knee_rank\t0"));
    }
}
