//! Sparse count-matrix assembly and serialization.
//!
//! Rows are the barcodes retained by the cell caller, columns are all
//! genes in the transcriptome. Barcodes below the knee are omitted
//! from row enumeration entirely, not zeroed. The matrix is written as
//! MatrixMarket coordinate triples (1-indexed) with two companion
//! index files giving row and column order.

use rustc_hash::FxHashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::bus::Result;
use crate::dedup::BarcodeCounts;

/// Buffer size for matrix output (256KB).
const BUF_SIZE: usize = 256 * 1024;

/// Sparse gene-by-cell count matrix.
///
/// Built once after cell calling, never mutated again.
#[derive(Debug, Clone, PartialEq)]
pub struct CountMatrix {
    /// Row order: retained barcodes.
    pub barcodes: Vec<String>,
    /// Column order: all genes in the transcriptome.
    pub genes: Vec<String>,
    /// Nonzero entries, sorted by (row, col), 0-indexed.
    pub triples: Vec<(u32, u32, f64)>,
}

impl CountMatrix {
    /// Assemble the matrix from the retained barcode set and the
    /// aggregate. Aggregate entries for unretained barcodes are
    /// skipped.
    pub fn assemble(
        retained: &[String],
        aggregate: &[BarcodeCounts],
        genes: &[String],
    ) -> Self {
        let row_of: FxHashMap<&str, u32> = retained
            .iter()
            .enumerate()
            .map(|(i, bc)| (bc.as_str(), i as u32))
            .collect();

        let mut triples = Vec::new();
        for barcode_counts in aggregate {
            let Some(&row) = row_of.get(barcode_counts.barcode.as_str()) else {
                continue;
            };
            for (&gene, &count) in &barcode_counts.counts {
                if count > 0.0 {
                    triples.push((row, gene, count));
                }
            }
        }
        triples.sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        Self {
            barcodes: retained.to_vec(),
            genes: genes.to_vec(),
            triples,
        }
    }

    /// Number of nonzero entries.
    pub fn nnz(&self) -> usize {
        self.triples.len()
    }

    /// Sum of one gene column across all retained rows.
    pub fn column_sum(&self, gene: u32) -> f64 {
        self.triples
            .iter()
            .filter(|(_, g, _)| *g == gene)
            .map(|(_, _, v)| v)
            .sum()
    }

    /// Write matrix.mtx, barcodes.txt and genes.txt into `outdir`.
    ///
    /// Creates the directory if needed; any I/O failure (unwritable
    /// path, disk exhaustion) is fatal for the run.
    pub fn write<P: AsRef<Path>>(&self, outdir: P) -> Result<()> {
        let outdir = outdir.as_ref();
        fs::create_dir_all(outdir)?;

        let mut writer =
            BufWriter::with_capacity(BUF_SIZE, File::create(outdir.join("matrix.mtx"))?);
        self.write_mtx(&mut writer)?;
        writer.flush()?;
        write_lines(&outdir.join("barcodes.txt"), &self.barcodes)?;
        write_lines(&outdir.join("genes.txt"), &self.genes)?;
        Ok(())
    }

    /// Write the MatrixMarket coordinate body to any writer.
    pub fn write_mtx<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut itoa_buf = itoa::Buffer::new();
        let mut ryu_buf = ryu::Buffer::new();

        writer.write_all(b"%%MatrixMarket matrix coordinate real general\n")?;
        writeln!(
            writer,
            "{} {} {}",
            self.barcodes.len(),
            self.genes.len(),
            self.triples.len()
        )?;

        for &(row, col, value) in &self.triples {
            writer.write_all(itoa_buf.format(row + 1).as_bytes())?;
            writer.write_all(b" ")?;
            writer.write_all(itoa_buf.format(col + 1).as_bytes())?;
            writer.write_all(b" ")?;
            // Whole counts print as integers, fractional splits as floats.
            if value.fract() == 0.0 {
                writer.write_all(itoa_buf.format(value as u64).as_bytes())?;
            } else {
                writer.write_all(ryu_buf.format(value).as_bytes())?;
            }
            writer.write_all(b"\n")?;
        }
        Ok(())
    }
}

/// Write one identifier per line.
fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut writer = BufWriter::with_capacity(BUF_SIZE, File::create(path)?);
    for line in lines {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
