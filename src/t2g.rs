//! Transcript-to-gene table and equivalence-class resolution.
//!
//! Built once from three aligner artifacts, read-only afterwards:
//! the transcript list (`transcripts.txt`, order defines the indices
//! used by the class definitions), the class definitions (`matrix.ec`,
//! `ec_id<TAB>i,j,k` with 0-based transcript indices) and the
//! two-column transcript-to-gene table.

use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::bus::{BusError, Result};

/// Transcript-to-gene mapping.
///
/// Gene order is the order of first appearance in the table; that
/// order defines the count-matrix columns.
#[derive(Debug, Clone, Default)]
pub struct GeneTable {
    /// Map of transcript ID to gene index
    transcript_to_gene: FxHashMap<String, u32>,
    /// Gene identifiers in column order
    genes: Vec<String>,
    gene_index: FxHashMap<String, u32>,
}

impl GeneTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a transcript-to-gene table.
    /// Format: tab-delimited with transcript\tgene per line; extra
    /// columns (some tables carry a gene symbol) are ignored.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut table = Self::new();

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split('\t');
            let transcript = fields.next().unwrap_or_default();
            let gene = fields.next().ok_or_else(|| BusError::Parse {
                line: line_num + 1,
                message: "transcript-to-gene table requires two columns".to_string(),
            })?;

            table.insert(transcript, gene);
        }

        Ok(table)
    }

    /// Insert a transcript-to-gene pair (appends the gene to column
    /// order if new).
    pub fn insert(&mut self, transcript: &str, gene: &str) {
        let gene_idx = match self.gene_index.get(gene) {
            Some(&idx) => idx,
            None => {
                let idx = self.genes.len() as u32;
                self.genes.push(gene.to_string());
                self.gene_index.insert(gene.to_string(), idx);
                idx
            }
        };
        self.transcript_to_gene
            .insert(transcript.to_string(), gene_idx);
    }

    /// Get the gene index for a transcript.
    #[inline]
    pub fn gene_for_transcript(&self, transcript: &str) -> Option<u32> {
        self.transcript_to_gene.get(transcript).copied()
    }

    /// Gene identifiers in column order.
    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    /// Number of genes.
    pub fn num_genes(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }
}

/// Equivalence-class to gene-set map.
///
/// Each class resolves to a sorted, deduplicated set of gene indices.
/// Shared read-only by all downstream stages.
#[derive(Debug, Clone, Default)]
pub struct EcMap {
    classes: FxHashMap<u32, Vec<u32>>,
}

impl EcMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the transcript list (one ID per line, order defines the
    /// indices referenced by class definitions).
    pub fn load_transcripts<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut transcripts = Vec::new();
        for line_result in reader.lines() {
            let line = line_result?;
            let line = line.trim();
            if !line.is_empty() {
                transcripts.push(line.to_string());
            }
        }
        Ok(transcripts)
    }

    /// Build the class map from a matrix.ec file.
    ///
    /// Transcripts absent from the gene table are skipped; a class
    /// whose transcripts are all unknown resolves to the empty set and
    /// its records are later dropped as unmapped.
    pub fn from_files<P: AsRef<Path>>(
        ec_path: P,
        transcripts_path: P,
        table: &GeneTable,
    ) -> Result<Self> {
        let transcripts = Self::load_transcripts(transcripts_path)?;
        let file = File::open(ec_path)?;
        let reader = BufReader::new(file);
        let mut classes: FxHashMap<u32, Vec<u32>> = FxHashMap::default();

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parse_err = |message: String| BusError::Parse {
                line: line_num + 1,
                message,
            };

            let mut fields = line.split('\t');
            let ec_field = fields.next().unwrap_or_default();
            let list_field = fields
                .next()
                .ok_or_else(|| parse_err("class definition requires two columns".to_string()))?;

            let ec: u32 = ec_field
                .parse()
                .map_err(|_| parse_err(format!("invalid class ID: '{}'", ec_field)))?;

            let mut genes = Vec::new();
            for idx_str in list_field.split(',').filter(|s| !s.is_empty()) {
                let idx: usize = idx_str
                    .parse()
                    .map_err(|_| parse_err(format!("invalid transcript index: '{}'", idx_str)))?;
                let transcript = transcripts.get(idx).ok_or_else(|| {
                    parse_err(format!(
                        "transcript index {} out of range ({} transcripts)",
                        idx,
                        transcripts.len()
                    ))
                })?;
                if let Some(gene) = table.gene_for_transcript(transcript) {
                    genes.push(gene);
                }
            }

            genes.sort_unstable();
            genes.dedup();
            classes.insert(ec, genes);
        }

        Ok(Self { classes })
    }

    /// Insert a class definition directly (useful for testing).
    pub fn insert(&mut self, ec: u32, mut genes: Vec<u32>) {
        genes.sort_unstable();
        genes.dedup();
        self.classes.insert(ec, genes);
    }

    /// Resolve a class to its gene set.
    ///
    /// Returns None for an unknown class or one with no mapped genes;
    /// callers tally those records as dropped, the run continues.
    #[inline]
    pub fn resolve(&self, ec: u32) -> Option<&[u32]> {
        match self.classes.get(&ec) {
            Some(genes) if !genes.is_empty() => Some(genes),
            _ => None,
        }
    }

    /// Number of known classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_gene_table_from_file() {
        let file = write_temp("tx1\tgeneA\ntx2\tgeneB\ntx3\tgeneA\n# note\n");
        let table = GeneTable::from_file(file.path()).unwrap();

        assert_eq!(table.num_genes(), 2);
        assert_eq!(table.genes(), &["geneA".to_string(), "geneB".to_string()]);
        assert_eq!(table.gene_for_transcript("tx1"), Some(0));
        assert_eq!(table.gene_for_transcript("tx2"), Some(1));
        assert_eq!(table.gene_for_transcript("tx3"), Some(0));
        assert_eq!(table.gene_for_transcript("tx4"), None);
    }

    #[test]
    fn test_gene_table_missing_column() {
        let file = write_temp("tx1\n");
        assert!(matches!(
            GeneTable::from_file(file.path()),
            Err(BusError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn test_gene_order_is_first_appearance() {
        let mut table = GeneTable::new();
        table.insert("tx1", "geneZ");
        table.insert("tx2", "geneA");
        table.insert("tx3", "geneZ");

        assert_eq!(table.genes(), &["geneZ".to_string(), "geneA".to_string()]);
    }

    #[test]
    fn test_ec_map_from_files() {
        let mut table = GeneTable::new();
        table.insert("tx0", "geneA");
        table.insert("tx1", "geneB");
        table.insert("tx2", "geneB");

        let transcripts = write_temp("tx0\ntx1\ntx2\n");
        let ec = write_temp("0\t0\n1\t1,2\n2\t0,1\n");

        let map = EcMap::from_files(ec.path(), transcripts.path(), &table).unwrap();

        assert_eq!(map.resolve(0), Some(&[0u32][..]));
        // tx1 and tx2 collapse to the same gene
        assert_eq!(map.resolve(1), Some(&[1u32][..]));
        assert_eq!(map.resolve(2), Some(&[0u32, 1u32][..]));
        assert_eq!(map.resolve(99), None);
    }

    #[test]
    fn test_ec_map_unknown_transcripts_skipped() {
        let mut table = GeneTable::new();
        table.insert("tx0", "geneA");

        let transcripts = write_temp("tx0\ntx_unknown\n");
        let ec = write_temp("0\t0,1\n1\t1\n");

        let map = EcMap::from_files(ec.path(), transcripts.path(), &table).unwrap();

        assert_eq!(map.resolve(0), Some(&[0u32][..]));
        // All transcripts unknown: resolves to nothing
        assert_eq!(map.resolve(1), None);
    }

    #[test]
    fn test_ec_map_out_of_range_index() {
        let table = GeneTable::new();
        let transcripts = write_temp("tx0\n");
        let ec = write_temp("0\t5\n");

        assert!(matches!(
            EcMap::from_files(ec.path(), transcripts.path(), &table),
            Err(BusError::Parse { line: 1, .. })
        ));
    }
}
