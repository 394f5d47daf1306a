//! UMI deduplication and per-barcode count aggregation.
//!
//! Records are first partitioned into disjoint groups keyed by
//! canonical barcode (a pure function, tested in isolation), then each
//! group is deduplicated independently. No gene-count contribution
//! ever crosses a barcode boundary, so groups can run on any number of
//! worker threads and the output is a pure function of the input
//! record set and configuration.
//!
//! Within a group, records sharing a UMI go through a two-phase state
//! machine: a collecting phase that maintains the running intersection
//! of candidate gene sets, and a flush phase that resolves each UMI to
//! exactly one outcome. Mutating a gene assignment in place would make
//! the result depend on record arrival order; the intersection does
//! not.

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::bus::BusRecord;
use crate::config::MultiGenePolicy;
use crate::correct::canonical;
use crate::t2g::EcMap;

/// Tallies for records and UMI groups absorbed instead of counted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupMetrics {
    /// Records whose equivalence class is unknown.
    pub dropped_unmapped_class: u64,
    /// UMI groups whose gene sets intersect to nothing.
    pub dropped_ambiguous_umi: u64,
    /// Multi-gene UMI groups dropped under `MultiGenePolicy::Discard`.
    pub dropped_multi_gene: u64,
}

impl DedupMetrics {
    pub fn merge(&mut self, other: &DedupMetrics) {
        self.dropped_unmapped_class += other.dropped_unmapped_class;
        self.dropped_ambiguous_umi += other.dropped_ambiguous_umi;
        self.dropped_multi_gene += other.dropped_multi_gene;
    }
}

/// All observations for one canonical barcode.
///
/// Each observation is a UMI plus the resolved gene-index set of the
/// record's equivalence class.
#[derive(Debug, Clone)]
pub struct BarcodeGroup {
    pub barcode: String,
    pub observations: Vec<(String, Vec<u32>)>,
}

/// Per-barcode gene counts after deduplication.
#[derive(Debug, Clone)]
pub struct BarcodeCounts {
    pub barcode: String,
    pub counts: FxHashMap<u32, f64>,
}

impl BarcodeCounts {
    /// Total UMI count across all genes.
    pub fn total(&self) -> f64 {
        self.counts.values().sum()
    }
}

/// Partition records into disjoint barcode groups.
///
/// Applies barcode canonicalization and equivalence-class resolution;
/// unknown classes are tallied and skipped. Groups come back ordered
/// by canonical barcode, so the partitioning is deterministic and
/// independent of how the caller later schedules them.
pub fn partition_by_barcode(
    records: &[BusRecord],
    correction: &FxHashMap<String, String>,
    ec_map: &EcMap,
) -> (Vec<BarcodeGroup>, DedupMetrics) {
    let mut metrics = DedupMetrics::default();
    let mut groups: FxHashMap<&str, Vec<(String, Vec<u32>)>> = FxHashMap::default();

    for record in records {
        let genes = match ec_map.resolve(record.ec) {
            Some(genes) => genes,
            None => {
                metrics.dropped_unmapped_class += 1;
                continue;
            }
        };
        let barcode = canonical(correction, &record.barcode);
        groups
            .entry(barcode)
            .or_default()
            .push((record.umi.clone(), genes.to_vec()));
    }

    let mut groups: Vec<BarcodeGroup> = groups
        .into_iter()
        .map(|(barcode, observations)| BarcodeGroup {
            barcode: barcode.to_string(),
            observations,
        })
        .collect();
    groups.sort_unstable_by(|a, b| a.barcode.cmp(&b.barcode));

    (groups, metrics)
}

/// Outcome of one (barcode, UMI) group after the collecting phase.
enum UmiResolution {
    /// Intersection narrowed to exactly one gene.
    Assigned(u32),
    /// Intersection holds several genes; policy decides.
    Multi(Vec<u32>),
    /// Conflicting assignments, nothing survives the intersection.
    Ambiguous,
}

/// Intersect a running sorted set with another sorted set in place.
fn intersect_sorted(acc: &mut Vec<u32>, other: &[u32]) {
    acc.retain(|g| other.binary_search(g).is_ok());
}

/// Deduplicate one barcode group.
///
/// Counts one UMI group once toward its resolved gene; PCR and
/// sequencing duplicates of the same molecule collapse.
pub fn dedup_barcode(
    group: &BarcodeGroup,
    policy: MultiGenePolicy,
) -> (BarcodeCounts, DedupMetrics) {
    // Collecting phase: running intersection per UMI. Initial sets are
    // never empty, so an empty vector can only mean a conflict.
    let mut states: FxHashMap<&str, Vec<u32>> = FxHashMap::default();
    for (umi, genes) in &group.observations {
        match states.get_mut(umi.as_str()) {
            Some(acc) => intersect_sorted(acc, genes),
            None => {
                states.insert(umi, genes.clone());
            }
        }
    }

    // Flush phase, in UMI order for reproducible float accumulation.
    let mut umis: Vec<(&str, Vec<u32>)> = states.into_iter().collect();
    umis.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let mut metrics = DedupMetrics::default();
    let mut counts: FxHashMap<u32, f64> = FxHashMap::default();

    for (_, genes) in umis {
        let resolution = match genes.len() {
            0 => UmiResolution::Ambiguous,
            1 => UmiResolution::Assigned(genes[0]),
            _ => UmiResolution::Multi(genes),
        };

        match resolution {
            UmiResolution::Assigned(gene) => {
                *counts.entry(gene).or_default() += 1.0;
            }
            UmiResolution::Ambiguous => {
                metrics.dropped_ambiguous_umi += 1;
            }
            UmiResolution::Multi(genes) => match policy {
                MultiGenePolicy::Discard => {
                    metrics.dropped_multi_gene += 1;
                }
                MultiGenePolicy::FractionalSplit => {
                    let share = 1.0 / genes.len() as f64;
                    for gene in genes {
                        *counts.entry(gene).or_default() += share;
                    }
                }
            },
        }
    }

    (
        BarcodeCounts {
            barcode: group.barcode.clone(),
            counts,
        },
        metrics,
    )
}

/// Deduplicate all barcode groups in parallel.
///
/// The result preserves group (barcode) order regardless of the
/// thread count.
pub fn aggregate(
    groups: &[BarcodeGroup],
    policy: MultiGenePolicy,
) -> (Vec<BarcodeCounts>, DedupMetrics) {
    let results: Vec<(BarcodeCounts, DedupMetrics)> = groups
        .par_iter()
        .map(|group| dedup_barcode(group, policy))
        .collect();

    let mut metrics = DedupMetrics::default();
    let mut counts = Vec::with_capacity(results.len());
    for (barcode_counts, group_metrics) in results {
        metrics.merge(&group_metrics);
        counts.push(barcode_counts);
    }

    (counts, metrics)
}
