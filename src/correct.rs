//! One-hop barcode error correction.
//!
//! A sequencing error in a frequently observed cell barcode spawns a
//! low-count phantom barcode one substitution away. Correction merges
//! such a phantom into its dominant neighbor when the neighbor's total
//! read multiplicity is at least `correction_multiplier` times larger.
//!
//! This is deliberately not a clustering step: each barcode merges
//! into at most one canonical form and canonicalization is applied
//! once, never iterated to a fixed point. A chain of near-identical
//! barcodes where only adjacent pairs meet the threshold will not
//! fully collapse.

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::bus::BusRecord;

/// Bases bustools can emit in a barcode.
const ALPHABET: &[u8] = b"ACGTN";

/// Sum read multiplicities per observed barcode.
///
/// These are raw read counts, not yet UMI-deduplicated; correction
/// decisions are made on read support.
pub fn barcode_totals(records: &[BusRecord]) -> FxHashMap<String, u64> {
    let mut totals: FxHashMap<String, u64> = FxHashMap::default();
    for record in records {
        *totals.entry(record.barcode.clone()).or_default() += record.count as u64;
    }
    totals
}

/// Build the observed-barcode to canonical-barcode map.
///
/// Only merged barcodes appear in the result; a barcode absent from
/// the map is its own canonical form. A merge requires an observed
/// single-substitution neighbor whose total strictly dominates and is
/// at least `multiplier` times this barcode's total; ties and
/// comparable magnitudes are left uncorrected. When several neighbors
/// qualify, the highest-count one wins, lexically smallest on a tie,
/// so the result is deterministic.
pub fn correction_map(
    totals: &FxHashMap<String, u64>,
    multiplier: f64,
) -> FxHashMap<String, String> {
    // Sorted barcode list for deterministic parallel iteration.
    let mut barcodes: Vec<&String> = totals.keys().collect();
    barcodes.sort_unstable();

    barcodes
        .par_iter()
        .filter_map(|barcode| {
            let own = totals[*barcode];
            let mut best: Option<(u64, String)> = None;

            let mut variant = (*barcode).clone().into_bytes();
            for pos in 0..variant.len() {
                let original = variant[pos];
                for &base in ALPHABET {
                    if base == original {
                        continue;
                    }
                    variant[pos] = base;
                    if let Some(&neighbor_total) =
                        totals.get(std::str::from_utf8(&variant).unwrap_or(""))
                    {
                        if neighbor_total > own
                            && neighbor_total as f64 >= multiplier * own as f64
                        {
                            let candidate = String::from_utf8(variant.clone()).unwrap_or_default();
                            let better = match &best {
                                None => true,
                                Some((count, name)) => {
                                    neighbor_total > *count
                                        || (neighbor_total == *count && candidate < *name)
                                }
                            };
                            if better {
                                best = Some((neighbor_total, candidate));
                            }
                        }
                    }
                }
                variant[pos] = original;
            }

            best.map(|(_, target)| ((*barcode).clone(), target))
        })
        .collect()
}

/// Resolve a barcode to its canonical form, one hop only.
#[inline]
pub fn canonical<'a>(map: &'a FxHashMap<String, String>, barcode: &'a str) -> &'a str {
    map.get(barcode).map(String::as_str).unwrap_or(barcode)
}
