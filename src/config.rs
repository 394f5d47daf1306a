//! Run configuration for the quantification pass.

/// Policy for a UMI whose gene set intersects to more than one gene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiGenePolicy {
    /// Drop the UMI group and tally it.
    #[default]
    Discard,
    /// Split one count equally across the candidate genes.
    FractionalSplit,
}

impl MultiGenePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "discard" => Some(Self::Discard),
            "fractional-split" | "fractional_split" => Some(Self::FractionalSplit),
            _ => None,
        }
    }
}

/// Configuration for a quantification run.
///
/// `threads == 0` means use rayon's default (number of CPUs).
#[derive(Debug, Clone)]
pub struct CountConfig {
    /// Expected number of real cells; bounds the knee search window.
    /// None or Some(0) searches the full rank range.
    pub expected_cells: Option<u64>,
    /// Minimum multiplicity ratio before a barcode merges into a
    /// single-substitution neighbor.
    pub correction_multiplier: f64,
    /// What to do with genuinely multi-gene UMIs.
    pub multi_gene_policy: MultiGenePolicy,
    /// Worker thread count (0 = rayon default).
    pub threads: usize,
    /// Moving-average window for smoothing the log-rank curve before
    /// second-derivative estimation.
    pub smoothing_window: usize,
    /// Knee search window as multipliers of expected_cells.
    pub knee_window: (f64, f64),
}

impl Default for CountConfig {
    fn default() -> Self {
        Self {
            expected_cells: None,
            correction_multiplier: 10.0,
            multi_gene_policy: MultiGenePolicy::Discard,
            threads: 0,
            smoothing_window: 7,
            knee_window: (0.1, 10.0),
        }
    }
}

impl CountConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expected_cells(mut self, expected: Option<u64>) -> Self {
        self.expected_cells = expected;
        self
    }

    pub fn with_correction_multiplier(mut self, multiplier: f64) -> Self {
        self.correction_multiplier = multiplier;
        self
    }

    pub fn with_multi_gene_policy(mut self, policy: MultiGenePolicy) -> Self {
        self.multi_gene_policy = policy;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_smoothing_window(mut self, window: usize) -> Self {
        self.smoothing_window = window.max(1);
        self
    }

    pub fn with_knee_window(mut self, lo: f64, hi: f64) -> Self {
        self.knee_window = (lo, hi);
        self
    }
}
