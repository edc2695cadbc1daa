//! Alignments and compressed site patterns.
//!
//! An [`Alignment`] holds one state sequence per taxon. [`Alignment::patterns`]
//! compresses identical columns into weighted [`SitePatterns`] ordered by the tips
//! of a tree. Paired (doublet) sites mark columns evolving under a context-dependent
//! model; they cannot be bootstrapped column by column, and a site claimed by two
//! doublets makes the paired-site fraction undefined.

use crate::tree::Tree;
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatternError {
    #[error("Symbol '{symbol}' is not part of the alphabet")]
    UnknownSymbol { symbol: char },

    #[error("Sequence for '{taxon}' has {found} sites, expected {expected}")]
    RaggedAlignment {
        taxon: String,
        expected: usize,
        found: usize,
    },

    #[error("No sequence for tip '{0}'")]
    MissingTaxon(String),

    #[error("Paired site ({0}, {1}) is out of range or degenerate")]
    InvalidPair(usize, usize),

    #[error("Dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Bootstrapping is incompatible with paired (doublet) sites")]
    BootstrapWithPairedSites,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alphabet {
    symbols: Vec<char>,
    missing: Vec<char>,
}

impl Alphabet {
    pub fn nucleotides() -> Self {
        Self {
            symbols: vec!['A', 'C', 'G', 'T'],
            missing: vec!['-', '?', 'N'],
        }
    }

    /// One state per character; `-` and `?` mark missing data.
    pub fn new(symbols: &str) -> Self {
        Self {
            symbols: symbols.chars().map(|c| c.to_ascii_uppercase()).collect(),
            missing: vec!['-', '?'],
        }
    }

    pub fn state_count(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbols(&self) -> &[char] {
        &self.symbols
    }

    /// `None` for missing data.
    pub fn state_of(&self, symbol: char) -> Result<Option<usize>, PatternError> {
        let upper = symbol.to_ascii_uppercase();
        if let Some(state) = self.symbols.iter().position(|&s| s == upper) {
            return Ok(Some(state));
        }
        if self.missing.contains(&upper) {
            return Ok(None);
        }
        Err(PatternError::UnknownSymbol { symbol })
    }
}

#[derive(Debug, Clone)]
pub struct Alignment {
    alphabet: Alphabet,
    taxa: Vec<String>,
    sequences: Vec<Vec<Option<usize>>>,
    paired_sites: Vec<(usize, usize)>,
}

impl Alignment {
    pub fn new<S: AsRef<str>, T: AsRef<str>>(
        alphabet: Alphabet,
        rows: &[(S, T)],
    ) -> Result<Self, PatternError> {
        let mut taxa = Vec::with_capacity(rows.len());
        let mut sequences = Vec::with_capacity(rows.len());
        let mut expected = None;
        for (taxon, sequence) in rows {
            let states = sequence
                .as_ref()
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| alphabet.state_of(c))
                .collect::<Result<Vec<_>, _>>()?;
            let expected_len = *expected.get_or_insert(states.len());
            if states.len() != expected_len {
                return Err(PatternError::RaggedAlignment {
                    taxon: taxon.as_ref().to_string(),
                    expected: expected_len,
                    found: states.len(),
                });
            }
            taxa.push(taxon.as_ref().to_string());
            sequences.push(states);
        }
        Ok(Self {
            alphabet,
            taxa,
            sequences,
            paired_sites: Vec::new(),
        })
    }

    pub fn with_paired_sites(mut self, pairs: Vec<(usize, usize)>) -> Result<Self, PatternError> {
        let sites = self.site_count();
        if let Some(&(a, b)) = pairs.iter().find(|&&(a, b)| a == b || a >= sites || b >= sites) {
            return Err(PatternError::InvalidPair(a, b));
        }
        self.paired_sites = pairs;
        Ok(self)
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn site_count(&self) -> usize {
        self.sequences.first().map_or(0, Vec::len)
    }

    pub fn paired_sites(&self) -> &[(usize, usize)] {
        &self.paired_sites
    }

    /// True when some site is claimed by more than one doublet.
    pub fn doublets_overlap_on_sequence(&self) -> bool {
        let mut claimed = vec![false; self.site_count()];
        for &(a, b) in &self.paired_sites {
            for site in [a, b] {
                if claimed[site] {
                    return true;
                }
                claimed[site] = true;
            }
        }
        false
    }

    /// Fraction of sites evolving under the doublet model. Reported as NaN when
    /// doublets overlap, since the assignment of sites is then ambiguous.
    pub fn paired_site_fraction(&self) -> f64 {
        if self.doublets_overlap_on_sequence() || self.site_count() == 0 {
            return f64::NAN;
        }
        (2 * self.paired_sites.len()) as f64 / self.site_count() as f64
    }

    /// Compresses the alignment into patterns ordered by the tree's tips.
    pub fn patterns(&self, tree: &Tree) -> Result<SitePatterns, PatternError> {
        let counts = vec![1.0; self.site_count()];
        self.compress(tree, &counts)
    }

    /// Resamples sites with replacement and compresses the replicate.
    pub fn bootstrap_patterns<R: Rng + ?Sized>(
        &self,
        tree: &Tree,
        rng: &mut R,
    ) -> Result<SitePatterns, PatternError> {
        if !self.paired_sites.is_empty() {
            return Err(PatternError::BootstrapWithPairedSites);
        }
        let sites = self.site_count();
        let mut counts = vec![0.0; sites];
        for _ in 0..sites {
            counts[rng.gen_range(0..sites)] += 1.0;
        }
        self.compress(tree, &counts)
    }

    fn compress(&self, tree: &Tree, site_counts: &[f64]) -> Result<SitePatterns, PatternError> {
        let rows: Vec<usize> = tree
            .tip_names()
            .iter()
            .map(|name| {
                self.taxa
                    .iter()
                    .position(|t| t == name)
                    .ok_or_else(|| PatternError::MissingTaxon(name.clone()))
            })
            .collect::<Result<_, _>>()?;

        let mut index: AHashMap<Vec<Option<usize>>, usize> = AHashMap::new();
        let mut columns: Vec<Vec<Option<usize>>> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        for (site, &count) in site_counts.iter().enumerate() {
            if count == 0.0 {
                continue;
            }
            let column: Vec<Option<usize>> = rows.iter().map(|&r| self.sequences[r][site]).collect();
            match index.get(&column) {
                Some(&p) => weights[p] += count,
                None => {
                    index.insert(column.clone(), columns.len());
                    columns.push(column);
                    weights.push(count);
                }
            }
        }

        let state_count = self.alphabet.state_count();
        let mut states = Array2::<usize>::from_elem((rows.len(), columns.len()), state_count);
        for (p, column) in columns.iter().enumerate() {
            for (tip, state) in column.iter().enumerate() {
                if let Some(s) = state {
                    states[[tip, p]] = *s;
                }
            }
        }
        SitePatterns::new(states, Array1::from(weights), state_count)
    }
}

/// Tip states per pattern; the value `state_count` encodes missing data.
#[derive(Debug, Clone)]
pub struct SitePatterns {
    states: Array2<usize>,
    weights: Array1<f64>,
    state_count: usize,
}

impl SitePatterns {
    pub fn new(
        states: Array2<usize>,
        weights: Array1<f64>,
        state_count: usize,
    ) -> Result<Self, PatternError> {
        if weights.len() != states.ncols() {
            return Err(PatternError::DimensionMismatch {
                what: "pattern weights",
                expected: states.ncols(),
                found: weights.len(),
            });
        }
        if let Some(&bad) = states.iter().find(|&&s| s > state_count) {
            return Err(PatternError::DimensionMismatch {
                what: "tip state",
                expected: state_count,
                found: bad,
            });
        }
        Ok(Self {
            states,
            weights,
            state_count,
        })
    }

    pub fn tip_count(&self) -> usize {
        self.states.nrows()
    }

    pub fn pattern_count(&self) -> usize {
        self.states.ncols()
    }

    pub fn state_count(&self) -> usize {
        self.state_count
    }

    pub fn weights(&self) -> ArrayView1<'_, f64> {
        self.weights.view()
    }

    pub fn state(&self, tip: usize, pattern: usize) -> Option<usize> {
        let s = self.states[[tip, pattern]];
        (s < self.state_count).then_some(s)
    }

    /// Indicator partials (pattern × state); missing data is all ones.
    pub fn tip_partials(&self, tip: usize) -> Array2<f64> {
        let mut partials = Array2::<f64>::zeros((self.pattern_count(), self.state_count));
        for (p, mut row) in partials.rows_mut().into_iter().enumerate() {
            match self.state(tip, p) {
                Some(s) => row[s] = 1.0,
                None => row.fill(1.0),
            }
        }
        partials
    }
}
