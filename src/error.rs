//! Error types of the estimation drivers.
//!
//! Only configuration problems are fatal. Numerical degeneracies (vanishing
//! variances, correlations reaching one, ill-conditioned regressions) are
//! compensated locally with finite sentinels and surface at most through
//! debug logging; optimizer non-convergence downgrades to a warning and the
//! run proceeds with the best candidate found.

use thiserror::Error;

/// Fatal errors raised before or during an estimation run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EstimationError {
    /// The ensemble does not contain enough entries for a control variate.
    #[error("the model ensemble must contain at least one approximation and one truth entry")]
    EnsembleTooSmall,

    /// The pilot sample cannot support a variance estimate.
    #[error("the pilot sample must contain at least two draws, got {0}")]
    PilotTooSmall(usize),

    /// Online cost recovery was selected but a pilot response carried no
    /// timing metadata.
    #[error(
        "online cost recovery requires timing metadata, but entry {form}/{level} returned none"
    )]
    MissingCostMetadata {
        /// Model form of the offending entry.
        form: usize,
        /// Resolution level of the offending entry.
        level: usize,
    },

    /// A recovered or user-specified cost is unusable.
    #[error("entry {form}/{level} has a non-positive evaluation cost")]
    NonPositiveCost {
        /// Model form of the offending entry.
        form: usize,
        /// Resolution level of the offending entry.
        level: usize,
    },

    /// The multilevel driver requires the same number of resolution levels
    /// for the approximation and the truth form.
    #[error("the approximation and truth forms must expose the same number of levels")]
    LevelMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_entry() {
        let err = EstimationError::MissingCostMetadata { form: 1, level: 3 };
        assert!(err.to_string().contains("1/3"));
    }
}
