//! Validator-set arithmetic and proposer rotation checks.

use alloy_primitives::Address;
use thiserror::Error;

/// Maximum number of faulty validators tolerated in a set of `n` (`n >= 3f + 1`).
pub fn max_faults(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// Number of validators required for progress in a set of `n`.
pub fn quorum(n: usize) -> usize {
    n - max_faults(n)
}

/// Ways an observed proposer sequence can deviate from round robin.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Violation {
    #[error("no validators")]
    NoValidators,
    #[error("proposer {proposer} at {index} is not a validator")]
    Unknown { index: usize, proposer: Address },
    #[error("proposer at {index} follows {previous} out of turn: {proposer}")]
    OutOfTurn {
        index: usize,
        previous: Address,
        proposer: Address,
    },
    #[error("{validator} proposed {count} times, expected {expected}")]
    Unequal {
        validator: Address,
        count: usize,
        expected: usize,
    },
}

/// Check that `proposers` (one per consecutive block) rotates through `validators` in order.
///
/// Each proposer must be the successor (cyclically, in `validators` order) of the previous one.
/// When the sequence covers a whole number of rounds, every validator must also appear the same
/// number of times.
pub fn verify_round_robin(validators: &[Address], proposers: &[Address]) -> Result<(), Violation> {
    if validators.is_empty() {
        return Err(Violation::NoValidators);
    }
    let position = |index: usize, proposer: &Address| {
        validators
            .iter()
            .position(|validator| validator == proposer)
            .ok_or(Violation::Unknown {
                index,
                proposer: *proposer,
            })
    };

    let mut counts = vec![0usize; validators.len()];
    let mut previous: Option<usize> = None;
    for (index, proposer) in proposers.iter().enumerate() {
        let current = position(index, proposer)?;
        if let Some(previous) = previous {
            if current != (previous + 1) % validators.len() {
                return Err(Violation::OutOfTurn {
                    index,
                    previous: validators[previous],
                    proposer: *proposer,
                });
            }
        }
        counts[current] += 1;
        previous = Some(current);
    }

    if proposers.len() % validators.len() == 0 {
        let expected = proposers.len() / validators.len();
        for (validator, count) in validators.iter().zip(counts) {
            if count != expected {
                return Err(Violation::Unequal {
                    validator: *validator,
                    count,
                    expected,
                });
            }
        }
    }
    Ok(())
}
