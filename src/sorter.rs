use crate::{CandidateArray, Reference, State};
use rayon::prelude::*;
use std::{cmp::Ordering, fmt, sync::Arc};

/// Sorter
///
/// Reorders references without adding or dropping any of them.
pub trait Sorter: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn sort(
        &self,
        candidates: &CandidateArray,
        references: Vec<Reference>,
        state: &State,
    ) -> Vec<Reference>;
}

pub type SorterRef = Arc<dyn Sorter>;

impl<S: Sorter + ?Sized> Sorter for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn sort(
        &self,
        candidates: &CandidateArray,
        references: Vec<Reference>,
        state: &State,
    ) -> Vec<Reference> {
        (**self).sort(candidates, references, state)
    }
}

/// Keeps order produced by the matcher
#[derive(Debug, Clone, Default)]
pub struct IdentitySorter;

impl Sorter for IdentitySorter {
    fn name(&self) -> &str {
        "identity"
    }

    fn sort(
        &self,
        _candidates: &CandidateArray,
        references: Vec<Reference>,
        _state: &State,
    ) -> Vec<Reference> {
        references
    }
}

/// Orders by descending fuzzy score
///
/// Sort is stable, so equally scored references keep the matcher order. References
/// without a score go after the scored ones in ascending position order.
#[derive(Debug, Clone, Default)]
pub struct ScoreSorter;

impl ScoreSorter {
    fn compare(left: &Reference, right: &Reference) -> Ordering {
        match (left.score(), right.score()) {
            (Some(left), Some(right)) => right.cmp(&left),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => left.position().cmp(&right.position()),
        }
    }
}

impl Sorter for ScoreSorter {
    fn name(&self) -> &str {
        "score"
    }

    fn sort(
        &self,
        _candidates: &CandidateArray,
        mut references: Vec<Reference>,
        _state: &State,
    ) -> Vec<Reference> {
        references.par_sort_by(Self::compare);
        references
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::{fuzzy_filter, Filter},
        index::{make_indices, Meta, FUZZY_SCORE},
        scorer::CaseMatching,
        Candidate, Score,
    };
    use anyhow::Error;

    fn scored(position: usize, score: f32) -> Reference {
        Reference::new(position).with(FUZZY_SCORE, Meta::Score(Score::new(score)))
    }

    fn positions(references: &[Reference]) -> Vec<usize> {
        references.iter().map(Reference::position).collect()
    }

    #[test]
    fn test_score_sorter() {
        let state = State::new("");
        let candidates = CandidateArray::default();
        let references = vec![
            Reference::new(4),
            scored(0, 1.0),
            scored(1, 3.0),
            Reference::new(2),
            scored(3, 1.0),
            scored(5, Score::MAX.value()),
        ];
        let result = ScoreSorter.sort(&candidates, references.clone(), &state);
        assert_eq!(positions(&result), vec![5, 1, 0, 3, 2, 4]);
        assert_eq!(result.len(), references.len());

        let result = IdentitySorter.sort(&candidates, references.clone(), &state);
        assert_eq!(result, references);
    }

    #[test]
    fn test_score_sorter_stable() {
        let state = State::new("");
        let candidates = CandidateArray::default();
        let references: Vec<_> = (0..64).rev().map(|position| scored(position, 1.0)).collect();
        let result = ScoreSorter.sort(&candidates, references.clone(), &state);
        assert_eq!(result, references);
    }

    #[test]
    fn test_sort_matched() -> Result<(), Error> {
        let candidates: CandidateArray = ["a_x_b", "ab", "axxxxb"]
            .into_iter()
            .map(Candidate::from)
            .collect();
        let references = fuzzy_filter(CaseMatching::Smart).filter(
            &candidates,
            make_indices(&candidates),
            "ab",
        )?;
        let result = ScoreSorter.sort(&candidates, references, &State::new("ab"));
        // full match first
        assert_eq!(result[0].position(), 1);
        let scores: Vec<_> = result.iter().filter_map(Reference::score).collect();
        assert!(scores.windows(2).all(|pair| pair[0] >= pair[1]));
        Ok(())
    }
}
