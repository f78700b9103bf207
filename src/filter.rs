//! Filters and their composition
//!
//! A filter maps `(candidates, references, pattern)` to a new sequence of
//! references. Filters built from predicates keep the input order and only drop
//! references, composite filters are built with the functions of this module.
use crate::{
    common::tokens,
    index::{resolve, FUZZY_SCORE},
    scorer::{CaseMatching, FuzzyPredicate, Predicate, RegexPredicate, SubstrPredicate},
    CandidateArray, Error, Reference,
};
use rayon::prelude::*;
use regex::Regex;
use std::{fmt, sync::Arc};

/// Filter
pub trait Filter: Send + Sync + fmt::Debug {
    fn filter(
        &self,
        candidates: &CandidateArray,
        references: Vec<Reference>,
        pattern: &str,
    ) -> Result<Vec<Reference>, Error>;
}

pub type FilterRef = Arc<dyn Filter>;

impl<F: Filter + ?Sized> Filter for Arc<F> {
    fn filter(
        &self,
        candidates: &CandidateArray,
        references: Vec<Reference>,
        pattern: &str,
    ) -> Result<Vec<Reference>, Error> {
        (**self).filter(candidates, references, pattern)
    }
}

/// Filter that applies predicate to every reference keeping only passing ones
#[derive(Debug, Clone)]
pub struct PredicateFilter<P> {
    predicate: P,
}

impl<P: Predicate> PredicateFilter<P> {
    pub fn new(predicate: P) -> Self {
        Self { predicate }
    }
}

impl<P: Predicate> Filter for PredicateFilter<P> {
    fn filter(
        &self,
        candidates: &CandidateArray,
        references: Vec<Reference>,
        pattern: &str,
    ) -> Result<Vec<Reference>, Error> {
        // empty pattern matches everything
        if pattern.is_empty() {
            return Ok(references);
        }
        let scorer = self.predicate.scorer(pattern)?;
        Ok(references
            .into_par_iter()
            .filter_map(|reference| {
                let value = resolve(candidates, &reference)?;
                scorer.test(value, reference)
            })
            .collect())
    }
}

/// Create filter from predicate
pub fn predicate_filter<P: Predicate + 'static>(predicate: P) -> FilterRef {
    Arc::new(PredicateFilter::new(predicate))
}

/// Order-preserving subsequence filter
pub fn fuzzy_filter(case: CaseMatching) -> FilterRef {
    predicate_filter(FuzzyPredicate { case })
}

/// Literal sub-string filter
pub fn substr_filter(case: CaseMatching) -> FilterRef {
    predicate_filter(SubstrPredicate { case })
}

/// Regular expression filter
pub fn regex_filter(case: CaseMatching) -> FilterRef {
    predicate_filter(RegexPredicate { case })
}

/// Sequential pipe: output of each filter is the input of the next one
#[derive(Debug, Clone)]
pub struct Pipe {
    filters: Vec<FilterRef>,
}

impl Filter for Pipe {
    fn filter(
        &self,
        candidates: &CandidateArray,
        references: Vec<Reference>,
        pattern: &str,
    ) -> Result<Vec<Reference>, Error> {
        self.filters
            .iter()
            .try_fold(references, |references, filter| {
                filter.filter(candidates, references, pattern)
            })
    }
}

pub fn pipe(filters: impl IntoIterator<Item = FilterRef>) -> FilterRef {
    Arc::new(Pipe {
        filters: filters.into_iter().collect(),
    })
}

/// Tokenized AND: wrapped filter is applied once per whitespace separated token
#[derive(Debug, Clone)]
pub struct Tokenized {
    filter: FilterRef,
}

impl Filter for Tokenized {
    fn filter(
        &self,
        candidates: &CandidateArray,
        references: Vec<Reference>,
        pattern: &str,
    ) -> Result<Vec<Reference>, Error> {
        tokens(pattern).try_fold(references, |references, token| {
            self.filter.filter(candidates, references, token)
        })
    }
}

pub fn tokenized(filter: FilterRef) -> FilterRef {
    Arc::new(Tokenized { filter })
}

/// Drops the first token of the pattern, the rest is passed to the wrapped filter
///
/// If nothing is left after the first token, references are passed through unchanged.
#[derive(Debug, Clone)]
pub struct DropFirstToken {
    filter: FilterRef,
}

impl Filter for DropFirstToken {
    fn filter(
        &self,
        candidates: &CandidateArray,
        references: Vec<Reference>,
        pattern: &str,
    ) -> Result<Vec<Reference>, Error> {
        let rest = tokens(pattern).skip(1).collect::<Vec<_>>().join(" ");
        if rest.is_empty() {
            return Ok(references);
        }
        self.filter.filter(candidates, references, &rest)
    }
}

pub fn drop_first_token(filter: FilterRef) -> FilterRef {
    Arc::new(DropFirstToken { filter })
}

/// Rule of the per-token prefix dispatch
#[derive(Debug, Clone)]
pub struct DispatchRule {
    // `None` is the default rule which matches any token
    prefix: Option<Regex>,
    group: Option<usize>,
    filter: FilterRef,
}

impl DispatchRule {
    /// Rule used for tokens matching `prefix`, sub-pattern is taken from the
    /// capture `group` or the whole token if no group is given
    pub fn new(
        prefix: &str,
        group: Option<usize>,
        filters: impl IntoIterator<Item = FilterRef>,
    ) -> Result<Self, Error> {
        Ok(Self {
            prefix: Some(Regex::new(prefix)?),
            group,
            filter: pipe(filters),
        })
    }

    /// Rule that matches any token
    pub fn default_rule(filters: impl IntoIterator<Item = FilterRef>) -> Self {
        Self {
            prefix: None,
            group: None,
            filter: pipe(filters),
        }
    }

    /// Sub-pattern extracted from the token if the rule matches
    fn matches<'a>(&self, token: &'a str) -> Option<&'a str> {
        match &self.prefix {
            None => Some(token),
            Some(prefix) => match self.group {
                None => prefix.is_match(token).then_some(token),
                Some(group) => {
                    let captures = prefix.captures(token)?;
                    Some(captures.get(group).map_or("", |found| found.as_str()))
                }
            },
        }
    }
}

/// Per-token prefix dispatch
///
/// Each token is routed to the first rule that matches it, the extracted
/// sub-pattern narrows the references through the filters of that rule.
#[derive(Debug, Clone)]
pub struct PatternDispatch {
    rules: Vec<DispatchRule>,
}

impl Filter for PatternDispatch {
    fn filter(
        &self,
        candidates: &CandidateArray,
        references: Vec<Reference>,
        pattern: &str,
    ) -> Result<Vec<Reference>, Error> {
        tokens(pattern).try_fold(references, |references, token| {
            let routed = self
                .rules
                .iter()
                .find_map(|rule| Some((rule, rule.matches(token)?)));
            match routed {
                Some((rule, sub_pattern)) if !sub_pattern.is_empty() => {
                    rule.filter.filter(candidates, references, sub_pattern)
                }
                _ => Ok(references),
            }
        })
    }
}

pub fn compose_filters_by_pattern(rules: impl IntoIterator<Item = DispatchRule>) -> FilterRef {
    Arc::new(PatternDispatch {
        rules: rules.into_iter().collect(),
    })
}

/// Fuzzy match unless references were already fuzzy scored, in which case
/// literal sub-string match is used
#[derive(Debug, Clone)]
pub struct FuzzyThenSubstr {
    fuzzy: FilterRef,
    substr: FilterRef,
}

impl Filter for FuzzyThenSubstr {
    fn filter(
        &self,
        candidates: &CandidateArray,
        references: Vec<Reference>,
        pattern: &str,
    ) -> Result<Vec<Reference>, Error> {
        let scored = references
            .first()
            .map_or(false, |reference| reference.contains(FUZZY_SCORE));
        if scored {
            self.substr.filter(candidates, references, pattern)
        } else {
            self.fuzzy.filter(candidates, references, pattern)
        }
    }
}

pub fn fuzzy_then_substr(case: CaseMatching) -> FilterRef {
    Arc::new(FuzzyThenSubstr {
        fuzzy: fuzzy_filter(case),
        substr: substr_filter(case),
    })
}

type FilterFnInner =
    dyn Fn(&CandidateArray, Vec<Reference>, &str) -> Result<Vec<Reference>, Error> + Send + Sync;

/// Filter defined by a plain function
#[derive(Clone)]
pub struct FilterFn {
    name: String,
    func: Arc<FilterFnInner>,
}

impl fmt::Debug for FilterFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterFn").field("name", &self.name).finish()
    }
}

impl Filter for FilterFn {
    fn filter(
        &self,
        candidates: &CandidateArray,
        references: Vec<Reference>,
        pattern: &str,
    ) -> Result<Vec<Reference>, Error> {
        (self.func)(candidates, references, pattern)
    }
}

pub fn filter_fn<F>(name: impl Into<String>, func: F) -> FilterRef
where
    F: Fn(&CandidateArray, Vec<Reference>, &str) -> Result<Vec<Reference>, Error>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FilterFn {
        name: name.into(),
        func: Arc::new(func),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        index::{make_indices, Meta, FUZZY_OFFSETS, MATCH_RANGES},
        scorer::PredicateFn,
        Candidate,
    };
    use anyhow::Error;
    use std::collections::BTreeSet;

    fn array(items: &[&str]) -> CandidateArray {
        items.iter().copied().map(Candidate::from).collect()
    }

    fn positions(references: &[Reference]) -> Vec<usize> {
        references.iter().map(Reference::position).collect()
    }

    #[test]
    fn test_predicate_filter_keeps_order() -> Result<(), Error> {
        let candidates = array(&["xbxa", "ab", "b", "aab", "ba"]);
        let filter = substr_filter(CaseMatching::Smart);
        let result = filter.filter(&candidates, make_indices(&candidates), "a")?;
        assert_eq!(positions(&result), vec![0, 1, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_empty_pattern_identity() -> Result<(), Error> {
        let candidates = array(&["one", "two", "three"]);
        let indices = make_indices(&candidates);
        for filter in [
            substr_filter(CaseMatching::Smart),
            fuzzy_filter(CaseMatching::Smart),
            tokenized(substr_filter(CaseMatching::Smart)),
        ] {
            let result = filter.filter(&candidates, indices.clone(), "")?;
            assert_eq!(result, indices);
        }
        Ok(())
    }

    #[test]
    fn test_fuzzy_end_to_end() -> Result<(), Error> {
        let candidates = array(&["apple", "banana", "grape"]);
        let result = fuzzy_filter(CaseMatching::Smart).filter(
            &candidates,
            make_indices(&candidates),
            "ap",
        )?;
        // "grape" has 'a' followed by 'p' as well
        assert_eq!(positions(&result), vec![0, 2]);
        assert_eq!(
            result[0].get(FUZZY_OFFSETS).and_then(Meta::as_offsets),
            Some(&[0, 1][..])
        );
        Ok(())
    }

    #[test]
    fn test_tokenized_and() -> Result<(), Error> {
        let candidates = array(&["foo.txt", "bar.txt", "foobar.txt"]);
        let filter = tokenized(substr_filter(CaseMatching::Smart));
        let result = filter.filter(&candidates, make_indices(&candidates), "foo bar")?;
        assert_eq!(positions(&result), vec![2]);
        assert_eq!(
            result[0].get(MATCH_RANGES).and_then(Meta::as_ranges),
            Some(&[0..3, 3..6][..])
        );
        Ok(())
    }

    #[test]
    fn test_tokenized_associative() -> Result<(), Error> {
        let candidates = array(&[
            "src/main.rs",
            "src/lib.rs",
            "benches/scorer.rs",
            "src/scorer.rs",
            "README.md",
            "Cargo.toml",
        ]);
        let filter = tokenized(fuzzy_filter(CaseMatching::Smart));
        let indices = make_indices(&candidates);
        let once = filter.filter(&candidates, indices.clone(), "s r rs")?;
        let split = filter.filter(&candidates, indices.clone(), "s r")?;
        let split = filter.filter(&candidates, split, "rs")?;
        let reversed = filter.filter(&candidates, indices, "rs r s")?;
        let set = |refs: &[Reference]| positions(refs).into_iter().collect::<BTreeSet<_>>();
        assert_eq!(set(&once), set(&split));
        assert_eq!(set(&once), set(&reversed));
        Ok(())
    }

    #[test]
    fn test_drop_first_token() -> Result<(), Error> {
        let candidates = array(&["alpha", "beta", "gamma"]);
        let filter = drop_first_token(substr_filter(CaseMatching::Smart));
        let indices = make_indices(&candidates);
        let result = filter.filter(&candidates, indices.clone(), "seed")?;
        assert_eq!(result, indices);
        let result = filter.filter(&candidates, indices.clone(), "seed  mm")?;
        assert_eq!(positions(&result), vec![2]);
        Ok(())
    }

    #[test]
    fn test_pipe() -> Result<(), Error> {
        let candidates = array(&["one", "two", "tone", "once"]);
        let filter = pipe([
            substr_filter(CaseMatching::Smart),
            predicate_filter(PredicateFn::new("short", |value, reference, _| {
                (value.len() <= 3).then_some(reference)
            })),
        ]);
        let result = filter.filter(&candidates, make_indices(&candidates), "on")?;
        assert_eq!(positions(&result), vec![0]);
        Ok(())
    }

    #[test]
    fn test_dispatch_by_prefix() -> Result<(), Error> {
        let candidates = array(&["foo.rs", "bar.rs", "foo_bar.rs", "star"]);
        // routes "*token" to literal match against the text after the star
        let rules = vec![
            DispatchRule::new(r"^\*(.*)", Some(1), [substr_filter(CaseMatching::Smart)])?,
            DispatchRule::default_rule([fuzzy_filter(CaseMatching::Smart)]),
        ];
        let filter = compose_filters_by_pattern(rules);
        let indices = make_indices(&candidates);

        let result = filter.filter(&candidates, indices.clone(), "*foo bar")?;
        assert_eq!(positions(&result), vec![2]);
        assert!(result[0].contains(MATCH_RANGES));
        assert!(result[0].contains(FUZZY_SCORE));

        // empty sub-pattern does not narrow
        let result = filter.filter(&candidates, indices.clone(), "*")?;
        assert_eq!(result, indices);

        // first matching rule wins
        let rules = vec![
            DispatchRule::new(r"^b", None, [substr_filter(CaseMatching::Smart)])?,
            DispatchRule::new(r"^b", None, [fuzzy_filter(CaseMatching::Smart)])?,
        ];
        let filter = compose_filters_by_pattern(rules);
        let result = filter.filter(&candidates, indices, "bar")?;
        assert_eq!(positions(&result), vec![1, 2]);
        assert!(result.iter().all(|r| !r.contains(FUZZY_SCORE)));
        Ok(())
    }

    #[test]
    fn test_fuzzy_then_substr() -> Result<(), Error> {
        let candidates = array(&["src/filter.rs", "src/fixture.rs", "tests/filter_test.rs"]);
        let filter = tokenized(fuzzy_then_substr(CaseMatching::Smart));
        let result = filter.filter(&candidates, make_indices(&candidates), "sfr ter")?;
        // "sfr" is fuzzy, "ter" is a literal refinement
        assert_eq!(positions(&result), vec![0, 2]);
        assert!(result.iter().all(|r| r.contains(MATCH_RANGES)));
        Ok(())
    }

    #[test]
    fn test_malformed_pattern() {
        let candidates = array(&["one"]);
        let result = regex_filter(CaseMatching::Smart).filter(
            &candidates,
            make_indices(&candidates),
            "[a-",
        );
        assert!(result.is_err());
    }
}
