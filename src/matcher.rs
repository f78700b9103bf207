use crate::{
    filter::{
        compose_filters_by_pattern, filter_fn, fuzzy_filter, fuzzy_then_substr, regex_filter,
        substr_filter, tokenized, DispatchRule, Filter, FilterRef,
    },
    index::make_indices,
    scorer::CaseMatching,
    CandidateArray, Error, Reference, State,
};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Matcher
///
/// Produces the next processed set of a source from its candidates and the
/// session state. Every call is a total recompute over the current candidates.
pub trait Matcher: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn matches(&self, candidates: &CandidateArray, state: &State)
        -> Result<Vec<Reference>, Error>;
}

pub type MatcherRef = Arc<dyn Matcher>;

impl<M: Matcher + ?Sized> Matcher for Arc<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn matches(
        &self,
        candidates: &CandidateArray,
        state: &State,
    ) -> Result<Vec<Reference>, Error> {
        (**self).matches(candidates, state)
    }
}

/// Matcher that runs a filter with the session query over fresh indices
#[derive(Debug, Clone)]
pub struct FilterMatcher {
    name: String,
    filter: FilterRef,
}

impl FilterMatcher {
    pub fn new(name: impl Into<String>, filter: FilterRef) -> Self {
        Self {
            name: name.into(),
            filter,
        }
    }
}

impl Matcher for FilterMatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(
        &self,
        candidates: &CandidateArray,
        state: &State,
    ) -> Result<Vec<Reference>, Error> {
        self.filter.filter(candidates, make_indices(candidates), state.query())
    }
}

/// Matcher that keeps every candidate
#[derive(Debug, Clone, Default)]
pub struct PassThroughMatcher;

impl Matcher for PassThroughMatcher {
    fn name(&self) -> &str {
        "all"
    }

    fn matches(
        &self,
        candidates: &CandidateArray,
        _state: &State,
    ) -> Result<Vec<Reference>, Error> {
        Ok(make_indices(candidates))
    }
}

type FilterBuilder = fn(CaseMatching) -> Result<FilterRef, Error>;

lazy_static::lazy_static! {
    static ref MATCHERS: BTreeMap<&'static str, FilterBuilder> = {
        let mut matchers: BTreeMap<&'static str, FilterBuilder> = BTreeMap::new();
        // whole query as a single fuzzy pattern
        matchers.insert("fuzzy", |case| Ok(fuzzy_filter(case)));
        // every token must be a literal sub-string
        matchers.insert("substr", |case| Ok(tokenized(substr_filter(case))));
        // whole query as a regular expression
        matchers.insert("regex", |case| Ok(regex_filter(case)));
        // every token must be a fuzzy match
        matchers.insert("tokens", |case| Ok(tokenized(fuzzy_filter(case))));
        // first token is fuzzy matched, the rest narrow by literal sub-string
        matchers.insert("cascade", |case| Ok(tokenized(fuzzy_then_substr(case))));
        matchers.insert("prefix", prefix_filter);
        matchers
    };
}

/// Names of all registered matchers
pub fn matcher_names() -> impl Iterator<Item = &'static str> {
    MATCHERS.keys().copied()
}

/// Filter of the registered matcher
pub fn matcher_filter(name: &str, case: CaseMatching) -> Result<FilterRef, Error> {
    let builder = MATCHERS.get(name).ok_or_else(|| {
        Error::config(format!(
            "unknown matcher \"{}\" (expected one of: {})",
            name,
            matcher_names().collect::<Vec<_>>().join(", ")
        ))
    })?;
    builder(case)
}

/// Registered matcher by its name
pub fn matcher_by_name(name: &str, case: CaseMatching) -> Result<MatcherRef, Error> {
    Ok(Arc::new(FilterMatcher::new(name, matcher_filter(name, case)?)))
}

/// Per-token dispatch: `'token` literal, `/token` regex, `!token` negated
/// literal, anything else fuzzy
pub fn prefix_filter(case: CaseMatching) -> Result<FilterRef, Error> {
    let rules = vec![
        DispatchRule::new(r"^'(.*)", Some(1), [substr_filter(case)])?,
        DispatchRule::new(r"^/(.*)", Some(1), [regex_filter(case)])?,
        DispatchRule::new(r"^!(.*)", Some(1), [negate(substr_filter(case))])?,
        DispatchRule::default_rule([fuzzy_filter(case)]),
    ];
    Ok(compose_filters_by_pattern(rules))
}

// Keeps references rejected by the inner filter, metadata is left untouched
fn negate(filter: FilterRef) -> FilterRef {
    filter_fn("negate", move |candidates, references, pattern| {
        let mut matched = filter
            .filter(candidates, references.clone(), pattern)?
            .into_iter()
            .map(|reference| reference.position())
            .peekable();
        Ok(references
            .into_iter()
            .filter(|reference| {
                // inner filter keeps order, so matched positions are a subsequence
                if matched.peek() == Some(&reference.position()) {
                    matched.next();
                    false
                } else {
                    true
                }
            })
            .collect())
    })
}
