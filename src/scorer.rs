use crate::{
    index::{accumulate, Combine, Meta, Offsets, FUZZY_OFFSETS, FUZZY_SCORE, MATCH_RANGES},
    Error, Reference,
};
use regex::{Regex, RegexBuilder};
use std::{cell::RefCell, cmp::Ordering, fmt, ops::Add, sync::Arc};

thread_local! {
    static HAYSTACK: RefCell<Vec<char>> = const { RefCell::new(Vec::new()) };
}

/// Case sensitivity of the predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseMatching {
    Ignore,
    Respect,
    /// Case sensitive only if pattern contains an uppercase character
    #[default]
    Smart,
}

impl CaseMatching {
    /// Whether haystack and needle characters must be folded before comparison
    pub fn fold(&self, pattern: &str) -> bool {
        match self {
            CaseMatching::Ignore => true,
            CaseMatching::Respect => false,
            CaseMatching::Smart => !pattern.chars().any(char::is_uppercase),
        }
    }
}

// Single char folding, keeps offsets aligned with the original characters
fn fold_char(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

// Run scope with characters of the value, folded if requested
fn with_haystack<S, R>(value: &str, fold: bool, scope: S) -> R
where
    S: FnOnce(&[char]) -> R,
{
    HAYSTACK.with(|target| {
        let mut target = target.borrow_mut();
        target.clear();
        if fold {
            target.extend(value.chars().map(fold_char));
        } else {
            target.extend(value.chars());
        }
        scope(target.as_slice())
    })
}

/// Scorer
///
/// Predicate specialised to a single pattern. Testing a candidate value either
/// rejects it or returns the reference with metadata attached.
pub trait Scorer: Send + Sync + fmt::Debug {
    /// Name of the scorer
    fn name(&self) -> &str;

    /// Pattern this scorer was built for
    fn needle(&self) -> &str;

    /// Test candidate value
    fn test(&self, value: &str, reference: Reference) -> Option<Reference>;
}

impl<S: Scorer + ?Sized> Scorer for &S {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn needle(&self) -> &str {
        (**self).needle()
    }
    fn test(&self, value: &str, reference: Reference) -> Option<Reference> {
        (**self).test(value, reference)
    }
}

impl<T: Scorer + ?Sized> Scorer for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn needle(&self) -> &str {
        (**self).needle()
    }
    fn test(&self, value: &str, reference: Reference) -> Option<Reference> {
        (**self).test(value, reference)
    }
}

impl<T: Scorer + ?Sized> Scorer for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn needle(&self) -> &str {
        (**self).needle()
    }
    fn test(&self, value: &str, reference: Reference) -> Option<Reference> {
        (**self).test(value, reference)
    }
}

/// Predicate
///
/// `(candidate value, reference, pattern) -> reference | reject`. Depends only on
/// its arguments, [Predicate::scorer] specialises it for a pattern once per filter pass.
pub trait Predicate: Send + Sync + fmt::Debug {
    /// Name of the predicate
    fn name(&self) -> &str;

    /// Build scorer for the pattern, fails if the pattern is malformed
    fn scorer(&self, pattern: &str) -> Result<Arc<dyn Scorer>, Error>;

    /// Apply predicate to a single candidate value
    fn apply(
        &self,
        value: &str,
        reference: Reference,
        pattern: &str,
    ) -> Result<Option<Reference>, Error> {
        Ok(self.scorer(pattern)?.test(value, reference))
    }
}

impl<P: Predicate + ?Sized> Predicate for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn scorer(&self, pattern: &str) -> Result<Arc<dyn Scorer>, Error> {
        (**self).scorer(pattern)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Score(f32);

impl Score {
    pub const MIN: Score = Score(f32::NEG_INFINITY);
    pub const MAX: Score = Score(f32::INFINITY);

    pub const fn new(score: f32) -> Score {
        Score(score)
    }

    pub fn value(&self) -> f32 {
        self.0
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Add for Score {
    type Output = Score;

    fn add(self, other: Score) -> Score {
        Score(self.0 + other.0)
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Knuth-Morris-Pratt pattern
#[derive(Debug, Clone)]
pub struct KMPPattern<T> {
    needle: Vec<T>,
    table: Vec<usize>,
}

impl<T: PartialEq> KMPPattern<T> {
    pub fn new(needle: Vec<T>) -> Self {
        if needle.is_empty() {
            return Self {
                needle,
                table: Vec::new(),
            };
        }
        let mut table = vec![0; needle.len()];
        let mut i = 0;
        for j in 1..needle.len() {
            while i > 0 && needle[i] != needle[j] {
                i = table[i - 1];
            }
            if needle[i] == needle[j] {
                i += 1;
            }
            table[j] = i;
        }
        Self { needle, table }
    }

    pub fn len(&self) -> usize {
        self.needle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.needle.is_empty()
    }

    /// Search for the match in the haystack, return start of the match on success
    pub fn search(&self, haystack: impl AsRef<[T]>) -> Option<usize> {
        if self.needle.is_empty() {
            return None;
        }
        let mut n_index = 0;
        for (h_index, h) in haystack.as_ref().iter().enumerate() {
            while n_index > 0 && self.needle[n_index] != *h {
                n_index = self.table[n_index - 1];
            }
            if self.needle[n_index] == *h {
                n_index += 1;
            }
            if n_index == self.needle.len() {
                return Some(h_index + 1 - n_index);
            }
        }
        None
    }
}

/// Literal sub-string scorer
///
/// Finds the whole needle as an uninterrupted sequence of characters inside
/// the haystack and attaches the matched character range.
#[derive(Debug, Clone)]
pub struct SubstrScorer {
    needle: String,
    pattern: KMPPattern<char>,
    fold: bool,
}

impl SubstrScorer {
    pub fn new(needle: &str, case: CaseMatching) -> Self {
        let fold = case.fold(needle);
        let chars = if fold {
            needle.chars().map(fold_char).collect()
        } else {
            needle.chars().collect()
        };
        Self {
            needle: needle.to_owned(),
            pattern: KMPPattern::new(chars),
            fold,
        }
    }
}

impl Scorer for SubstrScorer {
    fn name(&self) -> &str {
        "substr"
    }

    fn needle(&self) -> &str {
        &self.needle
    }

    fn test(&self, value: &str, reference: Reference) -> Option<Reference> {
        if self.pattern.is_empty() {
            return Some(reference);
        }
        let start = with_haystack(value, self.fold, |haystack| self.pattern.search(haystack))?;
        let range = start..start + self.pattern.len();
        Some(reference.update([(MATCH_RANGES, Meta::Ranges(vec![range]), accumulate as Combine)]))
    }
}

/// Regular expression scorer
#[derive(Debug, Clone)]
pub struct RegexScorer {
    needle: String,
    regex: Regex,
}

impl RegexScorer {
    pub fn new(needle: &str, case: CaseMatching) -> Result<Self, Error> {
        let regex = RegexBuilder::new(needle)
            .case_insensitive(case.fold(needle))
            .build()?;
        Ok(Self {
            needle: needle.to_owned(),
            regex,
        })
    }
}

impl Scorer for RegexScorer {
    fn name(&self) -> &str {
        "regex"
    }

    fn needle(&self) -> &str {
        &self.needle
    }

    fn test(&self, value: &str, reference: Reference) -> Option<Reference> {
        let found = self.regex.find(value)?;
        // byte offsets to character offsets
        let start = value[..found.start()].chars().count();
        let end = start + found.as_str().chars().count();
        Some(reference.update([(MATCH_RANGES, Meta::Ranges(vec![start..end]), accumulate as Combine)]))
    }
}

/// Fuzzy scorer
///
/// This will match any haystack item as long as the needle is a sub-sequence of the haystack.
#[derive(Clone, Debug)]
pub struct FuzzyScorer {
    needle: Vec<char>,
    needle_str: String,
    fold: bool,
}

const SCORE_GAP_LEADING: f32 = -0.005;
const SCORE_GAP_TRAILING: f32 = -0.005;
const SCORE_GAP_INNER: f32 = -0.01;
const SCORE_MATCH_CONSECUTIVE: f32 = 1.0;
const SCORE_MATCH_SLASH: f32 = 0.9;
const SCORE_MATCH_WORD: f32 = 0.8;
const SCORE_MATCH_CAPITAL: f32 = 0.7;
const SCORE_MATCH_DOT: f32 = 0.6;

thread_local! {
    static DATA_CELL: RefCell<Vec<f32>> = const { RefCell::new(Vec::new()) };
}

impl FuzzyScorer {
    pub fn new(needle: &str, case: CaseMatching) -> Self {
        let fold = case.fold(needle);
        let chars = if fold {
            needle.chars().map(fold_char).collect()
        } else {
            needle.chars().collect()
        };
        Self {
            needle: chars,
            needle_str: needle.to_owned(),
            fold,
        }
    }

    /// Score haystack characters (already folded if the scorer folds)
    ///
    /// Returns score and matched offsets, one offset per needle character.
    pub fn score_ref(&self, haystack: &[char]) -> Option<(Score, Offsets)> {
        if !Self::subseq(&self.needle, haystack) {
            return None;
        }
        Some(Self::score_impl(&self.needle, haystack))
    }

    fn bonus(haystack: &[char], bonus: &mut [f32]) {
        let mut c_prev = '/';
        for (i, c) in haystack.iter().enumerate() {
            bonus[i] = if c.is_lowercase() || c.is_ascii_digit() {
                match c_prev {
                    '/' | '\\' => SCORE_MATCH_SLASH,
                    '-' | '_' | ' ' => SCORE_MATCH_WORD,
                    '.' => SCORE_MATCH_DOT,
                    _ => 0.0,
                }
            } else if c.is_uppercase() {
                match c_prev {
                    '/' | '\\' => SCORE_MATCH_SLASH,
                    '-' | '_' | ' ' => SCORE_MATCH_WORD,
                    '.' => SCORE_MATCH_DOT,
                    p if p.is_lowercase() => SCORE_MATCH_CAPITAL,
                    _ => 0.0,
                }
            } else {
                0.0
            };
            c_prev = *c;
        }
    }

    fn subseq(needle: &[char], haystack: &[char]) -> bool {
        let mut n_iter = needle.iter();
        let mut n = if let Some(n) = n_iter.next() {
            n
        } else {
            return true;
        };
        for h in haystack {
            if n == h {
                n = if let Some(n_next) = n_iter.next() {
                    n_next
                } else {
                    return true;
                };
            }
        }
        false
    }

    // This function is only called when we know that needle is a sub-sequence of
    // the haystack string.
    fn score_impl(needle: &[char], haystack: &[char]) -> (Score, Offsets) {
        let n_len = needle.len();
        let h_len = haystack.len();

        if n_len == 0 || n_len == h_len {
            // full match
            return (Score::MAX, (0..n_len).collect());
        }

        // use thread local storage for all data needed for calculating score and positions
        let mut data = DATA_CELL.with(|data_cell| data_cell.take());
        data.clear();
        data.resize(n_len * h_len * 2 + h_len, 0.0);

        let (score_bonus, matrix_data) = data.split_at_mut(h_len);
        let (score_ends_data, score_best_data) = matrix_data.split_at_mut(n_len * h_len);
        Self::bonus(haystack, score_bonus);
        let mut score_ends = ScoreMatrix::new(h_len, score_ends_data); // best score ending with (needle[..i], haystack[..j])
        let mut score_best = ScoreMatrix::new(h_len, score_best_data); // best score for (needle[..i], haystack[..j])
        for (i, n_char) in needle.iter().enumerate() {
            let mut score_prev = f32::NEG_INFINITY;
            let score_gap = if i == n_len - 1 {
                SCORE_GAP_TRAILING
            } else {
                SCORE_GAP_INNER
            };
            for (j, h_char) in haystack.iter().enumerate() {
                if n_char == h_char {
                    let score = if i == 0 {
                        (j as f32) * SCORE_GAP_LEADING + score_bonus[j]
                    } else if j != 0 {
                        let best = score_best.get(i - 1, j - 1) + score_bonus[j];
                        let ends = score_ends.get(i - 1, j - 1) + SCORE_MATCH_CONSECUTIVE;
                        best.max(ends)
                    } else {
                        f32::NEG_INFINITY
                    };
                    score_prev = score.max(score_prev + score_gap);
                    score_ends.set(i, j, score);
                } else {
                    score_prev += score_gap;
                    score_ends.set(i, j, f32::NEG_INFINITY);
                }
                score_best.set(i, j, score_prev);
            }
        }

        // find positions, walking backwards
        let mut offsets = Offsets::new();
        let mut match_required = false;
        let mut j = h_len;
        for i in (0..n_len).rev() {
            while j > 0 {
                j -= 1;
                if (match_required || score_ends.get(i, j) == score_best.get(i, j))
                    && score_ends.get(i, j) != f32::NEG_INFINITY
                {
                    match_required = i > 0
                        && j > 0
                        && (score_best.get(i, j)
                            == (score_ends.get(i - 1, j - 1) + SCORE_MATCH_CONSECUTIVE));
                    offsets.push(j);
                    break;
                }
            }
        }
        offsets.reverse();
        let score = Score::new(score_best.get(n_len - 1, h_len - 1));

        DATA_CELL.with(move |data_cell| data_cell.replace(data));
        (score, offsets)
    }
}

impl Scorer for FuzzyScorer {
    fn name(&self) -> &str {
        "fuzzy"
    }

    fn needle(&self) -> &str {
        &self.needle_str
    }

    fn test(&self, value: &str, reference: Reference) -> Option<Reference> {
        let (score, offsets) = with_haystack(value, self.fold, |haystack| self.score_ref(haystack))?;
        Some(reference.update([
            (FUZZY_SCORE, Meta::Score(score), accumulate as Combine),
            (FUZZY_OFFSETS, Meta::Offsets(offsets), accumulate as Combine),
        ]))
    }
}

struct ScoreMatrix<'a> {
    data: &'a mut [f32],
    width: usize,
}

impl<'a> ScoreMatrix<'a> {
    fn new<'b: 'a>(width: usize, data: &'b mut [f32]) -> Self {
        Self { data, width }
    }

    #[inline(always)]
    fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.width + col]
    }

    #[inline(always)]
    fn set(&mut self, row: usize, col: usize, val: f32) {
        self.data[row * self.width + col] = val;
    }
}

/// Order-preserving subsequence predicate
#[derive(Debug, Clone, Default)]
pub struct FuzzyPredicate {
    pub case: CaseMatching,
}

impl Predicate for FuzzyPredicate {
    fn name(&self) -> &str {
        "fuzzy"
    }

    fn scorer(&self, pattern: &str) -> Result<Arc<dyn Scorer>, Error> {
        Ok(Arc::new(FuzzyScorer::new(pattern, self.case)))
    }
}

/// Literal sub-string predicate
#[derive(Debug, Clone, Default)]
pub struct SubstrPredicate {
    pub case: CaseMatching,
}

impl Predicate for SubstrPredicate {
    fn name(&self) -> &str {
        "substr"
    }

    fn scorer(&self, pattern: &str) -> Result<Arc<dyn Scorer>, Error> {
        Ok(Arc::new(SubstrScorer::new(pattern, self.case)))
    }
}

/// Regular expression predicate
#[derive(Debug, Clone, Default)]
pub struct RegexPredicate {
    pub case: CaseMatching,
}

impl Predicate for RegexPredicate {
    fn name(&self) -> &str {
        "regex"
    }

    fn scorer(&self, pattern: &str) -> Result<Arc<dyn Scorer>, Error> {
        Ok(Arc::new(RegexScorer::new(pattern, self.case)?))
    }
}

type PredicateFnInner = dyn Fn(&str, Reference, &str) -> Option<Reference> + Send + Sync;

/// Predicate defined by a plain function
#[derive(Clone)]
pub struct PredicateFn {
    name: String,
    func: Arc<PredicateFnInner>,
}

impl PredicateFn {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&str, Reference, &str) -> Option<Reference> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for PredicateFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateFn").field("name", &self.name).finish()
    }
}

impl Predicate for PredicateFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn scorer(&self, pattern: &str) -> Result<Arc<dyn Scorer>, Error> {
        Ok(Arc::new(PredicateFnScorer {
            predicate: self.clone(),
            needle: pattern.to_owned(),
        }))
    }
}

#[derive(Debug)]
struct PredicateFnScorer {
    predicate: PredicateFn,
    needle: String,
}

impl Scorer for PredicateFnScorer {
    fn name(&self) -> &str {
        &self.predicate.name
    }

    fn needle(&self) -> &str {
        &self.needle
    }

    fn test(&self, value: &str, reference: Reference) -> Option<Reference> {
        (self.predicate.func)(value, reference, &self.needle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(string: &str) -> Vec<char> {
        string.chars().collect()
    }

    fn offsets(reference: &Reference) -> Vec<usize> {
        reference
            .get(FUZZY_OFFSETS)
            .and_then(Meta::as_offsets)
            .map(|offsets| offsets.to_vec())
            .unwrap_or_default()
    }

    #[test]
    fn test_knuth_morris_pratt() {
        let pattern = KMPPattern::new("acat".bytes().collect());
        assert_eq!(pattern.table, vec![0, 0, 1, 0]);

        let pattern = KMPPattern::new("acacagt".bytes().collect());
        assert_eq!(pattern.table, vec![0, 0, 1, 2, 3, 0, 0]);

        let pattern = KMPPattern::new("abcdabd".bytes().collect());
        assert_eq!(Some(13), pattern.search("abcabcdababcdabcdabde"));

        let pattern = KMPPattern::new("abcabcd".bytes().collect());
        assert_eq!(pattern.table, vec![0, 0, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_subseq() {
        let subseq = FuzzyScorer::subseq;
        assert!(subseq(&chars("one"), &chars("on/e")));
        assert!(subseq(&chars("one"), &chars("w o ne")));
        assert!(!subseq(&chars("one"), &chars("net")));
        assert!(subseq(&[], &chars("one")));
    }

    #[test]
    fn test_fuzzy_scorer() {
        let scorer = FuzzyScorer::new("one", CaseMatching::Smart);
        let (score, positions) = scorer.score_ref(&chars(" on/e two")).unwrap();
        assert_eq!(positions.as_slice(), &[1, 2, 4]);
        assert!((score.value() - 2.665).abs() < 0.001);
        assert!(scorer.score_ref(&chars("two")).is_none());

        let reference = scorer.test("ONE/two", Reference::new(7)).unwrap();
        assert_eq!(reference.position(), 7);
        assert_eq!(offsets(&reference), vec![0, 1, 2]);
        assert!(reference.score().is_some());
    }

    #[test]
    fn test_fuzzy_offsets_len() {
        let scorer = FuzzyScorer::new("aab", CaseMatching::Ignore);
        let reference = scorer.test("xaxaxb", Reference::new(0)).unwrap();
        assert_eq!(offsets(&reference), vec![1, 3, 5]);

        let scorer = FuzzyScorer::new("ap", CaseMatching::Ignore);
        let reference = scorer.test("apple", Reference::new(0)).unwrap();
        assert_eq!(offsets(&reference), vec![0, 1]);
        assert!(scorer.test("banana", Reference::new(1)).is_none());
    }

    #[test]
    fn test_fuzzy_monotonic() {
        let scorer = FuzzyScorer::new("sc", CaseMatching::Smart);
        let dense = scorer.test("scorer", Reference::new(0)).and_then(|r| r.score());
        let sparse = scorer.test("s_____c", Reference::new(0)).and_then(|r| r.score());
        let boundary = scorer.test("s_cope", Reference::new(0)).and_then(|r| r.score());
        let inner = scorer.test("s_xcope", Reference::new(0)).and_then(|r| r.score());
        assert!(dense > sparse);
        assert!(boundary > inner);
    }

    #[test]
    fn test_smart_case() {
        let scorer = FuzzyScorer::new("Ab", CaseMatching::Smart);
        assert!(scorer.test("ab", Reference::new(0)).is_none());
        assert!(scorer.test("xAb", Reference::new(0)).is_some());
        let scorer = FuzzyScorer::new("ab", CaseMatching::Respect);
        assert!(scorer.test("AB", Reference::new(0)).is_none());
    }

    #[test]
    fn test_substr_scorer() {
        let scorer = SubstrScorer::new("bab", CaseMatching::Smart);
        let reference = scorer.test(" one BABABCD ", Reference::new(0)).unwrap();
        assert_eq!(
            reference.get(MATCH_RANGES).and_then(Meta::as_ranges),
            Some(&[5..8][..])
        );
        assert!(scorer.test("abba", Reference::new(0)).is_none());

        let scorer = SubstrScorer::new("", CaseMatching::Smart);
        let reference = scorer.test("anything", Reference::new(0)).unwrap();
        assert_eq!(reference, Reference::new(0));
    }

    #[test]
    fn test_regex_scorer() -> Result<(), anyhow::Error> {
        let scorer = RegexScorer::new("b.r$", CaseMatching::Smart)?;
        let reference = scorer.test("πfoo_bar", Reference::new(0)).unwrap();
        assert_eq!(
            reference.get(MATCH_RANGES).and_then(Meta::as_ranges),
            Some(&[5..8][..])
        );
        assert!(scorer.test("bar_foo", Reference::new(0)).is_none());

        let error = RegexPredicate::default().scorer("(unclosed").unwrap_err();
        assert_eq!(error.kind(), &crate::ErrorKind::Pattern);
        Ok(())
    }

    #[test]
    fn test_predicate_fn() -> Result<(), anyhow::Error> {
        let prefix = PredicateFn::new("prefix", |value, reference, pattern| {
            value.starts_with(pattern).then_some(reference)
        });
        assert!(prefix.apply("foobar", Reference::new(0), "foo")?.is_some());
        assert!(prefix.apply("barfoo", Reference::new(0), "foo")?.is_none());
        assert_eq!(prefix.scorer("foo")?.needle(), "foo");
        Ok(())
    }

    #[test]
    fn test_score() {
        assert!(Score::new(1.0) > Score::new(0.9));
        assert!(Score::new(1.0) == Score::new(1.0));
        assert!(Score::MIN < Score::MAX);
        assert_eq!(Score::new(1.0) + Score::new(0.5), Score::new(1.5));
    }
}
