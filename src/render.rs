use crate::{
    index::{Meta, FUZZY_OFFSETS, MATCH_RANGES},
    Candidate, Reference, State,
};
use serde::Serialize;
use std::{fmt, ops::Range, sync::Arc};

/// Presentable unit produced for a single candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rendered {
    /// Text to display
    pub text: String,
    /// Sorted, non-overlapping character ranges of the text to highlight
    pub highlights: Vec<Range<usize>>,
}

/// Renderer
///
/// Reads the candidate, the session state and the metadata filters attached to
/// the reference. Inputs are never modified.
pub trait Renderer: Send + Sync + fmt::Debug {
    fn render(&self, candidate: &Candidate, state: &State, reference: &Reference) -> Rendered;
}

pub type RendererRef = Arc<dyn Renderer>;

impl<R: Renderer + ?Sized> Renderer for Arc<R> {
    fn render(&self, candidate: &Candidate, state: &State, reference: &Reference) -> Rendered {
        (**self).render(candidate, state, reference)
    }
}

/// Primary value as is
#[derive(Debug, Clone, Default)]
pub struct PlainRenderer;

impl Renderer for PlainRenderer {
    fn render(&self, candidate: &Candidate, _state: &State, _reference: &Reference) -> Rendered {
        Rendered {
            text: candidate.primary().to_owned(),
            highlights: Vec::new(),
        }
    }
}

/// Primary value with matched characters highlighted
#[derive(Debug, Clone, Default)]
pub struct HighlightRenderer;

impl Renderer for HighlightRenderer {
    fn render(&self, candidate: &Candidate, _state: &State, reference: &Reference) -> Rendered {
        Rendered {
            text: candidate.primary().to_owned(),
            highlights: highlights(reference),
        }
    }
}

/// Merge matched offsets and ranges of the reference into sorted disjoint ranges
pub fn highlights(reference: &Reference) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = Vec::new();
    if let Some(offsets) = reference.get(FUZZY_OFFSETS).and_then(Meta::as_offsets) {
        ranges.extend(offsets.iter().map(|offset| *offset..*offset + 1));
    }
    if let Some(matched) = reference.get(MATCH_RANGES).and_then(Meta::as_ranges) {
        ranges.extend(matched.iter().cloned());
    }
    ranges.retain(|range| !range.is_empty());
    ranges.sort_by_key(|range| range.start);

    let mut result: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match result.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => result.push(range),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Offsets;

    #[test]
    fn test_highlights() {
        let reference = Reference::new(0)
            .with(
                FUZZY_OFFSETS,
                Meta::Offsets(Offsets::from_slice(&[0, 1, 2, 7, 9])),
            )
            .with(MATCH_RANGES, Meta::Ranges(vec![8..10, 2..4, 5..5]));
        assert_eq!(highlights(&reference), vec![0..4, 7..10]);
        assert!(highlights(&Reference::new(0)).is_empty());
    }

    #[test]
    fn test_renderers() {
        let candidate = Candidate::composite("main.rs", vec![serde_json::json!(1)]);
        let reference = Reference::new(0).with(MATCH_RANGES, Meta::Ranges(vec![0..4]));
        let state = State::new("main");
        let plain = PlainRenderer.render(&candidate, &state, &reference);
        assert_eq!(plain.text, "main.rs");
        assert!(plain.highlights.is_empty());
        let highlighted = HighlightRenderer.render(&candidate, &state, &reference);
        assert_eq!(highlighted.highlights, vec![0..4]);
    }
}
