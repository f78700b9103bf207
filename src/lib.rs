#![deny(warnings)]
#![allow(clippy::type_complexity)]

mod error;
pub use error::{Error, ErrorKind};

pub mod common;

mod candidate;
pub use candidate::{Candidate, CandidateArray};

pub mod index;
pub use index::{make_indices, resolve, Meta, Reference};

pub mod scorer;
pub use scorer::{
    CaseMatching, FuzzyScorer, KMPPattern, Predicate, RegexScorer, Score, Scorer, SubstrScorer,
};

pub mod filter;
pub use filter::{Filter, FilterRef};

pub mod matcher;
pub use matcher::{matcher_by_name, Matcher, MatcherRef};

pub mod sorter;
pub use sorter::{IdentitySorter, ScoreSorter, Sorter, SorterRef};

pub mod render;
pub use render::{Rendered, Renderer, RendererRef};

pub mod source;
pub use source::{CandidateSupply, Generated, Generator, Source, SourceId, SourceTemplate};

pub mod stream;

mod session;
pub use session::{RenderedItem, RenderedSource, Selected, Session, State};

pub mod config;
