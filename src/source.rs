use crate::{
    common::LockExt,
    index::make_indices,
    matcher::{Matcher, MatcherRef},
    render::{PlainRenderer, RendererRef},
    sorter::{IdentitySorter, Sorter, SorterRef},
    stream::{BackgroundHandle, DeliveryPayload, DeliverySender, DeliverySink},
    Candidate, CandidateArray, Error, Reference, State,
};
use std::{
    fmt,
    sync::{Arc, RwLock},
    time::Instant,
};

/// Index of a source inside of the session
pub type SourceId = usize;

/// Initial capacity of the candidate array filled by a streaming producer
const STREAM_CAPACITY: usize = 1024;

pub type ActionRef = Arc<dyn Fn(&Candidate) -> Result<(), Error> + Send + Sync>;

pub type CandidateFn = Arc<dyn Fn() -> Result<Vec<Candidate>, Error> + Send + Sync>;

pub type GeneratorRef = Arc<dyn Generator>;

/// Where the initial candidates of a source come from
#[derive(Clone, Default)]
pub enum CandidateSupply {
    #[default]
    None,
    /// Static list
    List(Vec<Candidate>),
    /// Function called once at source initialization
    Function(CandidateFn),
    /// List owned elsewhere, its content at initialization time is used
    Shared(Arc<RwLock<Vec<Candidate>>>),
}

impl CandidateSupply {
    fn materialize(&self) -> Result<Option<Vec<Candidate>>, Error> {
        match self {
            CandidateSupply::None => Ok(None),
            CandidateSupply::List(items) => Ok(Some(items.clone())),
            CandidateSupply::Function(func) => func().map(Some),
            CandidateSupply::Shared(items) => Ok(Some(items.with(Clone::clone))),
        }
    }
}

impl fmt::Debug for CandidateSupply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateSupply::None => write!(f, "None"),
            CandidateSupply::List(items) => write!(f, "List({})", items.len()),
            CandidateSupply::Function(_) => write!(f, "Function"),
            CandidateSupply::Shared(_) => write!(f, "Shared"),
        }
    }
}

pub type StartFn = Box<dyn FnOnce(DeliverySink) -> Result<BackgroundHandle, Error> + Send>;

/// Result of a generator invocation
pub enum Generated {
    /// Keep current candidates
    Nothing,
    /// Replace candidates
    Candidates(Vec<Candidate>),
    /// Candidates will be delivered by the background producer
    ///
    /// Producer is started by the source once the previous one is cancelled.
    Background(StartFn),
}

impl Generated {
    pub fn background<S>(start: S) -> Self
    where
        S: FnOnce(DeliverySink) -> Result<BackgroundHandle, Error> + Send + 'static,
    {
        Generated::Background(Box::new(start))
    }
}

impl fmt::Debug for Generated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generated::Nothing => write!(f, "Nothing"),
            Generated::Candidates(items) => write!(f, "Candidates({})", items.len()),
            Generated::Background(_) => write!(f, "Background"),
        }
    }
}

/// Everything a generator can see during the per-query cycle
pub struct GeneratorContext<'a> {
    source: SourceId,
    name: &'a str,
    state: &'a State,
    previous_query: Option<&'a str>,
}

impl<'a> GeneratorContext<'a> {
    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn state(&self) -> &'a State {
        self.state
    }

    pub fn query(&self) -> &'a str {
        self.state.query()
    }

    /// Query of the previous invocation for this source, `None` on the first one
    pub fn previous_query(&self) -> Option<&'a str> {
        self.previous_query
    }
}

/// Generator
///
/// Per-query producer of candidates, either realized (pull) or delivered by a
/// background producer (push).
pub trait Generator: Send + Sync + fmt::Debug {
    fn generate(&self, context: &GeneratorContext<'_>) -> Result<Generated, Error>;
}

/// Declarative source definition
///
/// Inheritance is plain struct update syntax starting from the parent:
/// `SourceTemplate { name: "child".into(), ..parent.clone() }`.
#[derive(Clone)]
pub struct SourceTemplate {
    pub name: String,
    pub header: Option<String>,
    /// `None` keeps every candidate
    pub matcher: Option<MatcherRef>,
    pub sorter: SorterRef,
    pub renderer: RendererRef,
    pub action: ActionRef,
    pub candidates: CandidateSupply,
    pub generator: Option<GeneratorRef>,
    /// Candidate function is run by a background worker instead of blocking
    /// source initialization
    pub is_async: bool,
}

impl SourceTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for SourceTemplate {
    fn default() -> Self {
        Self {
            name: "source".to_owned(),
            header: None,
            matcher: None,
            sorter: Arc::new(IdentitySorter),
            renderer: Arc::new(PlainRenderer),
            action: Arc::new(no_action),
            candidates: CandidateSupply::None,
            generator: None,
            is_async: false,
        }
    }
}

fn no_action(_candidate: &Candidate) -> Result<(), Error> {
    Ok(())
}

impl fmt::Debug for SourceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceTemplate")
            .field("name", &self.name)
            .field("header", &self.header)
            .field("matcher", &self.matcher)
            .field("sorter", &self.sorter)
            .field("renderer", &self.renderer)
            .field("candidates", &self.candidates)
            .field("generator", &self.generator)
            .field("is_async", &self.is_async)
            .finish()
    }
}

/// Live source: candidates, processed set and the in-flight producer
pub struct Source {
    template: SourceTemplate,
    candidates: CandidateArray,
    processed: Vec<Reference>,
    handle: Option<BackgroundHandle>,
    generation: u64,
    previous_query: Option<String>,
    failure: Option<Error>,
    // candidates are replaced by the first delivery of the current producer
    stale: bool,
}

impl Source {
    /// Materialize initial candidates of the template
    pub fn init(template: SourceTemplate) -> Result<Self, Error> {
        let deferred =
            template.is_async && matches!(template.candidates, CandidateSupply::Function(_));
        let candidates = if deferred {
            None
        } else {
            template.candidates.materialize()?
        };
        let candidates = match candidates {
            Some(items) => CandidateArray::new(items),
            None if deferred || template.generator.is_some() => CandidateArray::default(),
            None => {
                return Err(Error::config(format!(
                    "source \"{}\" has neither candidates nor generator",
                    template.name
                )))
            }
        };
        let processed = make_indices(&candidates);
        Ok(Self {
            template,
            candidates,
            processed,
            handle: None,
            generation: 0,
            previous_query: None,
            failure: None,
            stale: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn header(&self) -> Option<&str> {
        self.template.header.as_deref()
    }

    pub fn template(&self) -> &SourceTemplate {
        &self.template
    }

    pub fn candidates(&self) -> &CandidateArray {
        &self.candidates
    }

    /// Current processed set
    pub fn processed(&self) -> &[Reference] {
        &self.processed
    }

    pub fn candidate(&self, reference: &Reference) -> Option<&Candidate> {
        self.candidates.get(reference.position())
    }

    /// Generation of the latest started producer
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a background producer is in flight
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Last background producer failure
    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    /// Candidate function which must be run by a background worker
    pub(crate) fn deferred_supply(&self) -> Option<CandidateFn> {
        match &self.template.candidates {
            CandidateSupply::Function(func) if self.template.is_async => Some(func.clone()),
            _ => None,
        }
    }

    /// Start background producer, previous one is cancelled first
    pub fn start<S>(
        &mut self,
        id: SourceId,
        deliveries: &DeliverySender,
        start: S,
    ) -> Result<(), Error>
    where
        S: FnOnce(DeliverySink) -> Result<BackgroundHandle, Error>,
    {
        self.cancel();
        let handle = start(DeliverySink::new(id, self.generation + 1, deliveries.clone()))?;
        self.install(handle);
        Ok(())
    }

    fn install(&mut self, handle: BackgroundHandle) {
        self.generation += 1;
        self.stale = true;
        self.failure = None;
        self.handle = Some(handle);
    }

    // Drop candidates of the previous producer
    fn refresh(&mut self) {
        if self.stale {
            self.stale = false;
            self.candidates = CandidateArray::with_capacity(STREAM_CAPACITY);
            self.processed.clear();
        }
    }

    /// Cancel in-flight producer, returns `true` if there was one
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(mut handle) => {
                let cancelled = handle.cancel();
                if cancelled {
                    tracing::debug!(
                        source = self.template.name.as_str(),
                        generation = self.generation,
                        "[Source.cancel]"
                    );
                }
                cancelled
            }
            None => false,
        }
    }

    /// Per-query cycle: generator, then matcher and sorter
    pub fn process(
        &mut self,
        id: SourceId,
        state: &State,
        deliveries: &DeliverySender,
    ) -> Result<(), Error> {
        if let Some(generator) = self.template.generator.clone() {
            let context = GeneratorContext {
                source: id,
                name: &self.template.name,
                state,
                previous_query: self.previous_query.as_deref(),
            };
            let generated = generator.generate(&context)?;
            self.previous_query = Some(state.query().to_owned());
            match generated {
                Generated::Nothing => {}
                Generated::Candidates(items) => {
                    self.cancel();
                    self.generation += 1;
                    self.stale = false;
                    self.candidates = CandidateArray::new(items);
                    self.processed = make_indices(&self.candidates);
                }
                Generated::Background(start) => self.start(id, deliveries, start)?,
            }
        }
        self.recompute(state)
    }

    /// Recompute processed set over the current candidates
    ///
    /// On failure processed set is left intact.
    pub fn recompute(&mut self, state: &State) -> Result<(), Error> {
        let start = Instant::now();
        let processed = match &self.template.matcher {
            Some(matcher) => matcher.matches(&self.candidates, state)?,
            None => make_indices(&self.candidates),
        };
        self.processed = self.template.sorter.sort(&self.candidates, processed, state);
        tracing::debug!(
            source = self.template.name.as_str(),
            query = state.query(),
            candidates = self.candidates.len(),
            processed = self.processed.len(),
            elapsed = ?start.elapsed(),
            "[Source.recompute]"
        );
        Ok(())
    }

    /// Merge delivery of a background producer
    ///
    /// Returns `false` if the delivery was stale and dropped.
    pub fn accept(
        &mut self,
        generation: u64,
        payload: DeliveryPayload,
        state: &State,
    ) -> Result<bool, Error> {
        if generation != self.generation {
            tracing::warn!(
                source = self.template.name.as_str(),
                generation,
                current = self.generation,
                "[Source.accept] stale delivery dropped"
            );
            return Ok(false);
        }
        match payload {
            DeliveryPayload::Append(items) => {
                self.refresh();
                for item in items {
                    self.candidates.push(item);
                }
                self.recompute(state)?;
            }
            DeliveryPayload::Replace(items) => {
                self.stale = false;
                self.candidates = CandidateArray::new(items);
                self.processed = make_indices(&self.candidates);
                self.recompute(state)?;
            }
            DeliveryPayload::Failed(error) => {
                tracing::error!(
                    source = self.template.name.as_str(),
                    %error,
                    "[Source.accept] producer failed"
                );
                if let Some(handle) = self.handle.take() {
                    handle.release();
                }
                self.stale = false;
                self.failure = Some(error);
            }
            DeliveryPayload::Done => {
                if let Some(handle) = self.handle.take() {
                    handle.release();
                }
                if self.stale {
                    self.refresh();
                    self.recompute(state)?;
                }
            }
        }
        Ok(true)
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.template.name)
            .field("candidates", &self.candidates.len())
            .field("processed", &self.processed.len())
            .field("generation", &self.generation)
            .field("handle", &self.handle)
            .finish()
    }
}
