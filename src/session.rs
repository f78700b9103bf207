use crate::{
    render::{Rendered, Renderer},
    source::{Source, SourceId, SourceTemplate},
    stream::{spawn_worker, Delivery, DeliverySender},
    Candidate, Error, Reference,
};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// How often a waiting session re-checks whether producers are still alive
const WAIT_RECHECK: Duration = Duration::from_millis(100);

/// Session state visible to matchers, generators and renderers
#[derive(Debug, Clone, Default)]
pub struct State {
    query: String,
    origin: Option<Value>,
    selection: usize,
}

impl State {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Current query
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Context the session was started from
    pub fn origin(&self) -> Option<&Value> {
        self.origin.as_ref()
    }

    /// Global selection offset across all sources
    pub fn selection(&self) -> usize {
        self.selection
    }
}

/// Currently selected candidate
#[derive(Debug, Clone, Copy)]
pub struct Selected<'a> {
    pub source: SourceId,
    pub name: &'a str,
    pub candidate: &'a Candidate,
    pub reference: &'a Reference,
}

/// Rendered candidate
#[derive(Debug, Clone, Serialize)]
pub struct RenderedItem {
    pub candidate: Candidate,
    #[serde(flatten)]
    pub view: Rendered,
}

/// Rendered processed set of a single source
#[derive(Debug, Clone, Serialize)]
pub struct RenderedSource {
    pub name: String,
    pub header: Option<String>,
    /// Size of the processed set
    pub total: usize,
    /// Rendered candidates, might be truncated by the limit
    pub items: Vec<RenderedItem>,
}

/// Interactive selection session over multiple sources
///
/// All background producers are cancelled once the session is confirmed,
/// cancelled or dropped.
pub struct Session {
    state: State,
    sources: Vec<Source>,
    dropped: Vec<(String, Error)>,
    deliveries: DeliverySender,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    closed: bool,
}

impl Session {
    /// Create session, sources which fail to initialize are excluded
    ///
    /// Sources with asynchronous candidate function start their workers here,
    /// so this must be called within tokio runtime if there are any.
    pub fn new(templates: impl IntoIterator<Item = SourceTemplate>, origin: Option<Value>) -> Self {
        let (deliveries, receiver) = mpsc::unbounded_channel();
        let mut session = Self {
            state: State {
                origin,
                ..State::default()
            },
            sources: Vec::new(),
            dropped: Vec::new(),
            deliveries,
            receiver,
            closed: false,
        };
        for template in templates {
            let name = template.name.clone();
            if let Err(error) = session.add_source(template) {
                tracing::warn!(source = name.as_str(), %error, "[Session.new] source dropped");
                session.dropped.push((name, error));
            }
        }
        session
    }

    fn add_source(&mut self, template: SourceTemplate) -> Result<(), Error> {
        let mut source = Source::init(template)?;
        let id = self.sources.len();
        if let Some(supply) = source.deferred_supply() {
            source.start(id, &self.deliveries, |sink| {
                spawn_worker(sink, move || supply())
            })?;
        }
        self.sources.push(source);
        Ok(())
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn query(&self) -> &str {
        &self.state.query
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn source(&self, id: SourceId) -> Option<&Source> {
        self.sources.get(id)
    }

    /// Sources excluded because of configuration errors
    pub fn dropped(&self) -> &[(String, Error)] {
        &self.dropped
    }

    /// Whether any source has a background producer in flight
    pub fn is_running(&self) -> bool {
        self.sources.iter().any(Source::is_running)
    }

    /// Set new query and recompute every source
    ///
    /// Selection is reset to the first candidate. A source that fails keeps
    /// its previous processed set, the other sources are still recomputed and
    /// the first error is returned.
    pub fn query_set(&mut self, query: impl Into<String>) -> Result<(), Error> {
        self.state.query = query.into();
        self.state.selection = 0;
        let mut first_error = None;
        for (id, source) in self.sources.iter_mut().enumerate() {
            if let Err(error) = source.process(id, &self.state, &self.deliveries) {
                tracing::warn!(
                    source = source.name(),
                    %error,
                    "[Session.query_set] recompute failed"
                );
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Merge delivery of a background producer
    ///
    /// Returns `true` if session has changed and must be redrawn.
    pub fn apply_delivery(&mut self, delivery: Delivery) -> Result<bool, Error> {
        let Some(source) = self.sources.get_mut(delivery.source) else {
            tracing::warn!(
                source = delivery.source,
                "[Session.apply_delivery] unknown source"
            );
            return Ok(false);
        };
        let changed = source.accept(delivery.generation, delivery.payload, &self.state)?;
        self.select_clamp();
        Ok(changed)
    }

    /// Merge all deliveries which have already arrived, returns number of
    /// applied (not stale) deliveries
    pub fn drain_deliveries(&mut self) -> Result<usize, Error> {
        let mut applied = 0;
        while let Ok(delivery) = self.receiver.try_recv() {
            if self.apply_delivery(delivery)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Wait for the next delivery and merge it
    ///
    /// Returns `false` once there are no producers in flight and nothing
    /// is left to merge.
    pub async fn wait(&mut self) -> Result<bool, Error> {
        loop {
            let running = self.is_running();
            if self.drain_deliveries()? > 0 {
                return Ok(true);
            }
            if !running {
                return Ok(false);
            }
            tokio::select! {
                Some(delivery) = self.receiver.recv() => {
                    if self.apply_delivery(delivery)? {
                        return Ok(true);
                    }
                }
                _ = tokio::time::sleep(WAIT_RECHECK) => {}
            }
        }
    }

    /// Total number of candidates across all processed sets
    pub fn total(&self) -> usize {
        self.sources
            .iter()
            .map(|source| source.processed().len())
            .sum()
    }

    /// Global selection offset
    pub fn selection(&self) -> usize {
        self.state.selection
    }

    fn select_clamp(&mut self) {
        let total = self.total();
        self.state.selection = if total == 0 {
            0
        } else {
            self.state.selection.min(total - 1)
        };
    }

    /// Set selection, clamped to the available candidates
    pub fn select_set(&mut self, offset: usize) {
        self.state.selection = offset;
        self.select_clamp();
    }

    /// Move selection forward, wraps around
    pub fn select_next(&mut self) {
        let total = self.total();
        if total != 0 {
            self.state.selection = (self.state.selection + 1) % total;
        }
    }

    /// Move selection backward, wraps around
    pub fn select_prev(&mut self) {
        let total = self.total();
        if total != 0 {
            self.state.selection = (self.state.selection + total - 1) % total;
        }
    }

    /// Jump to the first candidate of the next non-empty source
    pub fn select_next_source(&mut self) {
        self.select_source(true)
    }

    /// Jump to the first candidate of the previous non-empty source
    pub fn select_prev_source(&mut self) {
        self.select_source(false)
    }

    fn select_source(&mut self, forward: bool) {
        let Some((current, _)) = self.locate(self.state.selection) else {
            return;
        };
        let count = self.sources.len();
        let target = (1..=count)
            .map(|step| {
                if forward {
                    (current + step) % count
                } else {
                    (current + count - step) % count
                }
            })
            .find(|id| !self.sources[*id].processed().is_empty());
        if let Some(target) = target {
            self.state.selection = self.sources[..target]
                .iter()
                .map(|source| source.processed().len())
                .sum();
        }
    }

    /// Source and index inside of its processed set for global offset
    fn locate(&self, mut offset: usize) -> Option<(SourceId, usize)> {
        for (id, source) in self.sources.iter().enumerate() {
            let len = source.processed().len();
            if offset < len {
                return Some((id, offset));
            }
            offset -= len;
        }
        None
    }

    /// Currently selected candidate
    pub fn current(&self) -> Option<Selected<'_>> {
        let (id, index) = self.locate(self.state.selection)?;
        let source = &self.sources[id];
        let reference = &source.processed()[index];
        Some(Selected {
            source: id,
            name: source.name(),
            candidate: source.candidate(reference)?,
            reference,
        })
    }

    /// Render processed sets, `limit` caps number of items per source
    pub fn render(&self, limit: Option<usize>) -> Vec<RenderedSource> {
        self.sources
            .iter()
            .map(|source| {
                let renderer = &source.template().renderer;
                let items = source
                    .processed()
                    .iter()
                    .take(limit.unwrap_or(usize::MAX))
                    .filter_map(|reference| {
                        let candidate = source.candidate(reference)?;
                        Some(RenderedItem {
                            candidate: candidate.clone(),
                            view: renderer.render(candidate, &self.state, reference),
                        })
                    })
                    .collect();
                RenderedSource {
                    name: source.name().to_owned(),
                    header: source.header().map(ToOwned::to_owned),
                    total: source.processed().len(),
                    items,
                }
            })
            .collect()
    }

    /// Conclude session with the current selection
    ///
    /// Background producers are cancelled and the action of the selected
    /// source is invoked with the selected candidate.
    pub fn confirm(mut self) -> Result<Option<Candidate>, Error> {
        let selected = self
            .current()
            .map(|selected| (selected.source, selected.candidate.clone()));
        self.teardown();
        let Some((id, candidate)) = selected else {
            return Ok(None);
        };
        let action = self.sources[id].template().action.clone();
        tracing::debug!(
            source = self.sources[id].name(),
            candidate = candidate.primary(),
            "[Session.confirm]"
        );
        action(&candidate)?;
        Ok(Some(candidate))
    }

    /// Conclude session without a selection, action is not invoked
    pub fn cancel(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let cancelled = self
            .sources
            .iter_mut()
            .map(|source| source.cancel())
            .filter(|cancelled| *cancelled)
            .count();
        tracing::debug!(cancelled, "[Session.teardown]");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("sources", &self.sources)
            .finish()
    }
}
