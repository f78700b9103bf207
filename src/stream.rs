//! Streaming producers
//!
//! Background producers run as tokio tasks and report back to the session
//! through [Delivery] messages stamped with the source id and the generation
//! the producer was started for.
use crate::{
    common::{tokens, AbortJoinHandle, LockExt},
    source::{Generated, Generator, GeneratorContext, SourceId},
    Candidate, Error,
};
use serde_json::Value;
use std::{
    fmt,
    pin::Pin,
    process::Stdio,
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    runtime::Handle,
    sync::mpsc,
    task::JoinHandle,
};

const CHUNK_SIZE: usize = 65536;

/// Payload of a delivery
#[derive(Debug)]
pub enum DeliveryPayload {
    /// Candidates to append to the candidate array
    Append(Vec<Candidate>),
    /// Candidates replacing the candidate array
    Replace(Vec<Candidate>),
    /// Producer failed, no more deliveries follow
    Failed(Error),
    /// Producer finished, no more deliveries follow
    Done,
}

/// Message sent by a background producer
#[derive(Debug)]
pub struct Delivery {
    pub source: SourceId,
    pub generation: u64,
    pub payload: DeliveryPayload,
}

pub type DeliverySender = mpsc::UnboundedSender<Delivery>;

/// Delivery sender bound to a source and a generation
#[derive(Debug, Clone)]
pub struct DeliverySink {
    source: SourceId,
    generation: u64,
    sender: DeliverySender,
}

impl DeliverySink {
    pub fn new(source: SourceId, generation: u64, sender: DeliverySender) -> Self {
        Self {
            source,
            generation,
            sender,
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Send payload, returns `false` if the session is gone
    pub fn send(&self, payload: DeliveryPayload) -> bool {
        self.sender
            .send(Delivery {
                source: self.source,
                generation: self.generation,
                payload,
            })
            .is_ok()
    }
}

/// Handle of a running background producer
///
/// Cancellation is idempotent: the task is aborted and `on_cancel` hook is run
/// only by the first call. Dropping the handle cancels it.
pub struct BackgroundHandle {
    task: Option<AbortJoinHandle<()>>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl BackgroundHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self {
            task: Some(task.into()),
            on_cancel: None,
        }
    }

    /// Run `hook` once the producer is cancelled
    pub fn on_cancel(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(hook));
        self
    }

    /// Whether producer task has already finished
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Terminate producer, returns `true` only for the call that cancelled it
    pub fn cancel(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };
        task.abort();
        if let Some(hook) = self.on_cancel.take() {
            hook();
        }
        true
    }

    /// Forget a producer which has finished on its own
    pub fn release(mut self) {
        self.on_cancel.take();
        self.task.take();
    }
}

impl Drop for BackgroundHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for BackgroundHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundHandle")
            .field("running", &!self.is_finished())
            .finish()
    }
}

/// Accumulates chunked input and yields complete lines
///
/// Trailing partial line is kept until the next chunk or [LineBuffer::finish].
#[derive(Debug, Default)]
pub struct LineBuffer {
    carry: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed chunk, returns complete lines without line terminators
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(index) = rest.iter().position(|byte| *byte == b'\n') {
            self.carry.extend_from_slice(&rest[..index]);
            lines.push(take_line(&mut self.carry));
            rest = &rest[index + 1..];
        }
        self.carry.extend_from_slice(rest);
        lines
    }

    /// Flush unterminated trailing line
    pub fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            None
        } else {
            Some(take_line(&mut self.carry))
        }
    }
}

fn take_line(buffer: &mut Vec<u8>) -> String {
    if buffer.last() == Some(&b'\r') {
        buffer.pop();
    }
    let line = String::from_utf8_lossy(buffer).into_owned();
    buffer.clear();
    line
}

/// How lines are turned into candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineFormat {
    /// Every line is a scalar candidate
    #[default]
    Plain,
    /// Every line is a JSON encoded candidate
    Json,
}

impl LineFormat {
    pub fn parse(&self, line: String) -> Result<Candidate, Error> {
        match self {
            LineFormat::Plain => Ok(Candidate::new(line)),
            LineFormat::Json => Candidate::from_json(serde_json::from_str::<Value>(&line)?),
        }
    }

    // malformed lines are skipped, they must not stop the producer
    fn parse_lines(&self, lines: Vec<String>) -> Vec<Candidate> {
        lines
            .into_iter()
            .filter(|line| !line.is_empty())
            .filter_map(|line| match self.parse(line) {
                Ok(candidate) => Some(candidate),
                Err(error) => {
                    tracing::warn!(%error, "[LineFormat.parse] line skipped");
                    None
                }
            })
            .collect()
    }
}

fn runtime() -> Result<Handle, Error> {
    Handle::try_current().map_err(|error| Error::producer(error.to_string()))
}

/// Read lines from the reader delivering a batch of candidates per chunk
pub async fn read_lines<R>(
    sink: &DeliverySink,
    mut reader: R,
    format: LineFormat,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let size = reader.read(&mut chunk).await?;
        if size == 0 {
            break;
        }
        let candidates = format.parse_lines(buffer.feed(&chunk[..size]));
        if !candidates.is_empty() && !sink.send(DeliveryPayload::Append(candidates)) {
            return Ok(());
        }
    }
    if let Some(line) = buffer.finish() {
        let candidates = format.parse_lines(vec![line]);
        if !candidates.is_empty() {
            sink.send(DeliveryPayload::Append(candidates));
        }
    }
    Ok(())
}

/// Stream lines of the reader into the source
pub fn spawn_reader<R>(
    sink: DeliverySink,
    reader: R,
    format: LineFormat,
) -> Result<BackgroundHandle, Error>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let task = runtime()?.spawn(async move {
        let payload = match read_lines(&sink, reader, format).await {
            Ok(()) => DeliveryPayload::Done,
            Err(error) => DeliveryPayload::Failed(error),
        };
        sink.send(payload);
    });
    Ok(BackgroundHandle::new(task))
}

/// Stream lines of the process standard output into the source
///
/// Process is killed once the handle is cancelled.
pub fn spawn_process(
    sink: DeliverySink,
    mut command: Command,
    format: LineFormat,
) -> Result<BackgroundHandle, Error> {
    let runtime = runtime()?;
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| Error::producer(format!("failed to spawn process: {}", error)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::producer("process stdout is not captured"))?;
    let task = runtime.spawn(async move {
        let result = match read_lines(&sink, stdout, format).await {
            Err(error) => Err(error),
            Ok(()) => match child.wait().await {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(Error::producer(format!("process {}", status))),
                Err(error) => Err(error.into()),
            },
        };
        let payload = match result {
            Ok(()) => DeliveryPayload::Done,
            Err(error) => {
                tracing::error!(%error, source = sink.source(), "[spawn_process] producer failed");
                DeliveryPayload::Failed(error)
            }
        };
        sink.send(payload);
    });
    Ok(BackgroundHandle::new(task))
}

/// Run process to completion, its whole standard output replaces candidates
///
/// Process is killed once the handle is cancelled.
pub fn spawn_command(
    sink: DeliverySink,
    mut command: Command,
    format: LineFormat,
) -> Result<BackgroundHandle, Error> {
    let runtime = runtime()?;
    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| Error::producer(format!("failed to spawn process: {}", error)))?;
    let task = runtime.spawn(async move {
        let payload = match child.wait_with_output().await {
            Ok(output) if output.status.success() => {
                let mut buffer = LineBuffer::new();
                let mut lines = buffer.feed(&output.stdout);
                lines.extend(buffer.finish());
                sink.send(DeliveryPayload::Replace(format.parse_lines(lines)));
                DeliveryPayload::Done
            }
            Ok(output) => DeliveryPayload::Failed(Error::producer(format!(
                "process {}",
                output.status
            ))),
            Err(error) => DeliveryPayload::Failed(error.into()),
        };
        if let DeliveryPayload::Failed(error) = &payload {
            tracing::error!(%error, source = sink.source(), "[spawn_command] producer failed");
        }
        sink.send(payload);
    });
    Ok(BackgroundHandle::new(task))
}

/// Run blocking function on the blocking pool, its result replaces candidates
pub fn spawn_worker<F>(sink: DeliverySink, func: F) -> Result<BackgroundHandle, Error>
where
    F: FnOnce() -> Result<Vec<Candidate>, Error> + Send + 'static,
{
    let runtime = runtime()?;
    let blocking = runtime.clone();
    let task = runtime.spawn(async move {
        let payload = match blocking.spawn_blocking(func).await {
            Ok(Ok(candidates)) => {
                sink.send(DeliveryPayload::Replace(candidates));
                DeliveryPayload::Done
            }
            Ok(Err(error)) => DeliveryPayload::Failed(error),
            Err(error) => DeliveryPayload::Failed(error.into()),
        };
        sink.send(payload);
    });
    Ok(BackgroundHandle::new(task))
}

/// Generator running external process seeded by the first query token
///
/// Every argument containing `{}` gets it replaced by the first token of the
/// query. The process is restarted only when the seed changes, without a
/// placeholder it is started once. Output is either streamed line by line
/// or collected and delivered once the process exits.
#[derive(Debug, Clone)]
pub struct ProcessGenerator {
    program: String,
    args: Vec<String>,
    format: LineFormat,
    streaming: bool,
}

impl ProcessGenerator {
    /// Generator streaming process output
    pub fn new(program: impl Into<String>, args: Vec<String>, format: LineFormat) -> Self {
        Self {
            program: program.into(),
            args,
            format,
            streaming: true,
        }
    }

    /// Generator replacing candidates with the output of a finished process
    pub fn collected(program: impl Into<String>, args: Vec<String>, format: LineFormat) -> Self {
        Self {
            streaming: false,
            ..Self::new(program, args, format)
        }
    }

    /// Whether the first query token is consumed as the process seed
    pub fn is_seeded(&self) -> bool {
        self.args.iter().any(|arg| arg.contains("{}"))
    }

    fn seed<'a>(&self, query: &'a str) -> &'a str {
        if self.is_seeded() {
            tokens(query).next().unwrap_or("")
        } else {
            ""
        }
    }
}

impl Generator for ProcessGenerator {
    fn generate(&self, context: &GeneratorContext<'_>) -> Result<Generated, Error> {
        let seed = self.seed(context.query());
        if let Some(previous) = context.previous_query() {
            if self.seed(previous) == seed {
                return Ok(Generated::Nothing);
            }
        }
        if self.is_seeded() && seed.is_empty() {
            return Ok(Generated::Candidates(Vec::new()));
        }
        let mut command = Command::new(&self.program);
        command.args(self.args.iter().map(|arg| arg.replace("{}", seed)));
        tracing::debug!(
            program = %self.program,
            seed,
            streaming = self.streaming,
            source = context.name(),
            "[ProcessGenerator.generate] spawning"
        );
        let format = self.format;
        if self.streaming {
            Ok(Generated::background(move |sink| {
                spawn_process(sink, command, format)
            }))
        } else {
            Ok(Generated::background(move |sink| {
                spawn_command(sink, command, format)
            }))
        }
    }
}

type Reader = Pin<Box<dyn AsyncRead + Send>>;

/// Generator streaming a reader (e.g. standard input) once
pub struct ReaderGenerator {
    reader: Mutex<Option<Reader>>,
    format: LineFormat,
}

impl ReaderGenerator {
    pub fn new(reader: impl AsyncRead + Send + 'static, format: LineFormat) -> Self {
        Self {
            reader: Mutex::new(Some(Box::pin(reader))),
            format,
        }
    }
}

impl fmt::Debug for ReaderGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderGenerator")
            .field("format", &self.format)
            .finish()
    }
}

impl Generator for ReaderGenerator {
    fn generate(&self, _context: &GeneratorContext<'_>) -> Result<Generated, Error> {
        match self.reader.with_mut(Option::take) {
            None => Ok(Generated::Nothing),
            Some(reader) => {
                let format = self.format;
                Ok(Generated::background(move |sink| {
                    spawn_reader(sink, reader, format)
                }))
            }
        }
    }
}

type WorkerFn = dyn Fn(&str) -> Result<Vec<Candidate>, Error> + Send + Sync;

/// Generator computing candidates for the query on the blocking pool
#[derive(Clone)]
pub struct WorkerGenerator {
    name: String,
    func: Arc<WorkerFn>,
}

impl WorkerGenerator {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<Candidate>, Error> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for WorkerGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerGenerator")
            .field("name", &self.name)
            .finish()
    }
}

impl Generator for WorkerGenerator {
    fn generate(&self, context: &GeneratorContext<'_>) -> Result<Generated, Error> {
        if context.previous_query() == Some(context.query()) {
            return Ok(Generated::Nothing);
        }
        let func = self.func.clone();
        let query = context.query().to_owned();
        Ok(Generated::background(move |sink| {
            spawn_worker(sink, move || func(&query))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CandidateArray;
    use anyhow::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn collect(
        recv: &mut mpsc::UnboundedReceiver<Delivery>,
    ) -> (Vec<String>, Option<crate::Error>) {
        let mut items = Vec::new();
        while let Some(delivery) = recv.recv().await {
            match delivery.payload {
                DeliveryPayload::Append(candidates) | DeliveryPayload::Replace(candidates) => {
                    items.extend(candidates.iter().map(|c| c.primary().to_owned()))
                }
                DeliveryPayload::Failed(error) => return (items, Some(error)),
                DeliveryPayload::Done => break,
            }
        }
        (items, None)
    }

    #[test]
    fn test_line_buffer() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.feed(b"one\ntw"), vec!["one"]);
        assert!(buffer.feed(b"o").is_empty());
        assert_eq!(buffer.feed(b"\r\nthree\n\nfo"), vec!["two", "three", ""]);
        assert_eq!(buffer.finish().as_deref(), Some("fo"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_growth_keeps_arrival_order() {
        let input: String = (0..1000).map(|i| format!("line-{}\n", i)).collect();
        for chunk_size in [1, 7, 64, 4096] {
            for capacity in [0, 1, 10] {
                let mut buffer = LineBuffer::new();
                let mut array = CandidateArray::with_capacity(capacity);
                for chunk in input.as_bytes().chunks(chunk_size) {
                    for line in buffer.feed(chunk) {
                        array.push(line.into());
                    }
                }
                assert_eq!(buffer.finish(), None);
                assert_eq!(array.len(), 1000);
                assert!(array
                    .iter()
                    .enumerate()
                    .all(|(i, c)| c.primary() == format!("line-{}", i)));
            }
        }
    }

    #[test]
    fn test_line_format() -> Result<(), Error> {
        let candidate = LineFormat::Json.parse(r#"["main.rs", 3]"#.to_owned())?;
        assert_eq!(candidate.payload(), &[serde_json::json!(3)]);
        let candidates = LineFormat::Json.parse_lines(vec!["\"a\"".to_owned(), "{".to_owned()]);
        assert_eq!(candidates.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_spawn_reader() -> Result<(), Error> {
        let (send, mut recv) = mpsc::unbounded_channel();
        let reader: &'static [u8] = b"alpha\nbeta\ngamma";
        let _handle = spawn_reader(DeliverySink::new(3, 1, send), reader, LineFormat::Plain)?;
        let (items, error) = collect(&mut recv).await;
        assert!(error.is_none());
        assert_eq!(items, vec!["alpha", "beta", "gamma"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_spawn_process() -> Result<(), Error> {
        let (send, mut recv) = mpsc::unbounded_channel();
        let mut command = Command::new("sh");
        command.args(["-c", "printf 'one\\ntwo\\nthree'"]);
        let sink = DeliverySink::new(0, 1, send.clone());
        let _handle = spawn_process(sink, command, LineFormat::Plain)?;
        let (items, error) = collect(&mut recv).await;
        assert!(error.is_none());
        assert_eq!(items, vec!["one", "two", "three"]);

        let mut command = Command::new("sh");
        command.args(["-c", "echo partial; exit 3"]);
        let _handle = spawn_process(DeliverySink::new(0, 2, send), command, LineFormat::Plain)?;
        let (items, error) = collect(&mut recv).await;
        assert_eq!(items, vec!["partial"]);
        assert_eq!(error.map(|e| e.kind().clone()), Some(crate::ErrorKind::Producer));
        Ok(())
    }

    #[tokio::test]
    async fn test_spawn_command() -> Result<(), Error> {
        let (send, mut recv) = mpsc::unbounded_channel();
        let mut command = Command::new("sh");
        command.args(["-c", "printf 'one\\ntwo\\nthree'"]);
        let sink = DeliverySink::new(0, 1, send.clone());
        let _handle = spawn_command(sink, command, LineFormat::Plain)?;
        let delivery = recv.recv().await.ok_or_else(|| anyhow::anyhow!("closed"))?;
        assert!(matches!(delivery.payload, DeliveryPayload::Replace(ref c) if c.len() == 3));
        let (_, error) = collect(&mut recv).await;
        assert!(error.is_none());

        // output of a failed process is discarded
        let mut command = Command::new("sh");
        command.args(["-c", "echo partial; exit 3"]);
        let _handle = spawn_command(DeliverySink::new(0, 2, send), command, LineFormat::Plain)?;
        let (items, error) = collect(&mut recv).await;
        assert!(items.is_empty());
        assert_eq!(error.map(|e| e.kind().clone()), Some(crate::ErrorKind::Producer));
        Ok(())
    }

    #[tokio::test]
    async fn test_spawn_worker() -> Result<(), Error> {
        let (send, mut recv) = mpsc::unbounded_channel();
        let _handle = spawn_worker(DeliverySink::new(0, 7, send.clone()), || {
            Ok(vec!["x".into(), "y".into()])
        })?;
        let delivery = recv.recv().await.ok_or_else(|| anyhow::anyhow!("closed"))?;
        assert_eq!(delivery.generation, 7);
        assert!(matches!(delivery.payload, DeliveryPayload::Replace(ref c) if c.len() == 2));
        let (_, error) = collect(&mut recv).await;
        assert!(error.is_none());

        let _handle = spawn_worker(DeliverySink::new(0, 8, send), || {
            Err(crate::Error::producer("boom"))
        })?;
        let (items, error) = collect(&mut recv).await;
        assert!(items.is_empty());
        assert_eq!(error.map(|e| e.data().to_owned()).as_deref(), Some("boom"));
        Ok(())
    }

    #[tokio::test]
    async fn test_background_cancel_once() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(futures::future::pending::<()>());
        let mut handle = BackgroundHandle::new(task).on_cancel({
            let cancelled = cancelled.clone();
            move || {
                cancelled.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(!handle.is_finished());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        drop(handle);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        // finished producers are released without running the hook
        let task = tokio::spawn(async {});
        let handle = BackgroundHandle::new(task).on_cancel({
            let cancelled = cancelled.clone();
            move || {
                cancelled.fetch_add(1, Ordering::SeqCst);
            }
        });
        handle.release();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }
}
