#![deny(warnings)]
#![allow(clippy::type_complexity)]

use anyhow::{Context, Error};
use argh::FromArgs;
use sift::{
    config,
    matcher::{matcher_by_name, matcher_names},
    render::HighlightRenderer,
    scorer::CaseMatching,
    source::ActionRef,
    stream::{LineFormat, ReaderGenerator},
    Candidate, IdentitySorter, RenderedSource, ScoreSorter, Session, SorterRef, SourceTemplate,
};
use std::{
    fs::File,
    io::{IsTerminal, Write},
    pin::Pin,
    sync::{Arc, Mutex},
};
use tokio::io::AsyncRead;
use tracing_subscriber::fmt::format::FmtSpan;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    let args: Args = argh::from_env();

    if args.version {
        println!(
            "sift {} ({})",
            env!("CARGO_PKG_VERSION"),
            env!("COMMIT_INFO")
        );
        return Ok(());
    }

    if let Some(log_path) = args.log.clone() {
        let log = Log::new(log_path)?;
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(move || log.clone())
            .init();
    }

    let json = args.json;
    let action: ActionRef = Arc::new(move |candidate: &Candidate| -> Result<(), sift::Error> {
        if json {
            println!("{}", serde_json::to_string(&candidate.to_json())?);
        } else {
            println!("{}", candidate);
        }
        Ok(())
    });

    let mut templates = Vec::new();
    if let Some(input) = open_input(&args).await? {
        let format = if args.json {
            LineFormat::Json
        } else {
            LineFormat::Plain
        };
        let sorter: SorterRef = if args.keep_order {
            Arc::new(IdentitySorter)
        } else {
            Arc::new(ScoreSorter)
        };
        templates.push(SourceTemplate {
            header: args.header.clone(),
            matcher: Some(matcher_by_name(&args.matcher, CaseMatching::Smart)?),
            sorter,
            renderer: Arc::new(HighlightRenderer),
            generator: Some(Arc::new(ReaderGenerator::new(input, format))),
            ..SourceTemplate::new("input")
        });
    }
    if let Some(path) = args.config.as_deref() {
        let decls = config::load(path)
            .with_context(|| format!("failed to load config: {}", path))?;
        for template in config::templates(&decls, CaseMatching::Smart) {
            match template {
                Ok(template) => templates.push(template),
                Err(error) => {
                    tracing::warn!(%error, "[main] invalid source declaration");
                    eprintln!("[sift] {}", error);
                }
            }
        }
    }
    if templates.is_empty() {
        return Err(anyhow::anyhow!(
            "nothing to select from, pipe in data or pass --input/--config"
        ));
    }

    let templates = templates.into_iter().map(|template| SourceTemplate {
        action: action.clone(),
        ..template
    });
    let mut session = Session::new(templates, None);
    for (name, error) in session.dropped() {
        eprintln!("[sift] source \"{}\" dropped: {}", name, error);
    }

    for error in settle(&mut session, args.query.as_str()).await {
        eprintln!("[sift] {}", error);
    }
    for source in session.sources() {
        if let Some(error) = source.failure() {
            eprintln!("[sift] source \"{}\" failed: {}", source.name(), error);
        }
    }

    match args.select {
        Some(offset) => {
            if offset >= session.total() {
                session.cancel();
                return Err(anyhow::anyhow!("no candidate at offset {}", offset));
            }
            session.select_set(offset);
            session.confirm()?;
        }
        None => {
            let rendered = session.render(args.limit);
            session.cancel();
            print_rendered(&rendered, args.json)?;
        }
    }

    Ok(())
}

/// Apply query and wait for every producer to finish
///
/// A failing source keeps its last good result, so errors are collected
/// (each distinct one once) instead of stopping the other sources.
async fn settle(session: &mut Session, query: &str) -> Vec<sift::Error> {
    let mut errors = Vec::new();
    let mut report = |error: sift::Error| {
        tracing::warn!(%error, "[main] query failed");
        if !errors.contains(&error) {
            errors.push(error);
        }
    };
    if let Err(error) = session.query_set(query) {
        report(error);
    }
    loop {
        match session.wait().await {
            Ok(true) => {}
            Ok(false) => break,
            Err(error) => report(error),
        }
    }
    errors
}

type Input = Pin<Box<dyn AsyncRead + Send>>;

async fn open_input(args: &Args) -> Result<Option<Input>, Error> {
    let input: Input = match args.input.as_deref() {
        Some("-") => Box::pin(tokio::io::stdin()),
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open input: {}", path))?;
            Box::pin(file)
        }
        None if std::io::stdin().is_terminal() => {
            if args.config.is_none() {
                return Err(anyhow::anyhow!(
                    "stdin can not be a tty, pipe in data instead"
                ));
            }
            return Ok(None);
        }
        None => Box::pin(tokio::io::stdin()),
    };
    Ok(Some(input))
}

fn print_rendered(rendered: &[RenderedSource], json: bool) -> Result<(), Error> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if json {
        serde_json::to_writer(&mut out, rendered)?;
        writeln!(out)?;
        return Ok(());
    }
    let multiple = rendered.len() > 1;
    for source in rendered {
        match source.header.as_deref() {
            Some(header) => writeln!(out, "# {}", header)?,
            None if multiple => writeln!(out, "# {}", source.name)?,
            None => {}
        }
        for item in source.items.iter() {
            writeln!(out, "{}", item.view.text)?;
        }
    }
    Ok(())
}

#[derive(Clone)]
struct Log {
    file: Arc<Mutex<File>>,
}

impl Log {
    fn new(file: String) -> Result<Self, Error> {
        let file = File::create(&file).with_context(|| format!("failed to create log: {}", file))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }
}

impl Write for Log {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.file.lock().unwrap_or_else(|error| error.into_inner());
        file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|error| error.into_inner());
        file.flush()
    }
}

/// Sift ranks candidates read from the input against a query
#[derive(FromArgs)]
pub struct Args {
    /// query string
    #[argh(option, short = 'q', default = "String::new()")]
    pub query: String,

    /// matcher used for the input source
    #[argh(option, from_str_fn(matcher_arg), default = "\"fuzzy\".to_string()")]
    pub matcher: String,

    /// do not reorder candidates
    #[argh(switch, long = "keep-order")]
    pub keep_order: bool,

    /// header of the input source
    #[argh(option)]
    pub header: Option<String>,

    /// JSON file with source declarations
    #[argh(option)]
    pub config: Option<String>,

    /// read input from the file instead of stdin (`-` is stdin)
    #[argh(option)]
    pub input: Option<String>,

    /// candidates are JSON values one per line, output is JSON
    #[argh(switch)]
    pub json: bool,

    /// confirm candidate at this offset and print it
    #[argh(option)]
    pub select: Option<usize>,

    /// maximum number of printed candidates per source
    #[argh(option)]
    pub limit: Option<usize>,

    /// log file (configure via RUST_LOG environment variable)
    #[argh(option)]
    pub log: Option<String>,

    /// show version and quit
    #[argh(switch)]
    pub version: bool,
}

fn matcher_arg(name: &str) -> Result<String, String> {
    if matcher_names().any(|known| known == name) {
        Ok(name.to_owned())
    } else {
        Err(format!(
            "unknown matcher \"{}\" (expected one of: {})",
            name,
            matcher_names().collect::<Vec<_>>().join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift::{CandidateSupply, ErrorKind};

    #[tokio::test]
    async fn test_settle_keeps_healthy_sources() -> Result<(), Error> {
        let reader: &'static [u8] = b"a(b\nab\n";
        let input = SourceTemplate {
            matcher: Some(matcher_by_name("regex", CaseMatching::Smart)?),
            generator: Some(Arc::new(ReaderGenerator::new(reader, LineFormat::Plain))),
            ..SourceTemplate::new("input")
        };
        let words = SourceTemplate {
            matcher: Some(matcher_by_name("substr", CaseMatching::Smart)?),
            candidates: CandidateSupply::List(vec!["a(x".into(), "b".into()]),
            ..SourceTemplate::new("words")
        };
        let mut session = Session::new([input, words], None);
        let errors = settle(&mut session, "a(").await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind(), &ErrorKind::Pattern);
        assert!(!session.is_running());

        let rendered = session.render(None);
        assert_eq!(rendered[1].total, 1);
        assert_eq!(rendered[1].items[0].view.text, "a(x");
        Ok(())
    }
}
