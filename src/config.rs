//! Declarative source templates loaded from JSON
//!
//! ```json
//! [
//!     {"name": "files", "matcher": "tokens", "sorter": "score", "command": ["git", "ls-files"]},
//!     {"name": "grep", "inherit": "files", "async": true, "command": ["rg", "-l", "{}"]}
//! ]
//! ```
use crate::{
    filter::drop_first_token,
    matcher::{matcher_filter, FilterMatcher, MatcherRef},
    render::HighlightRenderer,
    scorer::CaseMatching,
    sorter::{IdentitySorter, ScoreSorter, SorterRef},
    source::{CandidateSupply, GeneratorRef, SourceTemplate},
    stream::{LineFormat, ProcessGenerator},
    Candidate, Error,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, sync::Arc};

/// Source declaration, unset fields are inherited
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDecl {
    pub name: String,
    /// Name of the declaration to inherit unset fields from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sorter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<Candidate>>,
    /// Program and its arguments, `{}` is replaced by the first query token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Stream command output line by line instead of waiting for it to finish
    #[serde(default, rename = "async", skip_serializing_if = "Option::is_none")]
    pub is_async: Option<bool>,
}

impl SourceDecl {
    /// Fill unset fields from the parent
    fn merge(self, parent: &SourceDecl) -> SourceDecl {
        SourceDecl {
            name: self.name,
            inherit: self.inherit,
            header: self.header.or_else(|| parent.header.clone()),
            matcher: self.matcher.or_else(|| parent.matcher.clone()),
            sorter: self.sorter.or_else(|| parent.sorter.clone()),
            candidates: self.candidates.or_else(|| parent.candidates.clone()),
            command: self.command.or_else(|| parent.command.clone()),
            is_async: self.is_async.or(parent.is_async),
        }
    }
}

/// Parse list of declarations
pub fn parse(data: &str) -> Result<Vec<SourceDecl>, Error> {
    Ok(serde_json::from_str(data)?)
}

/// Load list of declarations from the file
pub fn load(path: impl AsRef<Path>) -> Result<Vec<SourceDecl>, Error> {
    let data = std::fs::read_to_string(path)?;
    parse(&data)
}

fn sorter_by_name(name: &str) -> Result<SorterRef, Error> {
    match name {
        "score" => Ok(Arc::new(ScoreSorter)),
        "identity" => Ok(Arc::new(IdentitySorter)),
        _ => Err(Error::config(format!(
            "unknown sorter \"{}\" (expected one of: score, identity)",
            name
        ))),
    }
}

/// Follow inheritance chain of the declaration
fn flatten(decl: &SourceDecl, decls: &HashMap<&str, &SourceDecl>) -> Result<SourceDecl, Error> {
    let mut chain = vec![decl.name.as_str()];
    let mut result = decl.clone();
    let mut parent = decl.inherit.as_deref();
    while let Some(name) = parent {
        if chain.contains(&name) {
            return Err(Error::config(format!(
                "inheritance cycle: {} -> {}",
                chain.join(" -> "),
                name
            )));
        }
        let parent_decl = decls.get(name).ok_or_else(|| {
            Error::config(format!(
                "source \"{}\" inherits unknown source \"{}\"",
                decl.name, name
            ))
        })?;
        chain.push(name);
        result = result.merge(parent_decl);
        parent = parent_decl.inherit.as_deref();
    }
    Ok(result)
}

/// Build template from a fully merged declaration
fn template(decl: SourceDecl, case: CaseMatching) -> Result<SourceTemplate, Error> {
    let base = SourceTemplate {
        renderer: Arc::new(HighlightRenderer),
        ..SourceTemplate::new(decl.name.clone())
    };
    let mut seeded = false;
    let generator: Option<GeneratorRef> = match decl.command {
        None => None,
        Some(command) => {
            let (program, args) = command.split_first().ok_or_else(|| {
                Error::config(format!("source \"{}\": empty command", decl.name))
            })?;
            let args = args.to_vec();
            let generator = if decl.is_async.unwrap_or(false) {
                ProcessGenerator::new(program.clone(), args, LineFormat::Plain)
            } else {
                ProcessGenerator::collected(program.clone(), args, LineFormat::Plain)
            };
            seeded = generator.is_seeded();
            Some(Arc::new(generator))
        }
    };
    let matcher: Option<MatcherRef> = match decl.matcher.as_deref() {
        None => None,
        Some(name) => {
            let filter = matcher_filter(name, case)?;
            let filter = if seeded { drop_first_token(filter) } else { filter };
            Some(Arc::new(FilterMatcher::new(name, filter)))
        }
    };
    Ok(SourceTemplate {
        header: decl.header.or(base.header.clone()),
        matcher,
        sorter: match decl.sorter.as_deref() {
            Some(name) => sorter_by_name(name)?,
            None => base.sorter.clone(),
        },
        candidates: match decl.candidates {
            Some(candidates) => CandidateSupply::List(candidates),
            None => CandidateSupply::None,
        },
        generator,
        ..base
    })
}

/// Resolve declarations into templates
///
/// Every declaration is resolved on its own, so a broken one does not affect
/// the rest.
pub fn templates(decls: &[SourceDecl], case: CaseMatching) -> Vec<Result<SourceTemplate, Error>> {
    let by_name: HashMap<&str, &SourceDecl> =
        decls.iter().map(|decl| (decl.name.as_str(), decl)).collect();
    decls
        .iter()
        .map(|decl| template(flatten(decl, &by_name)?, case))
        .collect()
}
