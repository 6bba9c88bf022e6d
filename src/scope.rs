//! Decides which traffic the hook pipelines process.

use std::collections::HashSet;

use regex::Regex;

use crate::errors::{Error, Result};
use crate::request::Request;

/// The scope predicate: a host pattern and a set of excluded extensions.
///
/// A request is in scope when its host matches the pattern (absent pattern
/// matches everything) and its path extension is not excluded. Out-of-scope
/// exchanges bypass every pipeline stage.
#[derive(Debug, Default, Clone)]
pub struct Scope {
  domain_re: Option<Regex>,
  excluded_extensions: HashSet<String>,
}

impl Scope {
  /// Build a scope from an optional compiled pattern and a list of
  /// extensions (with or without the leading dot).
  pub fn new<I, S>(domain_re: Option<Regex>, excluded_extensions: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let excluded = excluded_extensions
      .into_iter()
      .map(|ex| {
        let ex = ex.as_ref().trim_start_matches('.').to_lowercase();
        format!(".{ex}")
      })
      .collect();
    Self {
      domain_re,
      excluded_extensions: excluded,
    }
  }

  /// Build a scope from configuration strings. An empty pattern means
  /// match-all; a malformed pattern is an error and installs nothing.
  pub fn from_config(domain_regex: &str, excluded_extensions: &[String]) -> Result<Self> {
    let domain_re = if domain_regex.is_empty() {
      None
    } else {
      Some(Regex::new(domain_regex).map_err(|e| Error::config(format!("invalid scope regex: {e}")))?)
    };
    Ok(Self::new(domain_re, excluded_extensions))
  }

  /// Whether the request should be offered to the hook pipelines.
  pub fn is_in_scope(&self, request: &Request) -> bool {
    !self.is_excluded_extension(request) && self.is_included_domain(request)
  }

  fn is_excluded_extension(&self, request: &Request) -> bool {
    let ext = path_extension(request.uri().path());
    match ext {
      Some(ext) => self.excluded_extensions.contains(&ext),
      None => false,
    }
  }

  fn is_included_domain(&self, request: &Request) -> bool {
    let host = if !request.host().is_empty() {
      request.host().to_lowercase()
    } else {
      request
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase())
        .unwrap_or_default()
    };
    if host.is_empty() {
      return false;
    }
    match &self.domain_re {
      Some(re) => re.is_match(&host),
      None => true,
    }
  }
}

/// The final dot-suffix of the last path segment, lowercased, dot included.
fn path_extension(path: &str) -> Option<String> {
  let segment = path.rsplit('/').next().unwrap_or(path);
  segment
    .rfind('.')
    .filter(|&idx| idx + 1 < segment.len())
    .map(|idx| segment[idx..].to_lowercase())
}
