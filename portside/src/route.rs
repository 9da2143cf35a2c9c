//! URI-template routing helper.
//!
//! Templates are segment-wise: literals, `{name}` captures, and
//! `{name: regex}` captures with a per-segment pattern. Captured values
//! are URL-decoded; matrix parameters (`;k=v`) stay attached to their
//! segment. Trailing slashes are permissive: `/blah/` matches a `/blah`
//! template.

use std::sync::Arc;

use portside_h1::Method;
use regex::Regex;

use crate::error::Error;
use crate::handler::Handler;
use crate::request::Request;
use crate::response::Response;

/// Captured path parameters for one matched route.
#[derive(Debug, Default, Clone)]
pub struct PathParams {
    params: Vec<(String, String)>,
}

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[derive(Debug)]
enum Segment {
    Literal(String),
    Capture { name: String, pattern: Option<Regex> },
}

/// A compiled URI template.
#[derive(Debug)]
pub struct RouteTemplate {
    segments: Vec<Segment>,
}

impl RouteTemplate {
    /// Compile a template like `/widgets/{id: [0-9]+}/parts/{part}`.
    pub fn compile(template: &str) -> Result<Self, Error> {
        let mut segments = Vec::new();
        for raw in template.split('/').filter(|s| !s.is_empty()) {
            if let Some(inner) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                let (name, pattern) = match inner.split_once(':') {
                    Some((name, pattern)) => {
                        let anchored = format!("^(?:{})$", pattern.trim());
                        let regex = Regex::new(&anchored).map_err(|e| {
                            Error::Config(format!("bad pattern in segment {{{inner}}}: {e}"))
                        })?;
                        (name.trim().to_string(), Some(regex))
                    }
                    None => (inner.trim().to_string(), None),
                };
                if name.is_empty() {
                    return Err(Error::Config(format!(
                        "empty capture name in template {template}"
                    )));
                }
                segments.push(Segment::Capture { name, pattern });
            } else {
                segments.push(Segment::Literal(raw.to_string()));
            }
        }
        Ok(Self { segments })
    }

    /// Match a request path, producing captures on success.
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = PathParams::default();
        for (segment, part) in self.segments.iter().zip(&parts) {
            // Matrix parameters do not take part in matching, but captured
            // values keep them.
            let base = part.split(';').next().unwrap_or(part);
            match segment {
                Segment::Literal(lit) => {
                    if base != lit {
                        return None;
                    }
                }
                Segment::Capture { name, pattern } => {
                    let decoded_base = percent_decode(base);
                    if let Some(regex) = pattern {
                        if !regex.is_match(&decoded_base) {
                            return None;
                        }
                    }
                    params
                        .params
                        .push((name.clone(), percent_decode(part)));
                }
            }
        }
        Some(params)
    }
}

/// A handler that claims requests matching a method and URI template.
pub struct RouteHandler {
    method: Option<Method>,
    template: RouteTemplate,
    action: RouteAction,
}

type RouteAction =
    Box<dyn Fn(&mut Request, &mut Response, &PathParams) -> Result<(), Error> + Send + Sync>;

impl RouteHandler {
    pub fn new(
        method: Option<Method>,
        template: &str,
        action: impl Fn(&mut Request, &mut Response, &PathParams) -> Result<(), Error>
        + Send
        + Sync
        + 'static,
    ) -> Result<Arc<dyn Handler>, Error> {
        Ok(Arc::new(Self {
            method,
            template: RouteTemplate::compile(template)?,
            action: Box::new(action),
        }))
    }
}

impl Handler for RouteHandler {
    fn handle(&self, request: &mut Request, response: &mut Response) -> Result<bool, Error> {
        if let Some(method) = self.method {
            if request.method() != method {
                return Ok(false);
            }
        }
        let Some(params) = self.template.matches(request.path()) else {
            return Ok(false);
        };
        (self.action)(request, response, &params)?;
        Ok(true)
    }
}

/// Decode every `%XX` escape (route captures are fully decoded, unlike
/// the conservative parser-level path normalisation).
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_template() {
        let t = RouteTemplate::compile("/blah").unwrap();
        assert!(t.matches("/blah").is_some());
        assert!(t.matches("/blah/").is_some()); // permissive trailing slash
        assert!(t.matches("/blah/x").is_none());
        assert!(t.matches("/other").is_none());
    }

    #[test]
    fn named_captures_are_decoded() {
        let t = RouteTemplate::compile("/users/{name}/files/{file}").unwrap();
        let params = t.matches("/users/bob%20smith/files/a%2Fb").unwrap();
        assert_eq!(params.get("name"), Some("bob smith"));
        assert_eq!(params.get("file"), Some("a/b"));
        assert!(params.get("missing").is_none());
    }

    #[test]
    fn regex_captures_constrain_matching() {
        let t = RouteTemplate::compile("/orders/{id: [0-9]+}").unwrap();
        assert_eq!(t.matches("/orders/123").unwrap().get("id"), Some("123"));
        assert!(t.matches("/orders/abc").is_none());
    }

    #[test]
    fn matrix_parameters_are_retained_but_ignored_for_matching() {
        let t = RouteTemplate::compile("/cities/{city}").unwrap();
        let params = t.matches("/cities/paris;lang=fr").unwrap();
        assert_eq!(params.get("city"), Some("paris;lang=fr"));

        let t = RouteTemplate::compile("/cities/paris").unwrap();
        assert!(t.matches("/cities/paris;lang=fr").is_some());
    }

    #[test]
    fn bad_regex_is_a_config_error() {
        assert!(RouteTemplate::compile("/x/{id: [unclosed}").is_err());
    }

    #[test]
    fn empty_capture_name_rejected() {
        assert!(RouteTemplate::compile("/x/{}").is_err());
        assert!(RouteTemplate::compile("/x/{ : [0-9]+}").is_err());
    }
}
