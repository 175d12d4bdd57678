use crate::http::{Method, Request, Response};
use std::collections::HashMap;
use std::sync::Arc;

/// Routing contract consumed by the core: populate the response and return,
/// or let the router report no match so the core composes a 404.
pub trait Handler: Send + Sync {
    fn handle(&self, req: &Request, res: &mut Response);
}

impl<F> Handler for F
where
    F: Fn(&Request, &mut Response) + Send + Sync,
{
    fn handle(&self, req: &Request, res: &mut Response) {
        self(req, res)
    }
}

enum Segment {
    Literal(String),
    /// The name is kept for route-definition readability; captured values are
    /// not surfaced through the routing contract.
    #[allow(dead_code)]
    Param(String),
    Wildcard,
}

struct PatternRoute {
    method: Method,
    segments: Vec<Segment>,
    handler: Arc<dyn Handler>,
}

/// (method, path) dispatch: exact-match dictionary lookup first, then the
/// pattern routes in registration order.
pub struct Router {
    exact: HashMap<(Method, String), Arc<dyn Handler>>,
    patterns: Vec<PatternRoute>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            exact: HashMap::new(),
            patterns: Vec::new(),
        }
    }

    /// Register a route. Paths with `:param` or `*` segments become pattern
    /// routes; everything else goes into the exact-match table.
    pub fn add(&mut self, method: Method, path: &str, handler: impl Handler + 'static) {
        let is_pattern = path
            .split('/')
            .any(|s| s.starts_with(':') || s.starts_with('*'));
        if is_pattern {
            let segments = path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| {
                    if let Some(name) = s.strip_prefix(':') {
                        Segment::Param(name.to_string())
                    } else if s.starts_with('*') {
                        Segment::Wildcard
                    } else {
                        Segment::Literal(s.to_string())
                    }
                })
                .collect();
            self.patterns.push(PatternRoute {
                method,
                segments,
                handler: Arc::new(handler),
            });
        } else {
            self.exact
                .insert((method, path.to_string()), Arc::new(handler));
        }
    }

    pub fn get(&mut self, path: &str, handler: impl Handler + 'static) {
        self.add(Method::Get, path, handler);
    }

    pub fn post(&mut self, path: &str, handler: impl Handler + 'static) {
        self.add(Method::Post, path, handler);
    }

    pub fn put(&mut self, path: &str, handler: impl Handler + 'static) {
        self.add(Method::Put, path, handler);
    }

    pub fn delete(&mut self, path: &str, handler: impl Handler + 'static) {
        self.add(Method::Delete, path, handler);
    }

    /// Dispatch to the first matching handler. `false` means no route
    /// matched and the caller owns the 404.
    pub fn route(&self, req: &Request, res: &mut Response) -> bool {
        // Query strings do not participate in matching.
        let path = req.path.split('?').next().unwrap_or(&req.path);

        if let Some(handler) = self.exact.get(&(req.method, path.to_string())) {
            handler.handle(req, res);
            return true;
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for pattern in &self.patterns {
            if pattern.method == req.method && matches_segments(&pattern.segments, &segments) {
                pattern.handler.handle(req, res);
                return true;
            }
        }
        false
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_segments(pattern: &[Segment], path: &[&str]) -> bool {
    let mut i = 0;
    for segment in pattern {
        match segment {
            Segment::Wildcard => return i < path.len(),
            Segment::Literal(lit) => {
                if path.get(i).map(|s| *s == lit.as_str()) != Some(true) {
                    return false;
                }
                i += 1;
            }
            Segment::Param(_) => {
                if i >= path.len() {
                    return false;
                }
                i += 1;
            }
        }
    }
    i == path.len()
}
