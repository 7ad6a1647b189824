//! Rule tables: nested rule declarations flattened into an ordered list of
//! `(patterns, handler)` entries.
//!
//! ```text
//! [ "//api.test", "//api2.test", [ "/users/:id", Handler, "/health", Handler ] ]
//! ```
//!
//! Consecutive prefix strings are alternatives, applied to every pattern in
//! the items that follow them. The example compiles to two entries, each with
//! two patterns.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use mocker_core::UrlPattern;
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::error::{Result, RuleError};
use crate::request::RequestContext;
use crate::response::{MockResponse, ResponseContext};

/// Async handler body.
pub type TransformFn = Arc<
    dyn for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, Result<Outcome>> + Send + Sync,
>;

/// What a transform decided.
pub enum Outcome {
    /// Continue with the next handler, then the next entry.
    Next,
    /// Answer the request with this response.
    Respond(ResponseContext),
    /// Run another handler in this one's place.
    Delegate(Handler),
    /// Stop evaluating the table without answering.
    Stop,
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Next => f.write_str("Next"),
            Outcome::Respond(res) => f.debug_tuple("Respond").field(&res.status()).finish(),
            Outcome::Delegate(handler) => f.debug_tuple("Delegate").field(handler).finish(),
            Outcome::Stop => f.write_str("Stop"),
        }
    }
}

/// A rule handler.
#[derive(Clone)]
pub enum Handler {
    /// Always answers with a copy of this response.
    Literal(MockResponse),
    /// Inspects or rewrites the request and decides what happens next.
    Transform(TransformFn),
    /// Runs handlers in order until one answers or stops.
    Chain(Vec<Handler>),
}

impl Handler {
    /// A handler answering with `response`.
    pub fn literal(response: MockResponse) -> Self {
        Handler::Literal(response)
    }

    /// An async handler.
    pub fn transform<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, Result<Outcome>>
            + Send
            + Sync
            + 'static,
    {
        Handler::Transform(Arc::new(f))
    }

    /// A synchronous handler.
    pub fn map<F>(f: F) -> Self
    where
        F: Fn(&mut RequestContext) -> Result<Outcome> + Send + Sync + 'static,
    {
        Handler::transform(move |req| {
            let outcome = f(req);
            Box::pin(async move { outcome })
        })
    }

    /// Handlers run in order.
    pub fn chain(handlers: impl IntoIterator<Item = Handler>) -> Self {
        Handler::Chain(handlers.into_iter().collect())
    }

    /// Stops table evaluation without answering.
    pub fn stop() -> Self {
        Handler::map(|_| Ok(Outcome::Stop))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Literal(res) => f.debug_tuple("Literal").field(&res.status()).finish(),
            Handler::Transform(_) => f.write_str("Transform"),
            Handler::Chain(handlers) => f.debug_tuple("Chain").field(handlers).finish(),
        }
    }
}

/// A node of the declarative rule structure.
#[derive(Debug, Clone)]
pub enum RuleNode {
    /// Pattern prefix for the items that follow. A leading `!` disables it.
    Prefix(String),
    /// Leaf handler.
    Handler(Handler),
    /// Nested sequence.
    Group(Vec<RuleNode>),
}

impl RuleNode {
    /// A prefix node.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        RuleNode::Prefix(prefix.into())
    }

    /// A group node.
    pub fn group(items: impl IntoIterator<Item = RuleNode>) -> Self {
        RuleNode::Group(items.into_iter().collect())
    }
}

impl From<Handler> for RuleNode {
    fn from(handler: Handler) -> Self {
        RuleNode::Handler(handler)
    }
}

impl From<&str> for RuleNode {
    fn from(prefix: &str) -> Self {
        RuleNode::Prefix(prefix.to_string())
    }
}

impl From<Vec<RuleNode>> for RuleNode {
    fn from(items: Vec<RuleNode>) -> Self {
        RuleNode::Group(items)
    }
}

/// One compiled entry.
#[derive(Debug, Clone)]
pub struct RuleEntry {
    patterns: Vec<UrlPattern>,
    handler: Handler,
}

impl RuleEntry {
    /// Alternative patterns; the first match wins.
    pub fn patterns(&self) -> &[UrlPattern] {
        &self.patterns
    }

    /// The handler run on match.
    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

/// Flattened entry before pattern compilation.
struct FlatEntry {
    patterns: Vec<String>,
    handler: Handler,
}

/// Result of running one entry's handler.
enum Resolution {
    Continue,
    Respond(ResponseContext),
    Stop,
}

/// A compiled, ordered rule table.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    entries: Vec<RuleEntry>,
}

impl RuleSet {
    /// An empty table.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Flattens and compiles a rule tree. The root must be a group.
    pub fn compile(root: RuleNode) -> std::result::Result<Self, RuleError> {
        let items = match root {
            RuleNode::Group(items) => items,
            _ => return Err(RuleError::NotAGroup),
        };

        let entries = flatten(items)
            .into_iter()
            .map(|flat| {
                let patterns = flat
                    .patterns
                    .iter()
                    .map(|p| UrlPattern::parse(p))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(RuleEntry {
                    patterns,
                    handler: flat.handler,
                })
            })
            .collect::<std::result::Result<Vec<_>, RuleError>>()?;

        Ok(Self { entries })
    }

    /// Compiled entries in evaluation order.
    pub fn entries(&self) -> &[RuleEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs the table against `req`.
    ///
    /// Returns the first response produced, or `None` when no entry
    /// answered or a handler stopped evaluation.
    pub async fn evaluate(&self, req: &mut RequestContext) -> Result<Option<ResponseContext>> {
        for entry in &self.entries {
            let params = entry
                .patterns
                .iter()
                .find_map(|pattern| pattern.matches(&req.match_target()));
            let Some(params) = params else {
                continue;
            };

            debug!("Rule {} matched {}", entry.patterns[0], req.href());
            req.set_params(params);

            match run(&entry.handler, req).await? {
                Resolution::Continue => continue,
                Resolution::Respond(response) => return Ok(Some(response)),
                Resolution::Stop => return Ok(None),
            }
        }
        Ok(None)
    }
}

fn flatten(items: Vec<RuleNode>) -> Vec<FlatEntry> {
    let mut result = Vec::new();
    let mut items = items.into_iter().peekable();

    while items.peek().is_some() {
        let mut contexts = Vec::new();
        while let Some(RuleNode::Prefix(_)) = items.peek() {
            if let Some(RuleNode::Prefix(prefix)) = items.next() {
                contexts.push(prefix);
            }
        }
        if contexts.is_empty() {
            contexts.push(String::new());
        }

        let mut children = Vec::new();
        while let Some(item) = items.next_if(|item| !matches!(item, RuleNode::Prefix(_))) {
            match item {
                RuleNode::Group(group) => children.extend(flatten(group)),
                RuleNode::Handler(handler) => children.push(FlatEntry {
                    patterns: vec![String::new()],
                    handler,
                }),
                RuleNode::Prefix(_) => {}
            }
        }

        let enabled: Vec<&String> = contexts.iter().filter(|c| !c.starts_with('!')).collect();
        if enabled.is_empty() {
            continue;
        }

        for child in children {
            let patterns = child
                .patterns
                .iter()
                .flat_map(|inner| enabled.iter().map(move |outer| format!("{}{}", outer, inner)))
                .collect();
            result.push(FlatEntry {
                patterns,
                handler: child.handler,
            });
        }
    }

    result
}

async fn run(handler: &Handler, req: &mut RequestContext) -> Result<Resolution> {
    let mut stack = vec![handler.clone()];

    while let Some(handler) = stack.pop() {
        match handler {
            Handler::Literal(mock) => {
                return Ok(Resolution::Respond(mock.to_response(req.method())));
            }
            Handler::Transform(f) => match f(req).await? {
                Outcome::Next => {}
                Outcome::Respond(response) => return Ok(Resolution::Respond(response)),
                Outcome::Delegate(next) => stack.push(next),
                Outcome::Stop => return Ok(Resolution::Stop),
            },
            Handler::Chain(handlers) => stack.extend(handlers.into_iter().rev()),
        }
    }

    Ok(Resolution::Continue)
}

/// Holds the active rule set. Readers take a snapshot per request.
#[derive(Debug, Default)]
pub struct RuleStore {
    current: RwLock<Arc<RuleSet>>,
}

impl RuleStore {
    /// Creates a store with `rules` active.
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
        }
    }

    /// The active rule set.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }

    /// Swaps in a new rule set.
    pub fn replace(&self, rules: RuleSet) {
        *self.current.write() = Arc::new(rules);
    }

    /// Compiles `root` and swaps it in. On error the previous set stays
    /// active.
    pub fn reload(&self, root: RuleNode) -> std::result::Result<usize, RuleError> {
        match RuleSet::compile(root) {
            Ok(rules) => {
                let count = rules.len();
                self.replace(rules);
                info!("Mock rules loaded ({} entries)", count);
                Ok(count)
            }
            Err(e) => {
                error!("Loading mock rules failed: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use crate::request::tests::context;
    use hyper::{Method, StatusCode};

    fn respond(body: &'static str) -> RuleNode {
        Handler::literal(MockResponse::text(body)).into()
    }

    fn patterns(rules: &RuleSet, index: usize) -> Vec<String> {
        rules.entries()[index]
            .patterns()
            .iter()
            .map(|p| p.as_str().to_string())
            .collect()
    }

    #[test]
    fn non_group_root_is_rejected() {
        assert!(matches!(
            RuleSet::compile(RuleNode::prefix("//a.test")),
            Err(RuleError::NotAGroup)
        ));
    }

    #[test]
    fn prefixes_cross_inner_patterns() {
        let rules = RuleSet::compile(RuleNode::group([
            "//a.test".into(),
            "//b.test".into(),
            RuleNode::group(["/x".into(), respond("x"), "/y".into(), respond("y")]),
        ]))
        .unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(patterns(&rules, 0), vec!["//a.test/x", "//b.test/x"]);
        assert_eq!(patterns(&rules, 1), vec!["//a.test/y", "//b.test/y"]);
    }

    #[test]
    fn handler_without_prefix_matches_everything() {
        let rules = RuleSet::compile(RuleNode::group([respond("all")])).unwrap();
        assert_eq!(patterns(&rules, 0), vec![""]);
    }

    #[test]
    fn disabled_prefixes_are_skipped() {
        let rules = RuleSet::compile(RuleNode::group([
            "!//off.test".into(),
            respond("off"),
            "!//off.test".into(),
            "//on.test".into(),
            respond("on"),
        ]))
        .unwrap();

        assert_eq!(rules.len(), 1);
        assert_eq!(patterns(&rules, 0), vec!["//on.test"]);
    }

    #[test]
    fn invalid_pattern_fails_compilation() {
        let result = RuleSet::compile(RuleNode::group(["//a.test:http".into(), respond("x")]));
        assert!(matches!(result, Err(RuleError::Pattern(_))));
    }

    #[tokio::test]
    async fn first_matching_entry_answers() {
        let rules = RuleSet::compile(RuleNode::group([
            "//a.test".into(),
            RuleNode::group([
                "/users/:id".into(),
                respond("user"),
                respond("also user"),
                "/::rest".into(),
                respond("fallback"),
            ]),
        ]))
        .unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(patterns(&rules, 1), vec!["//a.test/users/:id"]);

        let mut req = context(Method::GET, "http://a.test/users/42", None);
        let res = rules.evaluate(&mut req).await.unwrap().unwrap();
        assert_eq!(res.text().await.unwrap(), "user");
        assert_eq!(req.param("id"), Some("42"));

        let mut req = context(Method::GET, "http://a.test/other", None);
        let res = rules.evaluate(&mut req).await.unwrap().unwrap();
        assert_eq!(res.text().await.unwrap(), "fallback");

        let mut req = context(Method::GET, "http://b.test/users/1", None);
        assert!(rules.evaluate(&mut req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transforms_rewrite_then_fall_through() {
        let rules = RuleSet::compile(RuleNode::group([
            Handler::map(|req| {
                req.set_header("x-seen", "1")?;
                Ok(Outcome::Next)
            })
            .into(),
            "/ping".into(),
            Handler::map(|req| {
                let seen = req.header("x-seen").unwrap_or("0").to_string();
                Ok(Outcome::Respond(ResponseContext::from_text(StatusCode::OK, seen)))
            })
            .into(),
        ]))
        .unwrap();

        let mut req = context(Method::GET, "http://any.test/ping", None);
        let res = rules.evaluate(&mut req).await.unwrap().unwrap();
        assert_eq!(res.text().await.unwrap(), "1");
    }

    #[tokio::test]
    async fn stop_ends_evaluation_without_response() {
        let rules = RuleSet::compile(RuleNode::group([
            Handler::stop().into(),
            respond("unreachable"),
        ]))
        .unwrap();

        let mut req = context(Method::GET, "http://a.test/", None);
        assert!(rules.evaluate(&mut req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delegate_and_chain_resolve_in_order() {
        let inner = Handler::literal(MockResponse::text("delegated"));
        let rules = RuleSet::compile(RuleNode::group([Handler::chain([
            Handler::map(|_| Ok(Outcome::Next)),
            Handler::map(move |_| Ok(Outcome::Delegate(inner.clone()))),
            Handler::literal(MockResponse::text("too late")),
        ])
        .into()]))
        .unwrap();

        let mut req = context(Method::GET, "http://a.test/", None);
        let res = rules.evaluate(&mut req).await.unwrap().unwrap();
        assert_eq!(res.text().await.unwrap(), "delegated");
    }

    #[tokio::test]
    async fn async_transform_reads_body() {
        let rules = RuleSet::compile(RuleNode::group([Handler::transform(|req| {
            Box::pin(async move {
                let text = req.text().await?;
                Ok::<_, ProxyError>(Outcome::Respond(ResponseContext::from_text(
                    StatusCode::OK,
                    text,
                )))
            })
        })
        .into()]))
        .unwrap();

        let mut req = context(Method::GET, "http://a.test/", None);
        let res = rules.evaluate(&mut req).await.unwrap().unwrap();
        assert_eq!(res.text().await.unwrap(), "");
    }

    #[test]
    fn store_keeps_previous_rules_on_error() {
        let store = RuleStore::default();
        assert!(store.snapshot().is_empty());

        assert_eq!(
            store
                .reload(RuleNode::group(["/a".into(), respond("a")]))
                .unwrap(),
            1
        );
        assert!(store.reload(RuleNode::prefix("/not-a-group")).is_err());
        assert_eq!(store.snapshot().len(), 1);
    }
}
