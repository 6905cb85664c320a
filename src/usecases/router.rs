//! Command router: ordered, declarative routes from updates to handlers.
//!
//! Routes are evaluated in registration order; the first whose predicate
//! matches and whose required state (if any) equals the session's state wins.
//! Routing is a pure function of `(update, state)`.

use crate::domain::{Payload, StateTag, Update};
use crate::ports::Handler;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Closed set of match rules.
#[derive(Clone)]
pub enum Predicate {
    /// `/name` (case-insensitive, bot suffix ignored).
    Command(String),
    /// Any non-command text message.
    Text,
    /// Non-command text (or media caption) matching the pattern.
    Pattern(Regex),
    /// Callback query; with `Some(prefix)` only data starting with the prefix.
    Callback(Option<String>),
    /// Media message of any type.
    Media,
    Any,
}

impl Predicate {
    pub fn matches(&self, update: &Update) -> bool {
        match (self, &update.payload) {
            (Predicate::Any, _) => true,
            (Predicate::Command(want), Payload::Command { name, .. }) => want == name,
            (Predicate::Text, Payload::Text(_)) => true,
            (Predicate::Pattern(re), Payload::Text(text)) => re.is_match(text),
            (Predicate::Pattern(re), Payload::Media(m)) => {
                m.caption.as_deref().is_some_and(|c| re.is_match(c))
            }
            (Predicate::Callback(prefix), Payload::Callback { data, .. }) => {
                prefix.as_deref().is_none_or(|p| data.starts_with(p))
            }
            (Predicate::Media, Payload::Media(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Command(c) => write!(f, "Command(/{c})"),
            Predicate::Text => f.write_str("Text"),
            Predicate::Pattern(re) => write!(f, "Pattern({})", re.as_str()),
            Predicate::Callback(p) => write!(f, "Callback({p:?})"),
            Predicate::Media => f.write_str("Media"),
            Predicate::Any => f.write_str("Any"),
        }
    }
}

/// A predicate, an optional required state and the handler to run.
#[derive(Clone)]
pub struct Route {
    name: String,
    predicate: Predicate,
    required_state: Option<StateTag>,
    handler: Arc<dyn Handler>,
}

impl Route {
    pub fn new(name: impl Into<String>, predicate: Predicate, handler: Arc<dyn Handler>) -> Self {
        Self {
            name: name.into(),
            predicate,
            required_state: None,
            handler,
        }
    }

    pub fn command(command: &str, handler: Arc<dyn Handler>) -> Self {
        let name = command.trim_start_matches('/').to_lowercase();
        Self::new(format!("/{name}"), Predicate::Command(name), handler)
    }

    pub fn text(name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self::new(name, Predicate::Text, handler)
    }

    pub fn callback(name: impl Into<String>, prefix: Option<&str>, handler: Arc<dyn Handler>) -> Self {
        Self::new(name, Predicate::Callback(prefix.map(String::from)), handler)
    }

    /// Only match while the session is in `state`.
    pub fn in_state(mut self, state: StateTag) -> Self {
        self.required_state = Some(state);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn matches(&self, update: &Update, state: StateTag) -> bool {
        self.required_state.is_none_or(|s| s == state) && self.predicate.matches(update)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("predicate", &self.predicate)
            .field("required_state", &self.required_state)
            .finish()
    }
}

/// Routing result.
pub enum RouteDecision<'a> {
    Matched(&'a Route),
    Fallback(&'a Arc<dyn Handler>),
    NoMatch,
}

impl<'a> RouteDecision<'a> {
    pub fn handler(&self) -> Option<&'a Arc<dyn Handler>> {
        match *self {
            RouteDecision::Matched(route) => Some(route.handler()),
            RouteDecision::Fallback(h) => Some(h),
            RouteDecision::NoMatch => None,
        }
    }

    /// Route name for logs.
    pub fn label(&self) -> &'a str {
        match *self {
            RouteDecision::Matched(route) => route.name(),
            RouteDecision::Fallback(_) => "fallback",
            RouteDecision::NoMatch => "none",
        }
    }
}

/// Read-only after construction; shared across lanes behind an `Arc`.
#[derive(Default, Clone)]
pub struct Router {
    routes: Vec<Route>,
    fallback: Option<Arc<dyn Handler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route (builder style). Order of registration is evaluation order.
    pub fn with(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn fallback(mut self, handler: Arc<dyn Handler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn route(&self, update: &Update, state: StateTag) -> RouteDecision<'_> {
        if let Some(route) = self.routes.iter().find(|r| r.matches(update, state)) {
            return RouteDecision::Matched(route);
        }
        match &self.fallback {
            Some(h) => RouteDecision::Fallback(h),
            None => RouteDecision::NoMatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandlerError, MediaReference, MediaType, Session};
    use crate::ports::HandlerOutput;

    struct Noop;

    #[async_trait::async_trait]
    impl Handler for Noop {
        async fn handle(&self, _u: &Update, s: Session) -> Result<HandlerOutput, HandlerError> {
            Ok(HandlerOutput::new(s))
        }
    }

    fn noop() -> Arc<dyn Handler> {
        Arc::new(Noop)
    }

    fn update(payload: Payload) -> Update {
        Update {
            update_id: 1,
            chat_id: 1,
            sender_id: 1,
            timestamp: 0,
            payload,
        }
    }

    fn router() -> Router {
        Router::new()
            .with(Route::command("start", noop()))
            .with(Route::text("name", noop()).in_state(StateTag::AwaitingName))
            .with(Route::new(
                "greeting",
                Predicate::Pattern(Regex::new("(?i)^hello").unwrap()),
                noop(),
            ))
            .with(Route::text("any text", noop()))
            .with(Route::callback("cancel button", Some("cancel"), noop()))
    }

    #[test]
    fn test_first_match_in_registration_order() {
        let r = router();
        let start = update(Payload::from_text("/start"));
        assert_eq!(r.route(&start, StateTag::Ready).label(), "/start");

        let text = update(Payload::Text("Bob".into()));
        assert_eq!(r.route(&text, StateTag::AwaitingName).label(), "name");
        assert_eq!(r.route(&text, StateTag::Ready).label(), "any text");

        let hello = update(Payload::Text("Hello there".into()));
        assert_eq!(r.route(&hello, StateTag::Ready).label(), "greeting");
    }

    #[test]
    fn test_no_match_and_fallback() {
        let unknown = update(Payload::from_text("/nope"));
        assert!(matches!(
            router().route(&unknown, StateTag::New),
            RouteDecision::NoMatch
        ));
        let with_fallback = router().fallback(noop());
        assert_eq!(
            with_fallback.route(&unknown, StateTag::New).label(),
            "fallback"
        );
    }

    #[test]
    fn test_callback_prefix_and_media() {
        let r = router();
        let cb = |data: &str| {
            update(Payload::Callback {
                query_id: "q".into(),
                data: data.into(),
                message_id: Some(3),
            })
        };
        assert_eq!(r.route(&cb("cancel:42"), StateTag::New).label(), "cancel button");
        assert!(matches!(r.route(&cb("other"), StateTag::New), RouteDecision::NoMatch));

        let media = update(Payload::Media(MediaReference {
            media_type: MediaType::Photo,
            file_id: "f".into(),
            caption: Some("hello photo".into()),
        }));
        assert_eq!(r.route(&media, StateTag::New).label(), "greeting");
        assert!(Predicate::Media.matches(&media));
        assert!(!Predicate::Text.matches(&media));
    }

    #[test]
    fn test_routing_is_deterministic() {
        let r = router();
        let u = update(Payload::Text("Alice".into()));
        for _ in 0..5 {
            assert_eq!(r.route(&u, StateTag::AwaitingName).label(), "name");
        }
    }
}
