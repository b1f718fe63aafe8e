//! Rule-driven error normalization.
//!
//! A rule inspects a raw failure and either classifies it into a
//! [`TypedError`] or declines. The [`Normalizer`] chains user rules and the
//! built-ins, ending in a fallback that always produces an `UNKNOWN` error,
//! so normalization is total: no raw value escapes unclassified.

use crate::error::{AbortError, BoxError, ErrorCode, HttpError, SharedError, TimeoutError, TypedError};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::Arc;

type Predicate = dyn Fn(&SharedError) -> bool + Send + Sync;
type Classifier = dyn Fn(&SharedError) -> Option<TypedError> + Send + Sync;

/// How user rules combine with the built-ins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RulesMode {
    /// User rules are tried first, then the built-ins.
    #[default]
    Extend,
    /// Only user rules are tried; anything left falls through to `UNKNOWN`.
    Replace,
}

/// A single classification rule: raw failure in, typed error or decline out.
#[derive(Clone)]
pub struct Rule {
    code: Option<ErrorCode>,
    classify: Arc<Classifier>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule").field("code", &self.code).finish()
    }
}

impl Rule {
    /// Build a rule from a bare classifier function. The rule advertises no
    /// static code and is exempt from duplicate detection.
    pub fn new<F>(classify: F) -> Self
    where
        F: Fn(&SharedError) -> Option<TypedError> + Send + Sync + 'static,
    {
        Self { code: None, classify: Arc::new(classify) }
    }

    fn coded<F>(code: ErrorCode, classify: F) -> Self
    where
        F: Fn(&SharedError) -> Option<TypedError> + Send + Sync + 'static,
    {
        Self { code: Some(code), classify: Arc::new(classify) }
    }

    /// The statically declared output code, when the rule advertises one.
    pub fn declared_code(&self) -> Option<&ErrorCode> {
        self.code.as_ref()
    }

    /// Run the rule against a raw failure.
    pub fn apply(&self, raw: &SharedError) -> Option<TypedError> {
        (self.classify)(raw)
    }
}

/// Start a rule from a predicate over the raw failure.
pub fn when<P>(predicate: P) -> RuleBuilder
where
    P: Fn(&SharedError) -> bool + Send + Sync + 'static,
{
    RuleBuilder { predicate: Arc::new(predicate) }
}

/// Start a rule that matches when the raw failure downcasts to `E`.
pub fn instance<E>() -> RuleBuilder
where
    E: std::error::Error + Send + Sync + 'static,
{
    when(|raw| raw.downcast_ref::<E>().is_some())
}

/// Shorthand: classify any `E` under `code`, message taken from its
/// `Display`, `cause` and `raw` preserved.
pub fn instance_as<E>(code: ErrorCode) -> Rule
where
    E: std::error::Error + Send + Sync + 'static,
{
    instance::<E>().to_code(code).done()
}

/// A rule under construction: has a predicate, needs an output shape.
pub struct RuleBuilder {
    predicate: Arc<Predicate>,
}

impl RuleBuilder {
    /// Finish with a mapper that produces the complete typed error. The rule
    /// advertises no static code (the mapper may vary it), so it is exempt
    /// from duplicate detection.
    pub fn to_error<M>(self, mapper: M) -> Rule
    where
        M: Fn(&SharedError) -> TypedError + Send + Sync + 'static,
    {
        let predicate = self.predicate;
        Rule::new(move |raw| if predicate(raw) { Some(mapper(raw)) } else { None })
    }

    /// Fix the output code; the body supplies everything else.
    pub fn to_code(self, code: ErrorCode) -> CodedRuleBuilder {
        CodedRuleBuilder { predicate: self.predicate, code }
    }
}

/// A rule with a fixed output code, awaiting its body.
pub struct CodedRuleBuilder {
    predicate: Arc<Predicate>,
    code: ErrorCode,
}

impl CodedRuleBuilder {
    /// Finish with a body producing the non-code fields. `cause` and `raw`
    /// default to the original failure when the body leaves them unset.
    pub fn with<B>(self, body: B) -> Rule
    where
        B: Fn(&SharedError) -> ErrorBody + Send + Sync + 'static,
    {
        let CodedRuleBuilder { predicate, code } = self;
        Rule::coded(code.clone(), move |raw| {
            if !predicate(raw) {
                return None;
            }
            Some(body(raw).into_error(code.clone(), raw))
        })
    }

    /// Finish with the default body: message from the failure's `Display`,
    /// `cause` and `raw` set to the original.
    pub fn done(self) -> Rule {
        let CodedRuleBuilder { predicate, code } = self;
        Rule::coded(code.clone(), move |raw| {
            if !predicate(raw) {
                return None;
            }
            Some(ErrorBody::new(raw.to_string()).into_error(code.clone(), raw))
        })
    }
}

/// The non-code fields of a typed error, produced by a rule body.
#[derive(Debug, Clone, Default)]
pub struct ErrorBody {
    message: String,
    meta: Option<serde_json::Value>,
    status: Option<u16>,
    retryable: Option<bool>,
    cause: Option<SharedError>,
    path: Option<String>,
    title: Option<String>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Self::default() }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn with_cause(mut self, cause: SharedError) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    fn into_error(self, code: ErrorCode, raw: &SharedError) -> TypedError {
        let mut err = TypedError::new(code, self.message);
        if let Some(status) = self.status {
            err = err.with_status(status);
        }
        if let Some(meta) = self.meta {
            err = err.with_meta(meta);
        }
        if let Some(retryable) = self.retryable {
            err = err.with_retryable(retryable);
        }
        if let Some(path) = self.path {
            err = err.with_path(path);
        }
        if let Some(title) = self.title {
            err = err.with_title(title);
        }
        err.with_cause(self.cause.unwrap_or_else(|| raw.clone())).with_raw(raw.clone())
    }
}

/// Duplicate statically-declared codes in a rule list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSetError {
    DuplicateCode(String),
}

impl fmt::Display for RuleSetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleSetError::DuplicateCode(code) => {
                write!(f, "two rules declare the same code {:?}", code)
            }
        }
    }
}

impl std::error::Error for RuleSetError {}

type FallbackFn = dyn Fn(&SharedError) -> TypedError + Send + Sync;

/// Ordered rule chain plus the fallback that makes normalization total.
#[derive(Clone)]
pub struct Normalizer {
    rules: Vec<Rule>,
    fallback: Option<Arc<FallbackFn>>,
}

impl fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Normalizer")
            .field("rules", &self.rules)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl Default for Normalizer {
    /// Built-in rules only.
    fn default() -> Self {
        Self { rules: builtin_rules(), fallback: None }
    }
}

impl Normalizer {
    /// Build a normalizer from user rules. In [`RulesMode::Extend`] the
    /// built-ins run after the user rules; in [`RulesMode::Replace`] only
    /// the user rules run before the fallback.
    ///
    /// Rejects rule lists where two user rules statically declare the same
    /// code. Shadowing a built-in code is allowed: user rules run first
    /// precisely so callers can override the built-in classification.
    pub fn new(user_rules: Vec<Rule>, mode: RulesMode) -> Result<Self, RuleSetError> {
        let mut seen = HashSet::new();
        for rule in &user_rules {
            if let Some(code) = rule.declared_code() {
                if !seen.insert(code.clone()) {
                    return Err(RuleSetError::DuplicateCode(code.as_str().to_string()));
                }
            }
        }
        let mut rules = user_rules;
        if mode == RulesMode::Extend {
            rules.extend(builtin_rules());
        }
        Ok(Self { rules, fallback: None })
    }

    /// Replace the built-in `UNKNOWN` fallback with a custom constructor for
    /// values no rule matched. The result should still carry a non-empty
    /// code for normalization to stay meaningful.
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&SharedError) -> TypedError + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Classify a raw failure. Total: always yields a typed error.
    pub fn normalize(&self, raw: BoxError) -> TypedError {
        let shared: SharedError = Arc::from(raw);
        self.normalize_shared(shared)
    }

    pub(crate) fn normalize_shared(&self, raw: SharedError) -> TypedError {
        for rule in &self.rules {
            if let Some(err) = rule.apply(&raw) {
                return err;
            }
        }
        match &self.fallback {
            Some(fallback) => fallback(&raw),
            None => TypedError::new(ErrorCode::Unknown, raw.to_string())
                .with_cause(raw.clone())
                .with_raw(raw),
        }
    }
}

/// The built-in rules, in priority order: already-typed, abort, timeout,
/// http, network.
pub fn builtin_rules() -> Vec<Rule> {
    vec![typed_rule(), abort_rule(), timeout_rule(), http_rule(), network_rule()]
}

fn typed_rule() -> Rule {
    Rule::new(|raw| raw.downcast_ref::<TypedError>().cloned())
}

fn abort_rule() -> Rule {
    instance_as::<AbortError>(ErrorCode::Aborted)
}

fn timeout_rule() -> Rule {
    Rule::coded(ErrorCode::Timeout, |raw| {
        if let Some(err) = raw.downcast_ref::<TimeoutError>() {
            let body = ErrorBody::new(err.to_string()).with_meta(serde_json::json!({
                "elapsed_ms": err.elapsed.as_millis() as u64,
                "timeout_ms": err.timeout.as_millis() as u64,
            }));
            return Some(body.into_error(ErrorCode::Timeout, raw));
        }
        if raw.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return Some(ErrorBody::new(raw.to_string()).into_error(ErrorCode::Timeout, raw));
        }
        None
    })
}

fn http_rule() -> Rule {
    Rule::coded(ErrorCode::Http, |raw| {
        let err = raw.downcast_ref::<HttpError>()?;
        if err.status < 400 {
            return None;
        }
        let body = ErrorBody::new(err.message.clone()).with_status(err.status);
        Some(body.into_error(ErrorCode::Http, raw))
    })
}

const NETWORK_CODES: [&str; 5] =
    ["econnreset", "econnrefused", "etimedout", "enotfound", "eai_again"];

/// Heuristic network classification: connection-ish `io::Error` kinds, or a
/// message mentioning "network" / "fetch failed" / a well-known errno name.
/// Message text is locale- and library-dependent; callers needing tighter
/// classification should install their own rule ahead of this one.
fn looks_like_network(raw: &SharedError) -> bool {
    if let Some(io_err) = raw.downcast_ref::<io::Error>() {
        if matches!(
            io_err.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::TimedOut
        ) {
            return true;
        }
    }
    let message = raw.to_string().to_lowercase();
    message.contains("network")
        || message.contains("fetch failed")
        || NETWORK_CODES.iter().any(|code| message.contains(code))
}

fn network_rule() -> Rule {
    when(looks_like_network).to_code(ErrorCode::Network).done()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug, Clone)]
    struct AppError(&'static str);

    impl fmt::Display for AppError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "app error: {}", self.0)
        }
    }

    impl std::error::Error for AppError {}

    fn normalize(normalizer: &Normalizer, err: impl std::error::Error + Send + Sync + 'static) -> TypedError {
        normalizer.normalize(Box::new(err))
    }

    #[test]
    fn fallback_classifies_anything_as_unknown() {
        let n = Normalizer::default();
        let err = normalize(&n, AppError("mystery"));
        assert_eq!(err.code, ErrorCode::Unknown);
        assert!(err.retryable);
        assert!(err.raw.is_some());
        assert_eq!(err.message, "app error: mystery");
    }

    #[test]
    fn already_typed_errors_pass_through_preserved() {
        let n = Normalizer::default();
        let original = TypedError::new(ErrorCode::custom("QUOTA"), "over quota").with_retryable(false);
        let out = normalize(&n, original);
        assert_eq!(out.code, ErrorCode::custom("QUOTA"));
        assert!(!out.retryable);
    }

    #[test]
    fn abort_and_timeout_classify_to_their_codes() {
        let n = Normalizer::default();
        let aborted = normalize(&n, AbortError);
        assert_eq!(aborted.code, ErrorCode::Aborted);
        assert!(!aborted.retryable);

        let timed_out = normalize(
            &n,
            TimeoutError::new(std::time::Duration::from_millis(120), std::time::Duration::from_millis(100)),
        );
        assert_eq!(timed_out.code, ErrorCode::Timeout);
        assert!(timed_out.retryable);
        assert_eq!(timed_out.meta.as_ref().unwrap()["timeout_ms"], 100);
    }

    #[test]
    fn http_retryability_follows_status() {
        let n = Normalizer::default();
        let server = normalize(&n, HttpError::new(503, "unavailable"));
        assert_eq!(server.code, ErrorCode::Http);
        assert_eq!(server.status, Some(503));
        assert!(server.retryable);

        let throttled = normalize(&n, HttpError::new(429, "slow down"));
        assert!(throttled.retryable);

        let missing = normalize(&n, HttpError::new(404, "not found"));
        assert!(!missing.retryable);
    }

    #[test]
    fn network_rule_matches_io_kinds_and_messages() {
        let n = Normalizer::default();
        let reset = normalize(&n, io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"));
        assert_eq!(reset.code, ErrorCode::Network);
        assert!(reset.retryable);

        let by_message = normalize(&n, AppError("network unreachable"));
        assert_eq!(by_message.code, ErrorCode::Network);

        let errno = normalize(&n, AppError("ECONNREFUSED while dialing"));
        assert_eq!(errno.code, ErrorCode::Network);
    }

    #[test]
    fn user_rules_run_before_builtins_in_extend_mode() {
        let rule = instance::<io::Error>()
            .to_code(ErrorCode::custom("IO"))
            .with(|raw| ErrorBody::new(raw.to_string()).with_retryable(false));
        let n = Normalizer::new(vec![rule], RulesMode::Extend).unwrap();
        let err = normalize(&n, io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"));
        assert_eq!(err.code, ErrorCode::custom("IO"));
        assert!(!err.retryable);
    }

    #[test]
    fn replace_mode_skips_builtins() {
        let n = Normalizer::new(vec![], RulesMode::Replace).unwrap();
        let err = normalize(&n, HttpError::new(500, "boom"));
        assert_eq!(err.code, ErrorCode::Unknown);
    }

    #[test]
    fn duplicate_declared_codes_are_rejected() {
        let a = instance_as::<AppError>(ErrorCode::custom("APP"));
        let b = when(|_| true).to_code(ErrorCode::custom("APP")).done();
        let err = Normalizer::new(vec![a, b], RulesMode::Extend).unwrap_err();
        assert_eq!(err, RuleSetError::DuplicateCode("APP".to_string()));
    }

    #[test]
    fn dynamic_rules_are_exempt_from_duplicate_detection() {
        let a = when(|_| false).to_error(|raw| TypedError::new(ErrorCode::custom("X"), raw.to_string()));
        let b = when(|_| false).to_error(|raw| TypedError::new(ErrorCode::custom("X"), raw.to_string()));
        assert!(Normalizer::new(vec![a, b], RulesMode::Extend).is_ok());
    }

    #[test]
    fn body_defaults_cause_and_raw_to_the_original() {
        let rule = instance::<AppError>()
            .to_code(ErrorCode::Validation)
            .with(|_| ErrorBody::new("bad field").with_path("user.email"));
        let n = Normalizer::new(vec![rule], RulesMode::Extend).unwrap();
        let err = normalize(&n, AppError("invalid"));
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.path.as_deref(), Some("user.email"));
        assert!(!err.retryable);
        assert_eq!(err.cause.as_ref().unwrap().to_string(), "app error: invalid");
        assert_eq!(err.raw.as_ref().unwrap().to_string(), "app error: invalid");
    }

    #[test]
    fn custom_fallback_replaces_unknown() {
        let n = Normalizer::new(vec![], RulesMode::Replace)
            .unwrap()
            .with_fallback(|raw| {
                TypedError::new(ErrorCode::custom("OPAQUE"), raw.to_string()).with_retryable(false)
            });
        let err = normalize(&n, AppError("mystery"));
        assert_eq!(err.code, ErrorCode::custom("OPAQUE"));
        assert!(!err.retryable);
    }

    #[test]
    fn instance_as_uses_display_for_the_message() {
        let n = Normalizer::new(vec![instance_as::<AppError>(ErrorCode::custom("APP"))], RulesMode::Extend).unwrap();
        let err = normalize(&n, AppError("broken"));
        assert_eq!(err.code, ErrorCode::custom("APP"));
        assert_eq!(err.message, "app error: broken");
    }
}
