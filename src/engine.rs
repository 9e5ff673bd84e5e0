//! The compilation engine boundary (`spec.md` §6.1) and a minimal built-in
//! stylesheet engine that exercises every callback path the dispatch layer
//! has to support: nested rule compilation, dimensioned-number arithmetic,
//! `@import` resolution through both the filesystem and host importer
//! chains, and custom-function dispatch back to the host.

use crate::importer::{file_uri, load_from_filesystem, ImporterRef};
use crate::logging::CompilationLogger;
use crate::proto_gen::host::canonicalize_response::Result as CanonicalizeResult;
use crate::proto_gen::host::file_import_response::Result as FileImportResult;
use crate::proto_gen::host::function_call_response::Result as FunctionCallResult;
use crate::proto_gen::host::import_response::Result as ImportResult;
use crate::proto_gen::host::inbound_message::Message as Inbound;
use crate::proto_gen::host::outbound_message::Message as Outbound;
use crate::proto_gen::host::value::Value as WireValue;
use crate::proto_gen::host::{
    CanonicalizeRequest, CompileFailure, CompileRequest, CompileSuccess, FileImportRequest,
    FunctionCallRequest, ImportRequest, InboundMessage, OutputStyle, SourceSpan,
    Value,
};
use std::path::Path;

/// An engine-visible failure: carries enough to build a `CompileFailure` or
/// to propagate as an importer/function error, per `spec.md` §7.
#[derive(Debug, Clone)]
pub struct EngineError {
    pub message: String,
    pub span: Option<SourceSpan>,
    pub stack_trace: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            span: None,
            stack_trace: String::new(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(message)
    }

    pub fn not_found(url: impl Into<String>) -> Self {
        Self::new(format!("{} not found.", url.into()))
    }

    pub fn with_span(mut self, span: SourceSpan) -> Self {
        self.span = Some(span);
        self
    }

    pub fn into_failure(self) -> CompileFailure {
        let formatted = match &self.span {
            Some(span) => format!("Error: {}\n  {}:{}", self.message, span.url, span.start_line),
            None => format!("Error: {}", self.message),
        };
        CompileFailure {
            message: self.message,
            span: self.span,
            stack_trace: self.stack_trace,
            formatted,
        }
    }
}

impl From<CompileFailure> for EngineError {
    fn from(failure: CompileFailure) -> Self {
        Self {
            message: failure.message,
            span: failure.span,
            stack_trace: failure.stack_trace,
        }
    }
}

/// A blocking round trip on the worker's own channel: emit an outbound
/// callback request, suspend until the matching inbound response arrives.
/// Implemented by the worker (`spec.md` §4.C step 3); the engine never sees
/// the channel plumbing, only this call.
pub trait RoundTrip {
    fn call(&self, message: Outbound) -> InboundMessage;
}

/// The synchronous callback surface the engine is handed for one
/// compilation (`spec.md` §6.1).
pub struct HostServices<'a> {
    pub compilation_id: u32,
    round_trip: &'a dyn RoundTrip,
    logger: &'a CompilationLogger,
}

impl<'a> HostServices<'a> {
    pub fn new(
        compilation_id: u32,
        round_trip: &'a dyn RoundTrip,
        logger: &'a CompilationLogger,
    ) -> Self {
        Self {
            compilation_id,
            round_trip,
            logger,
        }
    }

    pub fn warn(&self, message: &str, span: Option<SourceSpan>) {
        self.logger.warning(message, span);
    }

    pub fn deprecation_warn(&self, message: &str, span: Option<SourceSpan>) {
        self.logger.deprecation_warning(message, span);
    }

    pub fn debug(&self, message: &str, span: Option<SourceSpan>) {
        self.logger.debug(message, span);
    }

    /// Resolves `url` against an importer. The filesystem case never
    /// leaves this process; the host cases issue a blocking callback.
    pub fn canonicalize(
        &self,
        importer: &ImporterRef,
        url: &str,
        from_import: bool,
    ) -> Result<String, EngineError> {
        match importer {
            ImporterRef::Filesystem(base) => Ok(file_uri(&base.join(url))),
            ImporterRef::Host(importer_id) => {
                let reply = self.round_trip.call(Outbound::CanonicalizeRequest(
                    CanonicalizeRequest {
                        id: 0,
                        importer_id: *importer_id,
                        url: url.to_string(),
                        from_import,
                    },
                ));
                match take(reply, |m| matches!(m, Inbound::CanonicalizeResponse(_)))? {
                    Inbound::CanonicalizeResponse(resp) => match resp.result {
                        Some(CanonicalizeResult::Url(url)) => Ok(url),
                        Some(CanonicalizeResult::Error(failure)) => Err(failure.into()),
                        None => Err(EngineError::not_found(url)),
                    },
                    _ => unreachable!("matched by take()"),
                }
            }
            ImporterRef::FileHost(_) => Err(EngineError::internal(
                "file importers do not participate in canonicalization",
            )),
        }
    }

    pub fn load(&self, importer: &ImporterRef, canonical_url: &str) -> Result<String, EngineError> {
        match importer {
            ImporterRef::Filesystem(base) => {
                let relative = canonical_url.strip_prefix("file://").unwrap_or(canonical_url);
                load_from_filesystem(base, relative)
            }
            ImporterRef::Host(importer_id) => {
                let reply = self
                    .round_trip
                    .call(Outbound::ImportRequest(ImportRequest {
                        id: 0,
                        importer_id: *importer_id,
                        url: canonical_url.to_string(),
                    }));
                match take(reply, |m| matches!(m, Inbound::ImportResponse(_)))? {
                    Inbound::ImportResponse(resp) => match resp.result {
                        Some(ImportResult::Success(success)) => Ok(success.contents),
                        Some(ImportResult::Error(failure)) => Err(failure.into()),
                        None => Err(EngineError::not_found(canonical_url)),
                    },
                    _ => unreachable!("matched by take()"),
                }
            }
            ImporterRef::FileHost(importer_id) => {
                let reply = self
                    .round_trip
                    .call(Outbound::FileImportRequest(FileImportRequest {
                        id: 0,
                        importer_id: *importer_id,
                        url: canonical_url.to_string(),
                    }));
                match take(reply, |m| matches!(m, Inbound::FileImportResponse(_)))? {
                    Inbound::FileImportResponse(resp) => match resp.result {
                        Some(FileImportResult::FileUrl(file_url)) => {
                            let path = file_url.trim_start_matches("file://");
                            std::fs::read_to_string(path)
                                .map_err(|e| EngineError::new(e.to_string()))
                        }
                        Some(FileImportResult::Error(failure)) => Err(failure.into()),
                        None => Err(EngineError::not_found(canonical_url)),
                    },
                    _ => unreachable!("matched by take()"),
                }
            }
        }
    }

    pub fn function_call(&self, name: &str, arguments: Vec<Value>) -> Result<Value, EngineError> {
        let reply = self
            .round_trip
            .call(Outbound::FunctionCallRequest(FunctionCallRequest {
                id: 0,
                compilation_id: self.compilation_id,
                identifier: Some(
                    crate::proto_gen::host::function_call_request::Identifier::Name(
                        name.to_string(),
                    ),
                ),
                arguments,
            }));
        match take(reply, |m| matches!(m, Inbound::FunctionCallResponse(_)))? {
            Inbound::FunctionCallResponse(resp) => match resp.result {
                Some(FunctionCallResult::Success(value)) => Ok(value),
                Some(FunctionCallResult::Error(failure)) => Err(failure.into()),
                None => Err(EngineError::internal("function call returned no result")),
            },
            _ => unreachable!("matched by take()"),
        }
    }
}

fn take(
    reply: InboundMessage,
    expected: impl Fn(&Inbound) -> bool,
) -> Result<Inbound, EngineError> {
    match reply.message {
        Some(m) if expected(&m) => Ok(m),
        Some(_) => Err(EngineError::internal(
            "host replied with a response of the wrong type for this callback",
        )),
        None => Err(EngineError::internal("InboundMessage.message is not set.")),
    }
}

/// The external compilation engine boundary. `spec.md` §6.1 treats this as
/// an opaque blocking function; this trait is how the worker invokes it.
pub trait CompileEngine: Send + Sync {
    fn compile(
        &self,
        request: &CompileRequest,
        services: &HostServices,
    ) -> Result<CompileSuccess, EngineError>;
}

/// A small nested-rule stylesheet compiler: selectors with declarations,
/// dimensioned-number arithmetic, string literals, and `@import`.
/// Exercises every host-services callback without depending on a full
/// grammar implementation.
#[derive(Default)]
pub struct BuiltinEngine;

impl CompileEngine for BuiltinEngine {
    fn compile(
        &self,
        request: &CompileRequest,
        services: &HostServices,
    ) -> Result<CompileSuccess, EngineError> {
        let (source, url, default_importer) = self.resolve_input(request)?;
        let importers: Vec<ImporterRef> = request
            .importers
            .iter()
            .map(ImporterRef::from_wire)
            .collect::<Result<_, _>>()?;

        let mut loaded_urls = vec![url];
        let css = self.compile_source(&source, &importers, default_importer, services, &mut loaded_urls)?;
        let style = OutputStyle::try_from(request.style).unwrap_or(OutputStyle::Expanded);
        Ok(CompileSuccess {
            css: render(&css, style),
            loaded_urls,
            source_map: String::new(),
        })
    }
}

impl BuiltinEngine {
    fn resolve_input(
        &self,
        request: &CompileRequest,
    ) -> Result<(String, String, Option<ImporterRef>), EngineError> {
        use crate::proto_gen::host::compile_request::Input;
        match &request.input {
            Some(Input::StringInput(input)) => {
                let importer = match &input.importer {
                    Some(importer) => Some(ImporterRef::from_wire(importer)?),
                    None => None,
                };
                let url = if input.url.is_empty() {
                    "stdin".to_string()
                } else {
                    input.url.clone()
                };
                Ok((input.source.clone(), url, importer))
            }
            Some(Input::PathInput(input)) => {
                let path = Path::new(&input.path);
                let source = std::fs::read_to_string(path).map_err(|_| {
                    EngineError::not_found(file_uri(path)).with_span(SourceSpan {
                        url: file_uri(path),
                        start_line: 0,
                        start_column: 0,
                        end_line: 0,
                        end_column: 0,
                        context: String::new(),
                    })
                })?;
                Ok((source, input.path.clone(), None))
            }
            None => Err(EngineError::internal("CompileRequest.input is not set.")),
        }
    }

    fn compile_source(
        &self,
        source: &str,
        importers: &[ImporterRef],
        default_importer: Option<ImporterRef>,
        services: &HostServices,
        loaded_urls: &mut Vec<String>,
    ) -> Result<Vec<Rule>, EngineError> {
        let mut rules = Vec::new();
        let mut rest = source;
        loop {
            rest = skip_whitespace(rest);
            if rest.is_empty() {
                break;
            }
            if let Some(after_at) = rest.strip_prefix("@import") {
                services.deprecation_warn(
                    "@import is deprecated. Use @use rules instead.",
                    None,
                );
                let (literal, after) = parse_string_literal(skip_whitespace(after_at))?;
                let after = skip_whitespace(after);
                let after = after.strip_prefix(';').unwrap_or(after);
                rest = after;

                let importer = default_importer
                    .clone()
                    .or_else(|| importers.first().cloned())
                    .ok_or_else(|| EngineError::not_found(literal.clone()))?;
                let canonical = services.canonicalize(&importer, &literal, true)?;
                let contents = services.load(&importer, &canonical)?;
                services.debug(&format!("Loaded {canonical}."), None);
                loaded_urls.push(canonical);
                let imported = self.compile_source(&contents, importers, Some(importer), services, loaded_urls)?;
                rules.extend(imported);
                continue;
            }

            let (selector, after) = parse_selector(rest)?;
            let (declarations, after) = parse_block(after, services)?;
            rules.push(Rule {
                selector,
                declarations,
            });
            rest = after;
        }
        Ok(rules)
    }
}

struct Rule {
    selector: String,
    declarations: Vec<(String, String)>,
}

fn render(rules: &[Rule], style: OutputStyle) -> String {
    let mut out = String::new();
    for rule in rules {
        let body = rule
            .declarations
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("; ");
        match style {
            OutputStyle::Expanded => {
                out.push_str(&format!("{} {{ {}; }}\n", rule.selector, body));
            }
            OutputStyle::Compressed => {
                let compact = rule
                    .declarations
                    .iter()
                    .map(|(k, v)| format!("{k}:{v}"))
                    .collect::<Vec<_>>()
                    .join(";");
                out.push_str(&format!("{}{{{}}}", rule.selector, compact));
            }
        }
    }
    if style == OutputStyle::Expanded {
        out.pop(); // Trailing newline after the last rule.
    }
    out
}

fn skip_whitespace(s: &str) -> &str {
    s.trim_start()
}

fn parse_selector(s: &str) -> Result<(String, &str), EngineError> {
    let brace = s
        .find('{')
        .ok_or_else(|| EngineError::new("expected \"{\"."))?;
    Ok((s[..brace].trim().to_string(), &s[brace + 1..]))
}

fn parse_block<'a>(
    s: &'a str,
    services: &HostServices,
) -> Result<(Vec<(String, String)>, &'a str), EngineError> {
    let close = s
        .find('}')
        .ok_or_else(|| EngineError::new("expected \"}\"."))?;
    let body = &s[..close];
    let mut declarations = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for stmt in body.split(';') {
        let stmt = stmt.trim();
        if stmt.is_empty() {
            continue;
        }
        let colon = stmt
            .find(':')
            .ok_or_else(|| EngineError::new(format!("Expected \":\" in \"{stmt}\".")))?;
        let property = stmt[..colon].trim().to_string();
        let value = evaluate_expr(stmt[colon + 1..].trim(), services)?;
        if !seen.insert(property.clone()) {
            services.warn(
                &format!("Duplicate property \"{property}\" found, overriding previous value."),
                None,
            );
        }
        declarations.push((property, value));
    }
    Ok((declarations, &s[close + 1..]))
}

fn evaluate_expr(expr: &str, services: &HostServices) -> Result<String, EngineError> {
    if let Ok((literal, rest)) = parse_string_literal(expr) {
        if rest.trim().is_empty() {
            return Ok(format!("\"{literal}\""));
        }
    }

    let mut terms = expr.split(|c| c == '+' || c == '-').peekable();
    let mut ops = expr.chars().filter(|c| *c == '+' || *c == '-');

    let first = terms.next().ok_or_else(|| EngineError::new("empty expression."))?;
    let (mut value, mut unit) = parse_number(first.trim(), services)?;

    for term in terms {
        let op = ops.next().unwrap_or('+');
        let (next_value, next_unit) = parse_number(term.trim(), services)?;
        let resolved_unit = match (unit.as_str(), next_unit.as_str()) {
            (a, b) if a == b => unit.clone(),
            (a, "") => a.to_string(),
            ("", b) => b.to_string(),
            (a, b) => {
                return Err(EngineError::new(format!(
                    "Incompatible units {a} and {b}."
                )))
            }
        };
        value = if op == '+' { value + next_value } else { value - next_value };
        unit = resolved_unit;
    }

    Ok(format_number(value, &unit))
}

fn parse_number(term: &str, services: &HostServices) -> Result<(f64, String), EngineError> {
    let digits_end = term
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(term.len());
    if digits_end == 0 {
        // Not a numeric literal: treat as a bare identifier, which may be a
        // custom function call of zero arguments.
        let value = services.function_call(term, Vec::new())?;
        return Ok(number_from_value(value));
    }
    let value: f64 = term[..digits_end]
        .parse()
        .map_err(|_| EngineError::new(format!("\"{term}\" is not a number.")))?;
    Ok((value, term[digits_end..].to_string()))
}

fn number_from_value(value: Value) -> (f64, String) {
    match value.value {
        Some(WireValue::Number(n)) => (n.value, n.unit),
        _ => (0.0, String::new()),
    }
}

fn format_number(value: f64, unit: &str) -> String {
    if value.fract() == 0.0 {
        format!("{}{}", value as i64, unit)
    } else {
        format!("{value}{unit}")
    }
}

fn parse_string_literal(s: &str) -> Result<(String, &str), EngineError> {
    let s = skip_whitespace(s);
    let quote = s
        .chars()
        .next()
        .filter(|c| *c == '\'' || *c == '"')
        .ok_or_else(|| EngineError::new("expected a quoted string."))?;
    let rest = &s[1..];
    let end = rest
        .find(quote)
        .ok_or_else(|| EngineError::new("unterminated string."))?;
    Ok((rest[..end].to_string(), &rest[end + 1..]))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto_gen::host::compile_request::Input;
    use crate::proto_gen::host::StringInput;

    struct NoCallbacks;
    impl RoundTrip for NoCallbacks {
        fn call(&self, _message: Outbound) -> InboundMessage {
            panic!("no callbacks expected in this test")
        }
    }

    fn compile(source: &str) -> CompileSuccess {
        let logger_tx = tokio::sync::mpsc::unbounded_channel().0;
        let logger = CompilationLogger::new(1, false, true, logger_tx);
        let round_trip = NoCallbacks;
        let services = HostServices::new(1, &round_trip, &logger);
        let request = CompileRequest {
            id: 1,
            style: OutputStyle::Expanded as i32,
            importers: Vec::new(),
            global_functions: Vec::new(),
            input: Some(Input::StringInput(StringInput {
                source: source.to_string(),
                syntax: 0,
                url: String::new(),
                importer: None,
            })),
            alert_color: false,
            alert_ascii: true,
            quiet_deps: false,
            verbose: false,
            source_map: false,
            source_map_include_sources: false,
            charset: false,
        };
        BuiltinEngine.compile(&request, &services).unwrap()
    }

    #[test]
    fn test_simple_arithmetic() {
        let success = compile("a {b: 1px + 2px}");
        assert_eq!(success.css, "a { b: 3px; }");
    }

    #[test]
    fn test_duplicate_property_emits_warning() {
        let (logger_tx, mut logger_rx) = tokio::sync::mpsc::unbounded_channel();
        let logger = CompilationLogger::new(1, false, true, logger_tx);
        let round_trip = NoCallbacks;
        let services = HostServices::new(1, &round_trip, &logger);
        let (declarations, _) = parse_block("b: 1px; b: 2px}", &services).unwrap();
        assert_eq!(
            declarations,
            vec![("b".to_string(), "1px".to_string()), ("b".to_string(), "2px".to_string())]
        );

        let (_, msg) = logger_rx.try_recv().unwrap();
        match msg.message {
            Some(crate::proto_gen::host::outbound_message::Message::LogEvent(event)) => {
                assert_eq!(event.r#type, crate::proto_gen::host::LogEventType::Warning as i32);
                assert!(event.message.contains("Duplicate property \"b\""));
            }
            other => panic!("expected a LogEvent, got {other:?}"),
        }
    }

    struct FakeHost;
    impl RoundTrip for FakeHost {
        fn call(&self, message: Outbound) -> InboundMessage {
            match message {
                Outbound::CanonicalizeRequest(req) => InboundMessage {
                    message: Some(Inbound::CanonicalizeResponse(
                        crate::proto_gen::host::CanonicalizeResponse {
                            id: req.id,
                            result: Some(CanonicalizeResult::Url(format!("u:{}", req.url))),
                        },
                    )),
                },
                Outbound::ImportRequest(req) => InboundMessage {
                    message: Some(Inbound::ImportResponse(crate::proto_gen::host::ImportResponse {
                        id: req.id,
                        result: Some(ImportResult::Success(crate::proto_gen::host::ImportSuccess {
                            contents: "c{d:1}".to_string(),
                            syntax: 0,
                            source_map_url: String::new(),
                        })),
                    })),
                },
                other => panic!("unexpected callback in this test: {other:?}"),
            }
        }
    }

    #[test]
    fn test_repeated_import_deduplicates_deprecation_warning() {
        let (logger_tx, mut logger_rx) = tokio::sync::mpsc::unbounded_channel();
        let logger = CompilationLogger::new(1, false, true, logger_tx);
        let round_trip = FakeHost;
        let services = HostServices::new(1, &round_trip, &logger);
        let request = CompileRequest {
            id: 1,
            style: OutputStyle::Expanded as i32,
            importers: vec![crate::proto_gen::host::Importer {
                importer: Some(crate::proto_gen::host::importer::Importer::ImporterId(0)),
            }],
            global_functions: Vec::new(),
            input: Some(Input::StringInput(StringInput {
                source: "@import 'x'; @import 'y';".to_string(),
                syntax: 0,
                url: String::new(),
                importer: None,
            })),
            alert_color: false,
            alert_ascii: true,
            quiet_deps: false,
            verbose: false,
            source_map: false,
            source_map_include_sources: false,
            charset: false,
        };
        let success = BuiltinEngine.compile(&request, &services).unwrap();
        assert_eq!(success.css, "c { d: 1; }\nc { d: 1; }");

        let mut deprecation_count = 0;
        let mut debug_count = 0;
        while let Ok((_, msg)) = logger_rx.try_recv() {
            if let Some(crate::proto_gen::host::outbound_message::Message::LogEvent(event)) = msg.message {
                match crate::proto_gen::host::LogEventType::try_from(event.r#type) {
                    Ok(crate::proto_gen::host::LogEventType::DeprecationWarning) => deprecation_count += 1,
                    Ok(crate::proto_gen::host::LogEventType::Debug) => debug_count += 1,
                    _ => {}
                }
            }
        }
        // Two `@import`s with identical deprecation text still produce one
        // deprecation warning, but each gets its own debug line.
        assert_eq!(deprecation_count, 1);
        assert_eq!(debug_count, 2);
    }

    #[test]
    fn test_mismatched_units_fail() {
        let logger_tx = tokio::sync::mpsc::unbounded_channel().0;
        let logger = CompilationLogger::new(1, false, true, logger_tx);
        let round_trip = NoCallbacks;
        let services = HostServices::new(1, &round_trip, &logger);
        let err = evaluate_expr("1px + 2em", &services).unwrap_err();
        assert!(err.message.contains("Incompatible units"));
    }
}
