//! Trace context and correlation IDs
//!
//! This module provides `TraceContext` for correlating a gateway request with
//! the spans the remote AI service emits, using W3C Trace Context IDs.
//!
//! The trace context carries:
//! - `trace_id`: Top-level operation identifier (W3C format: 32-char hex)
//! - `span_id`: Current operation span (W3C format: 16-char hex)
//! - `request_id`: Gateway request identifier, also the tracer's key
//! - `user_id`: Caller whose quota the request is billed against

use rand::Rng;

/// Trace context for distributed correlation
///
/// ## Example
///
/// ```
/// use aigate_observability::TraceContext;
///
/// let ctx = TraceContext::new_root()
///     .with_request("req-123".to_string())
///     .with_user("user-42".to_string());
///
/// // Propagated to the remote service as gRPC metadata
/// let header = ctx.to_traceparent();
/// assert!(header.starts_with("00-"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// W3C Trace Context trace ID (32-char hex, 128-bit)
    pub trace_id: String,

    /// W3C Trace Context span ID (16-char hex, 64-bit)
    pub span_id: String,

    /// Parent span ID (for hierarchical spans)
    pub parent_span_id: Option<String>,

    /// Gateway request ID
    pub request_id: Option<String>,

    /// Billed user
    pub user_id: Option<String>,
}

impl TraceContext {
    /// Create a new root trace context with random IDs
    pub fn new_root() -> Self {
        Self {
            trace_id: generate_trace_id(),
            span_id: generate_span_id(),
            parent_span_id: None,
            request_id: None,
            user_id: None,
        }
    }

    /// Create a child span context
    ///
    /// Same trace_id, new span_id, current span_id becomes the parent.
    pub fn child_span(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: generate_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            request_id: self.request_id.clone(),
            user_id: self.user_id.clone(),
        }
    }

    pub fn with_request(mut self, request_id: String) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_user(mut self, user_id: String) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_parent_span(mut self, parent_span_id: String) -> Self {
        self.parent_span_id = Some(parent_span_id);
        self
    }

    /// Create context from existing trace and span IDs
    ///
    /// Used when the caller already belongs to a distributed trace.
    pub fn from_ids(trace_id: String, span_id: String) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id: None,
            request_id: None,
            user_id: None,
        }
    }

    /// Format as W3C traceparent header
    ///
    /// Format: 00-{trace_id}-{span_id}-01 (always sampled)
    pub fn to_traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.span_id)
    }

    /// Parse from W3C traceparent header
    pub fn from_traceparent(traceparent: &str) -> Option<Self> {
        let parts: Vec<&str> = traceparent.split('-').collect();
        if parts.len() != 4 || parts[0] != "00" {
            return None;
        }
        if parts[1].len() != 32 || parts[2].len() != 16 {
            return None;
        }
        if !parts[1..3]
            .iter()
            .all(|p| p.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return None;
        }

        Some(Self::from_ids(parts[1].to_string(), parts[2].to_string()))
    }
}

/// Generate a gateway request ID
///
/// Format: `req-` followed by 16 hexadecimal characters
pub fn generate_request_id() -> String {
    format!("req-{}", generate_span_id())
}

/// Generate a W3C Trace Context trace ID
///
/// Format: 32 hexadecimal characters (128 bits of randomness)
fn generate_trace_id() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    hex::encode(bytes)
}

/// Generate a W3C Trace Context span ID
///
/// Format: 16 hexadecimal characters (64 bits of randomness)
fn generate_span_id() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 8] = rng.random();
    hex::encode(bytes)
}
