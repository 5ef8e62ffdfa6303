//! Ports onto external capabilities.
//!
//! The orchestration core never imports the subsystems that provide agents,
//! notifications, or outbound HTTP; it depends on these traits, wired at
//! construction. Each port has a default implementation so the core runs
//! (degraded but testable) with nothing attached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

// ---------------------------------------------------------------------------
// Agent registry
// ---------------------------------------------------------------------------

/// A resolved agent that can process a task context.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Run the agent against the given context and return its response.
    async fn process(&self, context: &str) -> Result<String>;
}

/// Lookup port for agents by id.
pub trait AgentRegistry: Send + Sync {
    fn get(&self, agent_id: &str) -> Option<Arc<dyn AgentHandle>>;
}

/// Registry with no agents.
///
/// Callers that miss the registry produce simulated output instead of
/// failing, so pipelines stay runnable without any LLM capacity attached.
#[derive(Debug, Default)]
pub struct NullAgentRegistry;

impl AgentRegistry for NullAgentRegistry {
    fn get(&self, _agent_id: &str) -> Option<Arc<dyn AgentHandle>> {
        None
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Outbound notification port.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: &str, recipients: &[String], body: &str) -> Result<()>;
}

/// Default notifier: log the notification and report success.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, channel: &str, recipients: &[String], body: &str) -> Result<()> {
        info!(
            channel,
            recipients = recipients.len(),
            body_len = body.len(),
            "notification (log-only sender)"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outbound HTTP
// ---------------------------------------------------------------------------

/// Response from an outbound HTTP call.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Outbound HTTP port.
#[async_trait]
pub trait HttpCaller: Send + Sync {
    async fn call(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse>;
}

/// Default HTTP port: every call fails with a transient error.
///
/// Hosts that want `call_api` actions must wire a real client.
#[derive(Debug, Default)]
pub struct NoHttpCaller;

#[async_trait]
impl HttpCaller for NoHttpCaller {
    async fn call(
        &self,
        method: &str,
        url: &str,
        _headers: &HashMap<String, String>,
        _body: Option<&str>,
        _timeout: Duration,
    ) -> Result<HttpResponse> {
        anyhow::bail!("no HTTP capability wired (refusing {method} {url})")
    }
}
