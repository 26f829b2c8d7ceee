//! Protocol trace sink.

use std::sync::Arc;

use crate::host::OutputChannel;
use crate::options::TraceLevel;

/// Writes one entry per protocol message to the trace output channel.
///
/// Without a channel, or at [`TraceLevel::Off`], every call is a no-op.
#[derive(Clone, Default)]
pub(crate) struct Tracer {
    channel: Option<Arc<dyn OutputChannel>>,
    level: TraceLevel,
}

impl Tracer {
    pub fn new(channel: Option<Arc<dyn OutputChannel>>, level: TraceLevel) -> Self {
        Self { channel, level }
    }

    fn emit(&self, headline: &str, payload: Option<&serde_json::Value>) {
        let Some(channel) = &self.channel else { return };
        if !self.level.is_enabled() {
            return;
        }
        let stamp = chrono::Local::now().format("%H:%M:%S");
        channel.append_line(&format!("[Trace - {stamp}] {headline}"));
        if self.level == TraceLevel::Verbose
            && let Some(payload) = payload
        {
            let body = serde_json::to_string_pretty(payload).unwrap_or_default();
            channel.append_line(&format!("Params: {body}"));
            channel.append_line("");
        }
    }

    pub fn sending_request(&self, method: &str, id: u64, params: Option<&serde_json::Value>) {
        self.emit(&format!("Sending request '{method} - ({id})'."), params);
    }

    pub fn sending_notification(&self, method: &str, params: Option<&serde_json::Value>) {
        self.emit(&format!("Sending notification '{method}'."), params);
    }

    pub fn sending_response(&self, method: &str, id: &serde_json::Value, result: Option<&serde_json::Value>) {
        self.emit(&format!("Sending response '{method} - ({id})'."), result);
    }

    pub fn received_response(&self, id: u64, body: &serde_json::Value) {
        let result = body.get("result").or_else(|| body.get("error"));
        self.emit(&format!("Received response '({id})'."), result);
    }

    pub fn received_request(&self, method: &str, id: &serde_json::Value, params: Option<&serde_json::Value>) {
        self.emit(&format!("Received request '{method} - ({id})'."), params);
    }

    pub fn received_notification(&self, method: &str, params: Option<&serde_json::Value>) {
        self.emit(&format!("Received notification '{method}'."), params);
    }
}
