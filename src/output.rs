//! Query results, streaming sinks and postprocessors.
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;

use crate::constraint::Value;

/// The result of one decoder branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub prompt: String,
    pub variables: BTreeMap<String, Value>,
    pub return_value: Value,
    /// Sum of the log-probabilities of the generated tokens.
    pub logprob: f32,
    pub token_ids: Vec<u32>,
}

impl QueryResult {
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// The text of a variable, if it is a string.
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.variables.get(name) {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        }
    }
}

/// How a query run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Results of all surviving branches, best first.
    Completed(Vec<QueryResult>),
    Cancelled,
}

impl QueryOutcome {
    /// The best result, if the run completed.
    pub fn best(&self) -> Option<&QueryResult> {
        match self {
            QueryOutcome::Completed(results) => results.first(),
            QueryOutcome::Cancelled => None,
        }
    }
}

/// A streamed snapshot of a running query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamChunk {
    pub prompt: String,
    pub variables: BTreeMap<String, String>,
}

/// Receives snapshots while a query runs.
pub trait StreamSink: Send + Sync {
    fn chunk(&self, chunk: &StreamChunk);
    fn done(&self) {}
    fn error(&self, _message: &str) {}
}

/// Writes one JSON object per chunk, then `DONE` or `ERROR <message>`.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn line(&self, line: &str) {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            log::warn!("Failed to write a stream line: {}", e);
        }
    }
}

impl<W: Write + Send> StreamSink for JsonLinesSink<W> {
    fn chunk(&self, chunk: &StreamChunk) {
        match serde_json::to_string(chunk) {
            Ok(line) => self.line(&line),
            Err(e) => log::warn!("Failed to serialize a stream chunk: {}", e),
        }
    }

    fn done(&self) {
        self.line("DONE");
    }

    fn error(&self, message: &str) {
        self.line(&format!("ERROR {}", message.replace('\n', " ")));
    }
}

/// Transforms completed results, for instance to attach scores.
pub trait Postprocessor: Send + Sync {
    fn process(&self, results: Vec<QueryResult>) -> Vec<QueryResult>;
}

/// Keeps the `n` best results.
#[derive(Debug, Clone, Copy)]
pub struct TopN(pub usize);

impl Postprocessor for TopN {
    fn process(&self, mut results: Vec<QueryResult>) -> Vec<QueryResult> {
        results.truncate(self.0);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lines_wire_format() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.chunk(&StreamChunk {
            prompt: "Hello W".into(),
            variables: BTreeMap::from([("WHO".to_string(), " W".to_string())]),
        });
        sink.error("boom\nagain");
        sink.done();
        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        let chunk: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(chunk["prompt"], "Hello W");
        assert_eq!(chunk["variables"]["WHO"], " W");
        assert_eq!(lines[1], "ERROR boom again");
        assert_eq!(lines[2], "DONE");
    }
}
