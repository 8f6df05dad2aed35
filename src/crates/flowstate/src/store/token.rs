//! Caller-held tokens
//!
//! Nothing is retained server side: the key returned by `put` is the
//! checkpoint itself, wrapped in a scope envelope, run through the pipeline
//! and encoded as URL-safe base64. Without an integrity transform the
//! caller can forge tokens, so production pipelines should always include
//! one.

use super::{CheckpointRecord, CheckpointStore, Scope};
use crate::error::Result;
use crate::transform::Pipeline;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bincode::Options;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct Envelope {
    scope: String,
    state: Vec<u8>,
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
}

/// Stateless store that hands the checkpoint back to the caller
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    pipeline: Option<Pipeline>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Decode a token into its scope and checkpoint bytes
    ///
    /// `Ok(None)` if the token is not valid base64 or not an envelope;
    /// pipeline failures (e.g. a bad signature) are errors.
    pub fn open(&self, token: &str) -> Result<Option<(Scope, Vec<u8>)>> {
        let Ok(data) = URL_SAFE_NO_PAD.decode(token) else {
            return Ok(None);
        };
        let data = match &self.pipeline {
            Some(pipeline) => pipeline.decode(data)?,
            None => data,
        };
        Ok(options()
            .deserialize::<Envelope>(&data)
            .ok()
            .map(|envelope| (Scope::new(envelope.scope), envelope.state)))
    }
}

#[async_trait]
impl CheckpointStore for TokenStore {
    fn name(&self) -> &'static str {
        "token"
    }

    #[tracing::instrument(skip(self, record), fields(bytes = record.bytes.len()))]
    async fn put(&self, scope: &Scope, record: CheckpointRecord) -> Result<String> {
        let envelope = Envelope {
            scope: scope.as_str().to_string(),
            state: record.bytes,
        };
        let data = options().serialize(&envelope)?;
        let data = match &self.pipeline {
            Some(pipeline) => pipeline.encode(data)?,
            None => data,
        };
        let token = URL_SAFE_NO_PAD.encode(data);
        tracing::debug!(token_len = token.len(), "Issued checkpoint token");
        Ok(token)
    }

    #[tracing::instrument(skip(self, key), fields(token_len = key.len()))]
    async fn get(&self, scope: &Scope, key: &str) -> Result<Option<CheckpointRecord>> {
        match self.open(key)? {
            Some((owner, state)) if owner == *scope => Ok(Some(CheckpointRecord::new(state))),
            Some(_) => {
                tracing::debug!("Token belongs to another scope");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
