//! In-memory stand-in for the persistence layer.

use std::collections::HashMap;

use actors::{Service, ServiceContext, ServiceError};
use bus_core::{BusMessage, Request};
use serde_json::{Value, json};

/// Keeps notes and uploaded file sizes in memory. Contents do not survive
/// a restart of the service.
#[derive(Default)]
pub struct MemoryDatabase {
    notes: HashMap<String, Value>,
    files: HashMap<String, usize>,
}

impl MemoryDatabase {
    fn execute(&mut self, request: &Request) -> Result<Value, String> {
        let key = || {
            request
                .key
                .clone()
                .ok_or_else(|| format!("{} requires a key", request.name))
        };

        match request.name.as_str() {
            "get" => {
                let key = key()?;
                self.notes
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| format!("note {key} not found"))
            }
            "put" => {
                let key = key()?;
                self.notes.insert(key.clone(), request.data.clone());
                Ok(json!({ "id": key }))
            }
            "delete" => {
                let key = key()?;
                Ok(json!({ "deleted": self.notes.remove(&key).is_some() }))
            }
            "list" => {
                let mut ids: Vec<&String> = self.notes.keys().collect();
                ids.sort();
                Ok(json!({ "ids": ids }))
            }
            "sendFileData" => {
                let key = key()?;
                let size = request.binary.as_ref().map_or(0, Vec::len);
                let total = self.files.entry(key.clone()).or_default();
                *total += size;
                Ok(json!({ "targetId": key, "received": size, "total": *total }))
            }
            other => Err(format!("unsupported operation: {other}")),
        }
    }
}

impl Service for MemoryDatabase {
    async fn on_start(&mut self, _ctx: &ServiceContext) -> Result<(), ServiceError> {
        tracing::info!("In-memory database ready");
        Ok(())
    }

    async fn handle(&mut self, ctx: &ServiceContext, message: BusMessage) -> Result<(), ServiceError> {
        let request = match message {
            BusMessage::Request(request) => request,
            other => {
                tracing::debug!("Database ignoring {}", other.label());
                return Ok(());
            }
        };

        let result = self.execute(&request);
        if let Err(e) = &result {
            tracing::debug!("Database {} failed: {}", request.name, e);
        }
        if let Err(e) = ctx.reply(&request, result) {
            tracing::warn!("Database could not answer {}: {}", request.request_id, e);
        }
        Ok(())
    }
}
