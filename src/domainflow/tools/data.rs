//! The `data.*` tool family: retrieval, aggregation, spatial filtering,
//! and basic analytics over a tenant's stored domain records.
//!
//! The actual storage is behind the [`DataBackend`] trait so production
//! deployments can point these tools at the relational store. The
//! [`InMemoryDataBackend`] bundled here keeps records per
//! `(tenant, domain)` in process memory; it backs tests and small
//! single-node setups.

use crate::domainflow::broker::{ToolContext, ToolError, ToolProvider};
use crate::domainflow::types::{TenantId, ToolName};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Storage seam for the `data.*` tools. One backend serves all four
/// operations; the tool name selects the operation.
#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn execute(
        &self,
        tool: ToolName,
        tenant: &TenantId,
        params: &Value,
    ) -> Result<Value, ToolError>;
}

/// Thin adapter binding one `data.*` tool name to a shared backend.
pub struct DataToolProvider {
    tool: ToolName,
    backend: Arc<dyn DataBackend>,
}

impl DataToolProvider {
    /// Bind `tool` to `backend`. Only the `data.*` names are accepted.
    pub fn for_tool(tool: ToolName, backend: Arc<dyn DataBackend>) -> Option<Self> {
        match tool {
            ToolName::DataRetrieval
            | ToolName::DataAggregation
            | ToolName::DataSpatial
            | ToolName::DataAnalytics => Some(Self { tool, backend }),
            _ => None,
        }
    }

    /// Convenience: one provider per `data.*` tool over a shared backend.
    pub fn all(backend: Arc<dyn DataBackend>) -> Vec<Self> {
        [
            ToolName::DataRetrieval,
            ToolName::DataAggregation,
            ToolName::DataSpatial,
            ToolName::DataAnalytics,
        ]
        .into_iter()
        .filter_map(|tool| Self::for_tool(tool, Arc::clone(&backend)))
        .collect()
    }
}

#[async_trait]
impl ToolProvider for DataToolProvider {
    fn tool(&self) -> ToolName {
        self.tool
    }

    async fn invoke(&self, params: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        self.backend.execute(self.tool, &ctx.tenant_id, &params).await
    }
}

/// Per-tenant, per-domain record store held in process memory.
#[derive(Default)]
pub struct InMemoryDataBackend {
    records: RwLock<HashMap<(TenantId, String), Vec<Value>>>,
}

impl InMemoryDataBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to a tenant's domain.
    pub fn insert(&self, tenant: &TenantId, domain_id: &str, record: Value) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records
            .entry((tenant.clone(), domain_id.to_string()))
            .or_default()
            .push(record);
    }

    fn domain_records(&self, tenant: &TenantId, domain_id: &str) -> Vec<Value> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .get(&(tenant.clone(), domain_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

fn require_domain(params: &Value) -> Result<&str, ToolError> {
    params
        .get("domain_id")
        .and_then(|d| d.as_str())
        .ok_or_else(|| ToolError::Permanent("missing 'domain_id' parameter".to_string()))
}

#[async_trait]
impl DataBackend for InMemoryDataBackend {
    async fn execute(
        &self,
        tool: ToolName,
        tenant: &TenantId,
        params: &Value,
    ) -> Result<Value, ToolError> {
        let domain_id = require_domain(params)?;
        let records = self.domain_records(tenant, domain_id);

        match tool {
            ToolName::DataRetrieval => {
                let filter = params.get("filter").and_then(|f| f.as_object());
                let limit = params
                    .get("limit")
                    .and_then(|l| l.as_u64())
                    .unwrap_or(100) as usize;
                let matched: Vec<Value> = records
                    .into_iter()
                    .filter(|record| match filter {
                        None => true,
                        Some(filter) => filter
                            .iter()
                            .all(|(key, want)| record.get(key) == Some(want)),
                    })
                    .take(limit)
                    .collect();
                Ok(serde_json::json!({ "records": matched }))
            }
            ToolName::DataAggregation => {
                let group_by = params
                    .get("group_by")
                    .and_then(|g| g.as_str())
                    .ok_or_else(|| {
                        ToolError::Permanent("missing 'group_by' parameter".to_string())
                    })?;
                let mut counts: BTreeMap<String, u64> = BTreeMap::new();
                for record in &records {
                    if let Some(value) = record.get(group_by) {
                        let key = value
                            .as_str()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| value.to_string());
                        *counts.entry(key).or_insert(0) += 1;
                    }
                }
                Ok(serde_json::json!({ "counts": counts }))
            }
            ToolName::DataSpatial => {
                let bounds = params
                    .get("bounds")
                    .and_then(|b| b.as_array())
                    .filter(|b| b.len() == 4)
                    .ok_or_else(|| {
                        ToolError::Permanent(
                            "missing 'bounds' parameter [min_lon, min_lat, max_lon, max_lat]"
                                .to_string(),
                        )
                    })?;
                let bbox: Vec<f64> = bounds.iter().filter_map(|v| v.as_f64()).collect();
                if bbox.len() != 4 {
                    return Err(ToolError::Permanent(
                        "'bounds' must hold four numbers".to_string(),
                    ));
                }
                let lon_field = params
                    .get("lon_field")
                    .and_then(|f| f.as_str())
                    .unwrap_or("lon");
                let lat_field = params
                    .get("lat_field")
                    .and_then(|f| f.as_str())
                    .unwrap_or("lat");
                let features: Vec<Value> = records
                    .into_iter()
                    .filter(|record| {
                        let lon = record.get(lon_field).and_then(|v| v.as_f64());
                        let lat = record.get(lat_field).and_then(|v| v.as_f64());
                        match (lon, lat) {
                            (Some(lon), Some(lat)) => {
                                lon >= bbox[0] && lat >= bbox[1] && lon <= bbox[2] && lat <= bbox[3]
                            }
                            _ => false,
                        }
                    })
                    .collect();
                Ok(serde_json::json!({ "features": features }))
            }
            ToolName::DataAnalytics => {
                let field = params
                    .get("field")
                    .and_then(|f| f.as_str())
                    .ok_or_else(|| {
                        ToolError::Permanent("missing 'field' parameter".to_string())
                    })?;
                let values: Vec<f64> = records
                    .iter()
                    .filter_map(|r| r.get(field).and_then(|v| v.as_f64()))
                    .collect();
                if values.is_empty() {
                    return Ok(serde_json::json!({ "count": 0 }));
                }
                let sum: f64 = values.iter().sum();
                let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                Ok(serde_json::json!({
                    "count": values.len(),
                    "sum": sum,
                    "avg": sum / values.len() as f64,
                    "min": min,
                    "max": max,
                }))
            }
            other => Err(ToolError::Permanent(format!(
                "'{}' is not a data tool",
                other
            ))),
        }
    }
}
