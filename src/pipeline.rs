//! Ordered filter chain executor with jump-on-result flow control.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::context::{Chain, ChainEntry, Context};
use crate::error::{Error, Result};
use crate::filters::Filter;
use crate::registry::FilterRegistry;
use crate::resilience::build_policies;
use crate::spec::PipelineSpec;

/// A realised pipeline generation: resolved flow plus its filter instances.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    protocol: String,
    generation: u64,
    entries: Arc<Vec<ChainEntry>>,
    filters: HashMap<String, Arc<dyn Filter>>,
    stats: Mutex<HashMap<String, FilterStat>>,
}

#[derive(Debug, Default, Clone)]
struct FilterStat {
    count: u64,
    total: Duration,
    last_result: String,
}

/// Status snapshot of a pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub name: String,
    pub generation: u64,
    pub filters: BTreeMap<String, FilterStatusEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterStatusEntry {
    pub count: u64,
    pub avg_duration_ms: f64,
    pub last_result: String,
}

impl Pipeline {
    /// Build the first generation of a pipeline.
    pub fn new(spec: &PipelineSpec, registry: &FilterRegistry) -> Result<Self> {
        Self::build(spec, registry, None)
    }

    /// Build the next generation, inheriting same-named filter instances.
    ///
    /// The caller swaps the new generation into the pipeline map and then
    /// closes `previous`; in-flight requests finish against the old set.
    pub fn inherit(
        spec: &PipelineSpec,
        previous: &Pipeline,
        registry: &FilterRegistry,
    ) -> Result<Self> {
        Self::build(spec, registry, Some(previous))
    }

    fn build(
        spec: &PipelineSpec,
        registry: &FilterRegistry,
        previous: Option<&Pipeline>,
    ) -> Result<Self> {
        if spec.protocol != "http" {
            return Err(Error::spec(format!(
                "pipeline {}: unsupported protocol {:?}",
                spec.name, spec.protocol
            )));
        }

        let policies = Arc::new(build_policies(&spec.resilience)?);

        let mut filters: HashMap<String, Arc<dyn Filter>> = HashMap::new();
        let mut kinds = HashMap::new();
        for doc in &spec.filters {
            let prev_instance = doc
                .get("name")
                .and_then(|v| v.as_str())
                .and_then(|name| previous.and_then(|p| p.filters.get(name)))
                .filter(|prev| {
                    doc.get("kind").and_then(|v| v.as_str()) == Some(prev.kind())
                })
                .cloned();
            let (name, kind, filter) =
                registry.create_filter(doc, policies.clone(), prev_instance)?;
            if filters.insert(name.clone(), filter).is_some() {
                return Err(Error::spec(format!(
                    "pipeline {}: duplicate filter name {:?}",
                    spec.name, name
                )));
            }
            kinds.insert(name, kind);
        }

        let positions: HashMap<&str, usize> = spec
            .flow
            .iter()
            .enumerate()
            .map(|(i, node)| (node.filter.as_str(), i))
            .collect();

        let mut entries = Vec::with_capacity(spec.flow.len());
        for (index, node) in spec.flow.iter().enumerate() {
            let filter = filters.get(&node.filter).cloned().ok_or_else(|| {
                Error::spec(format!(
                    "pipeline {}: flow references undefined filter {:?}",
                    spec.name, node.filter
                ))
            })?;
            let kind = kinds[&node.filter];

            let mut jumps = HashMap::new();
            for (result, target) in &node.jump_if {
                if !kind.declares(result) || result.is_empty() {
                    return Err(Error::spec(format!(
                        "pipeline {}: filter {:?} does not declare result {:?}",
                        spec.name, node.filter, result
                    )));
                }
                let target_index = *positions.get(target.as_str()).ok_or_else(|| {
                    Error::spec(format!(
                        "pipeline {}: jump target {:?} is not in the flow",
                        spec.name, target
                    ))
                })?;
                if target_index <= index {
                    return Err(Error::spec(format!(
                        "pipeline {}: jump from {:?} to {:?} goes backwards",
                        spec.name, node.filter, target
                    )));
                }
                jumps.insert(result.clone(), target_index);
            }

            entries.push(ChainEntry {
                name: node.filter.clone(),
                filter,
                jumps,
                results: kind.results.iter().map(|r| r.to_string()).collect(),
            });
        }

        Ok(Self {
            name: spec.name.clone(),
            protocol: spec.protocol.clone(),
            generation: previous.map(|p| p.generation + 1).unwrap_or(1),
            entries: Arc::new(entries),
            filters,
            stats: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Run the request through the flow. Returns the pipeline result string.
    pub async fn handle(&self, ctx: &mut Context) -> String {
        ctx.chain = Some(Chain {
            entries: self.entries.clone(),
            next: 0,
        });
        let result = ctx.call_next_handler(String::new()).await;
        ctx.chain = None;

        let mut stats = self.stats.lock().expect("pipeline stats lock poisoned");
        for record in ctx.filter_records() {
            tracing::debug!(
                pipeline = %self.name,
                filter = %record.name,
                result = %record.result,
                elapsed_us = record.elapsed.as_micros() as u64,
                "filter handled"
            );
            let stat = stats.entry(record.name.clone()).or_default();
            stat.count += 1;
            stat.total += record.elapsed;
            stat.last_result = record.result.clone();
        }
        result
    }

    pub fn status(&self) -> PipelineStatus {
        let stats = self.stats.lock().expect("pipeline stats lock poisoned");
        let filters = stats
            .iter()
            .map(|(name, s)| {
                let avg = if s.count > 0 {
                    s.total.as_secs_f64() * 1000.0 / s.count as f64
                } else {
                    0.0
                };
                (
                    name.clone(),
                    FilterStatusEntry {
                        count: s.count,
                        avg_duration_ms: avg,
                        last_result: s.last_result.clone(),
                    },
                )
            })
            .collect();
        PipelineStatus {
            name: self.name.clone(),
            generation: self.generation,
            filters,
        }
    }

    /// Close all owned filter instances.
    pub fn close(&self) {
        for filter in self.filters.values() {
            filter.close();
        }
    }
}
