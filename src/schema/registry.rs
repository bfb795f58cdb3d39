// =============================================================================
// Schema Registry — name-keyed schema storage with conflict rejection
// =============================================================================
//
// Five mappings, one per schema kind. Keys are unique: re-registering a name
// fails with a conflict rather than silently replacing the earlier schema.
// Partial overrides update only the supplied fields of an existing entry.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::ConfigError;
use crate::schema::{
    ExchangeOverride, ExchangeSchema, FrameOverride, FrameSchema, RiskOverride, RiskSchema,
    StrategyOverride, StrategySchema, WalkerOverride, WalkerSchema,
};

/// The five schema kinds the registry knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaKind {
    Exchange,
    Frame,
    Strategy,
    Risk,
    Walker,
}

impl SchemaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exchange => "exchange",
            Self::Frame => "frame",
            Self::Strategy => "strategy",
            Self::Risk => "risk",
            Self::Walker => "walker",
        }
    }
}

#[derive(Default)]
pub struct SchemaRegistry {
    exchanges: RwLock<HashMap<String, Arc<ExchangeSchema>>>,
    frames: RwLock<HashMap<String, Arc<FrameSchema>>>,
    strategies: RwLock<HashMap<String, Arc<StrategySchema>>>,
    risks: RwLock<HashMap<String, Arc<RiskSchema>>>,
    walkers: RwLock<HashMap<String, Arc<WalkerSchema>>>,
}

fn reject_blank(kind: SchemaKind, name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::InvalidField {
            kind: kind.as_str(),
            name: name.to_string(),
            field: "name",
            reason: "must not be empty".into(),
        });
    }
    Ok(())
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registration ────────────────────────────────────────────────────

    pub fn add_exchange(&self, schema: ExchangeSchema) -> Result<(), ConfigError> {
        reject_blank(SchemaKind::Exchange, &schema.name)?;
        let mut map = self.exchanges.write();
        if map.contains_key(&schema.name) {
            return Err(ConfigError::DuplicateName {
                kind: "exchange",
                name: schema.name,
            });
        }
        info!(name = %schema.name, "exchange schema registered");
        map.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    pub fn add_frame(&self, schema: FrameSchema) -> Result<(), ConfigError> {
        reject_blank(SchemaKind::Frame, &schema.name)?;
        if schema.end_date <= schema.start_date {
            return Err(ConfigError::InvalidField {
                kind: "frame",
                name: schema.name,
                field: "end_date",
                reason: "must be after start_date".into(),
            });
        }
        let mut map = self.frames.write();
        if map.contains_key(&schema.name) {
            return Err(ConfigError::DuplicateName {
                kind: "frame",
                name: schema.name,
            });
        }
        info!(name = %schema.name, interval = %schema.interval, "frame schema registered");
        map.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    pub fn add_strategy(&self, schema: StrategySchema) -> Result<(), ConfigError> {
        reject_blank(SchemaKind::Strategy, &schema.name)?;
        let mut map = self.strategies.write();
        if map.contains_key(&schema.name) {
            return Err(ConfigError::DuplicateName {
                kind: "strategy",
                name: schema.name,
            });
        }
        info!(name = %schema.name, interval = %schema.interval, "strategy schema registered");
        map.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    pub fn add_risk(&self, schema: RiskSchema) -> Result<(), ConfigError> {
        reject_blank(SchemaKind::Risk, &schema.name)?;
        let mut map = self.risks.write();
        if map.contains_key(&schema.name) {
            return Err(ConfigError::DuplicateName {
                kind: "risk",
                name: schema.name,
            });
        }
        info!(name = %schema.name, validators = schema.validations.len(), "risk schema registered");
        map.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    pub fn add_walker(&self, schema: WalkerSchema) -> Result<(), ConfigError> {
        reject_blank(SchemaKind::Walker, &schema.name)?;
        if schema.strategies.is_empty() {
            return Err(ConfigError::InvalidField {
                kind: "walker",
                name: schema.name,
                field: "strategies",
                reason: "must name at least one strategy".into(),
            });
        }
        let mut map = self.walkers.write();
        if map.contains_key(&schema.name) {
            return Err(ConfigError::DuplicateName {
                kind: "walker",
                name: schema.name,
            });
        }
        info!(name = %schema.name, strategies = schema.strategies.len(), "walker schema registered");
        map.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    // ── Partial overrides ───────────────────────────────────────────────

    pub fn override_exchange(
        &self,
        name: &str,
        patch: ExchangeOverride,
    ) -> Result<(), ConfigError> {
        let mut map = self.exchanges.write();
        let current = map.get(name).ok_or_else(|| ConfigError::UnknownName {
            kind: "exchange",
            name: name.to_string(),
        })?;
        let mut updated = ExchangeSchema::clone(current);
        if let Some(adapter) = patch.adapter {
            updated.adapter = adapter;
        }
        map.insert(name.to_string(), Arc::new(updated));
        Ok(())
    }

    pub fn override_frame(&self, name: &str, patch: FrameOverride) -> Result<(), ConfigError> {
        let mut map = self.frames.write();
        let current = map.get(name).ok_or_else(|| ConfigError::UnknownName {
            kind: "frame",
            name: name.to_string(),
        })?;
        let mut updated = FrameSchema::clone(current);
        if let Some(interval) = patch.interval {
            updated.interval = interval;
        }
        if let Some(start) = patch.start_date {
            updated.start_date = start;
        }
        if let Some(end) = patch.end_date {
            updated.end_date = end;
        }
        if updated.end_date <= updated.start_date {
            return Err(ConfigError::InvalidField {
                kind: "frame",
                name: name.to_string(),
                field: "end_date",
                reason: "must be after start_date".into(),
            });
        }
        map.insert(name.to_string(), Arc::new(updated));
        Ok(())
    }

    pub fn override_strategy(
        &self,
        name: &str,
        patch: StrategyOverride,
    ) -> Result<(), ConfigError> {
        let mut map = self.strategies.write();
        let current = map.get(name).ok_or_else(|| ConfigError::UnknownName {
            kind: "strategy",
            name: name.to_string(),
        })?;
        let mut updated = StrategySchema::clone(current);
        if let Some(interval) = patch.interval {
            updated.interval = interval;
        }
        if let Some(source) = patch.source {
            updated.source = source;
        }
        if let Some(callbacks) = patch.callbacks {
            updated.callbacks = callbacks;
        }
        if let Some(risk_name) = patch.risk_name {
            updated.risk_name = risk_name;
        }
        if let Some(risk_list) = patch.risk_list {
            updated.risk_list = risk_list;
        }
        map.insert(name.to_string(), Arc::new(updated));
        Ok(())
    }

    pub fn override_risk(&self, name: &str, patch: RiskOverride) -> Result<(), ConfigError> {
        let mut map = self.risks.write();
        let current = map.get(name).ok_or_else(|| ConfigError::UnknownName {
            kind: "risk",
            name: name.to_string(),
        })?;
        let mut updated = RiskSchema::clone(current);
        if let Some(validations) = patch.validations {
            updated.validations = validations;
        }
        if let Some(callbacks) = patch.callbacks {
            updated.callbacks = callbacks;
        }
        map.insert(name.to_string(), Arc::new(updated));
        Ok(())
    }

    pub fn override_walker(&self, name: &str, patch: WalkerOverride) -> Result<(), ConfigError> {
        let mut map = self.walkers.write();
        let current = map.get(name).ok_or_else(|| ConfigError::UnknownName {
            kind: "walker",
            name: name.to_string(),
        })?;
        let mut updated = WalkerSchema::clone(current);
        if let Some(exchange_name) = patch.exchange_name {
            updated.exchange_name = exchange_name;
        }
        if let Some(frame_name) = patch.frame_name {
            updated.frame_name = frame_name;
        }
        if let Some(strategies) = patch.strategies {
            if strategies.is_empty() {
                return Err(ConfigError::InvalidField {
                    kind: "walker",
                    name: name.to_string(),
                    field: "strategies",
                    reason: "must name at least one strategy".into(),
                });
            }
            updated.strategies = strategies;
        }
        if let Some(metric) = patch.metric {
            updated.metric = metric;
        }
        map.insert(name.to_string(), Arc::new(updated));
        Ok(())
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    pub fn exchange(&self, name: &str) -> Result<Arc<ExchangeSchema>, ConfigError> {
        self.exchanges
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownName {
                kind: "exchange",
                name: name.to_string(),
            })
    }

    pub fn frame(&self, name: &str) -> Result<Arc<FrameSchema>, ConfigError> {
        self.frames
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownName {
                kind: "frame",
                name: name.to_string(),
            })
    }

    pub fn strategy(&self, name: &str) -> Result<Arc<StrategySchema>, ConfigError> {
        self.strategies
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownName {
                kind: "strategy",
                name: name.to_string(),
            })
    }

    pub fn risk(&self, name: &str) -> Result<Arc<RiskSchema>, ConfigError> {
        self.risks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownName {
                kind: "risk",
                name: name.to_string(),
            })
    }

    pub fn walker(&self, name: &str) -> Result<Arc<WalkerSchema>, ConfigError> {
        self.walkers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownName {
                kind: "walker",
                name: name.to_string(),
            })
    }

    pub fn contains(&self, kind: SchemaKind, name: &str) -> bool {
        match kind {
            SchemaKind::Exchange => self.exchanges.read().contains_key(name),
            SchemaKind::Frame => self.frames.read().contains_key(name),
            SchemaKind::Strategy => self.strategies.read().contains_key(name),
            SchemaKind::Risk => self.risks.read().contains_key(name),
            SchemaKind::Walker => self.walkers.read().contains_key(name),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
