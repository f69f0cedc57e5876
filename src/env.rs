//! # Runtime Environment and Plan Stage Data
//!
//! Named global slots installed once per build and consulted by
//! translators, plus the bundle handed back to the caller alongside the
//! physical root: the environment, the top-level bindings, and the
//! execution flags derived from the solution tree.

use crate::context::{Collation, TimeZoneDb};
use crate::error::BuildError;
use crate::reqs::{PlanNodeSlots, SlotName};
use crate::slots::{SlotId, SlotIdGenerator};
use crate::solution::SolutionMeta;
use crate::value::Val;
use std::fmt::Write as _;
use std::sync::Arc;

/// Name of the always-present time zone database slot
pub const ENV_TIME_ZONE_DB: &str = "timeZoneDB";
/// Name of the collator slot, present iff the query has a collation
pub const ENV_COLLATOR: &str = "collator";
/// Name of the resume-record-id slot, installed only for tailable unions
pub const ENV_RESUME_RECORD_ID: &str = "resumeRecordId";

/// Initial value of a named environment slot
#[derive(Debug, Clone)]
pub enum EnvValue {
    /// Plain value owned by the environment
    Value(Val),
    /// Unowned pointer to the process time zone database
    TimeZoneDatabase(Arc<TimeZoneDb>),
    /// Unowned pointer to the query's collator
    Collator(Arc<Collation>),
}

/// A per-query registry of named global slots. Slots registered here are
/// visible to every stage of the produced tree; the executor's driver may
/// mutate them between iterations (the tailable resume slot relies on
/// this).
#[derive(Debug, Default)]
pub struct RuntimeEnvironment {
    entries: Vec<(String, SlotId, EnvValue)>,
}

impl RuntimeEnvironment {
    /// Empty environment
    pub fn new() -> Self {
        RuntimeEnvironment::default()
    }

    /// Install a named slot. Each name may be registered at most once
    /// per build.
    pub fn register(
        &mut self,
        name: &str,
        value: EnvValue,
        slot_gen: &mut SlotIdGenerator,
    ) -> Result<SlotId, BuildError> {
        crate::check_contract!(
            self.slot(name).is_none(),
            75_010,
            "environment slot '{name}' registered twice"
        );
        let slot = slot_gen.generate();
        self.entries.push((name.to_string(), slot, value));
        Ok(slot)
    }

    /// Look up a named slot
    pub fn slot(&self, name: &str) -> Option<SlotId> {
        self.entries
            .iter()
            .find(|(entry_name, _, _)| entry_name == name)
            .map(|(_, slot, _)| *slot)
    }

    /// Look up a slot that the contract guarantees present
    pub fn require_slot(&self, name: &str, tag: u32) -> Result<SlotId, BuildError> {
        self.slot(name)
            .ok_or_else(|| crate::contract_error!(tag, "environment slot '{name}' not installed"))
    }

    /// Registered entries in installation order
    pub fn entries(&self) -> impl Iterator<Item = (&str, SlotId, &EnvValue)> {
        self.entries
            .iter()
            .map(|(name, slot, value)| (name.as_str(), *slot, value))
    }

    /// One-line dump of the registered slots
    pub fn debug_string(&self) -> String {
        let mut out = String::from("env: ");
        for (i, (name, slot, value)) in self.entries().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            match value {
                EnvValue::Value(val) => {
                    let _ = write!(out, "{name}={slot}({val})");
                }
                EnvValue::TimeZoneDatabase(_) => {
                    let _ = write!(out, "{name}={slot}(timeZoneDB)");
                }
                EnvValue::Collator(collation) => {
                    let _ = write!(out, "{name}={slot}(collator:{})", collation.locale);
                }
            }
        }
        out
    }
}

/// Everything the caller needs besides the physical root: the runtime
/// environment, the top-level slot bindings, and the three execution
/// flags precomputed from the solution tree.
#[derive(Debug)]
pub struct PlanStageData {
    /// Named global slots
    pub env: RuntimeEnvironment,
    /// Slots bound by the root of the physical tree
    pub out_slots: PlanNodeSlots,
    /// Flags derived by the prelude scan over the logical tree
    pub meta: SolutionMeta,
}

impl PlanStageData {
    /// Debug description: the main top-level slots followed by the
    /// environment dump.
    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        for name in [SlotName::Result, SlotName::RecordId, SlotName::OplogTs] {
            match self.out_slots.get(name) {
                Some(slot) => {
                    let _ = write!(out, "{name}={slot} ");
                }
                None => {
                    let _ = write!(out, "{name}=- ");
                }
            }
        }
        out.push_str(&self.env.debug_string());
        out
    }
}

/// Resume slot helper: the initial `Nothing` installed for tailable
/// unions.
pub fn resume_record_id_initial() -> EnvValue {
    EnvValue::Value(Val::Nothing)
}
