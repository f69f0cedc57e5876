//! # Stage Builder
//!
//! Lowers a logical query-solution tree into a physical stage tree.
//! Single-pass post-order recursion: each translator receives the node
//! and the parent's requirements, recurses into children with
//! possibly-augmented requirements, then composes physical operators and
//! returns the root of the subtree plus the slots it bound.
//!
//! ```text
//! QuerySolution -> [StageBuilder::build_root] -> (PhysStage, PlanStageData)
//! ```
//!
//! Translator rules, observed by every `build_*` method:
//! 1. reject requirements the node cannot satisfy
//! 2. child requirements = parent's, minus what this node materializes,
//!    plus what it needs internally
//! 3. install slots the parent asked for that the child didn't provide
//! 4. return bindings matching the original parent requirements exactly

mod filter;
mod index_key;
mod projection;
mod scans;
mod shard_filter;
mod sort_key;
mod tailable;

use crate::catalog::CollectionCatalog;
use crate::config::BuilderConfig;
use crate::context::{
    CanonicalQuery, Collation, LockAcquisitionCallback, OperationContext, ShardFiltererFactory,
    TimeZoneDb, YieldPolicy,
};
use crate::env::{EnvValue, PlanStageData, RuntimeEnvironment, ENV_COLLATOR, ENV_TIME_ZONE_DB};
use crate::error::BuildError;
use crate::expr::{make_new_obj, Expr};
use crate::physical::{FieldBehavior, PhysOp, PhysStage, SortDir};
use crate::reqs::{IndexKeyBitset, PlanNodeReqs, PlanNodeSlots, SlotName};
use crate::slots::{FrameIdGenerator, SlotId, SlotIdGenerator, SpoolIdGenerator};
use crate::solution::{
    CollectionScanSol, IndexScanSol, MatchExpr, QuerySolution, SolutionKind, SolutionNode,
    SortPattern, VirtualScanSol,
};
use crate::value::{Document, Val};
use std::sync::Arc;
use tracing::trace;

/// Builds one physical tree from one logical tree, then is consumed.
///
/// The builder owns the slot/frame/spool generators and the runtime
/// environment for the duration of the build; `build_root` takes `self`
/// by value, so a second build on the same instance is unrepresentable.
pub struct StageBuilder<'a> {
    op_ctx: &'a OperationContext,
    query: &'a CanonicalQuery,
    catalog: &'a CollectionCatalog,
    config: BuilderConfig,
    yield_policy: YieldPolicy,
    shard_filterer_factory: Option<&'a dyn ShardFiltererFactory>,
    lock_acquisition: Option<LockAcquisitionCallback>,
    slot_gen: SlotIdGenerator,
    frame_gen: FrameIdGenerator,
    // Shared with the other generators for the build's lifetime; none of
    // the operators this tree composes is spool-backed today.
    #[allow(dead_code)]
    spool_gen: SpoolIdGenerator,
    env: RuntimeEnvironment,
}

impl<'a> StageBuilder<'a> {
    /// Create a builder and install the always-present runtime slots:
    /// `timeZoneDB`, plus `collator` iff the query carries a collation.
    pub fn new(
        op_ctx: &'a OperationContext,
        query: &'a CanonicalQuery,
        catalog: &'a CollectionCatalog,
        config: BuilderConfig,
    ) -> Result<Self, BuildError> {
        let mut slot_gen = SlotIdGenerator::new();
        let mut env = RuntimeEnvironment::new();

        env.register(
            ENV_TIME_ZONE_DB,
            EnvValue::TimeZoneDatabase(Arc::new(TimeZoneDb)),
            &mut slot_gen,
        )?;
        if let Some(collation) = &query.collation {
            env.register(
                ENV_COLLATOR,
                EnvValue::Collator(Arc::new(Collation {
                    locale: collation.locale.clone(),
                })),
                &mut slot_gen,
            )?;
        }

        Ok(StageBuilder {
            op_ctx,
            query,
            catalog,
            config,
            yield_policy: YieldPolicy::default(),
            shard_filterer_factory: None,
            lock_acquisition: None,
            slot_gen,
            frame_gen: FrameIdGenerator::new(),
            spool_gen: SpoolIdGenerator::new(),
            env,
        })
    }

    /// Override the yield policy forwarded into scan stages
    pub fn with_yield_policy(mut self, yield_policy: YieldPolicy) -> Self {
        self.yield_policy = yield_policy;
        self
    }

    /// Supply the shard-filterer factory consulted by sharding-filter
    /// nodes
    pub fn with_shard_filterer_factory(mut self, factory: &'a dyn ShardFiltererFactory) -> Self {
        self.shard_filterer_factory = Some(factory);
        self
    }

    /// Supply the callback injected into scans that must re-check read
    /// availability when they open the collection
    pub fn with_lock_acquisition(mut self, callback: LockAcquisitionCallback) -> Self {
        self.lock_acquisition = Some(callback);
        self
    }

    /// Lower a complete solution tree. Consumes the builder: one
    /// instance constructs exactly one tree.
    pub fn build_root(
        mut self,
        solution: &QuerySolution,
    ) -> Result<(PhysStage, PlanStageData), BuildError> {
        let meta = solution.metadata();

        // Tailable plans surface the record id so the driver can advance
        // the resume point between iterations.
        let reqs = PlanNodeReqs::new()
            .set(SlotName::Result)
            .set_if(
                SlotName::RecordId,
                meta.should_track_resume_token || meta.should_use_tailable_scan,
            )
            .set_if(SlotName::OplogTs, meta.should_track_latest_oplog_timestamp);

        let (root, out_slots) = self.build(&solution.root, &reqs)?;

        // Top-level postconditions
        crate::check_contract!(
            out_slots.get(SlotName::Result).is_some(),
            75_021,
            "top-level plan bound no result slot"
        );
        crate::check_contract!(
            !meta.should_track_latest_oplog_timestamp
                || out_slots.get(SlotName::OplogTs).is_some(),
            75_022,
            "oplog timestamp tracking requested but no oplogTs slot bound"
        );
        crate::check_contract!(
            !reqs.has(SlotName::RecordId) || out_slots.get(SlotName::RecordId).is_some(),
            75_023,
            "record id requested but no recordId slot bound"
        );

        let data = PlanStageData {
            env: self.env,
            out_slots,
            meta,
        };
        Ok((root, data))
    }

    /// Lower a solution tree against caller-supplied requirements.
    ///
    /// Most callers want [`StageBuilder::build_root`], which derives the
    /// requirements from the solution's metadata and enforces the
    /// top-level postconditions; this entry exists for embedders that
    /// drive the requirements contract themselves.
    pub fn build_tree(
        mut self,
        solution: &QuerySolution,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanStageData), BuildError> {
        let meta = solution.metadata();
        let (root, out_slots) = self.build(&solution.root, reqs)?;
        let data = PlanStageData {
            env: self.env,
            out_slots,
            meta,
        };
        Ok((root, data))
    }

    /// Dispatcher: route one node to its translator, diverting into the
    /// tailable-union builder first when applicable.
    pub(crate) fn build(
        &mut self,
        node: &SolutionNode,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        if self.query.is_tailable
            && !reqs.is_building_tailable_union
            && matches!(
                node.kind,
                SolutionKind::CollectionScan(_)
                    | SolutionKind::Limit { .. }
                    | SolutionKind::Skip { .. }
            )
        {
            return tailable::build_tailable_union(self, node, reqs);
        }

        trace!(kind = node.kind_name(), id = node.id, "lowering node");

        let (stage, slots) = match &node.kind {
            SolutionKind::CollectionScan(scan) => self.build_collection_scan(node, scan, reqs)?,
            SolutionKind::VirtualScan(scan) => self.build_virtual_scan(node, scan, reqs)?,
            SolutionKind::IndexScan(ixscan) => self.build_index_scan(node, ixscan, reqs)?,
            SolutionKind::Fetch { child, filter } => {
                self.build_fetch(node, child, filter.as_ref(), reqs)?
            }
            SolutionKind::Limit { child, limit } => self.build_limit(node, child, *limit, reqs)?,
            SolutionKind::Skip { child, skip } => self.build_skip(node, child, *skip, reqs)?,
            SolutionKind::SortSimple {
                child,
                pattern,
                limit,
            } => self.build_sort(node, child, pattern, *limit, true, reqs)?,
            SolutionKind::SortDefault {
                child,
                pattern,
                limit,
            } => self.build_sort(node, child, pattern, *limit, false, reqs)?,
            SolutionKind::SortKeyGenerator { .. } => {
                return Err(crate::contract_error!(
                    75_030,
                    "no translator for node kind '{}'",
                    node.kind_name()
                ));
            }
            SolutionKind::SortMerge {
                children,
                pattern,
                dedup,
            } => self.build_sort_merge(node, children, pattern, *dedup, reqs)?,
            SolutionKind::Or {
                children,
                dedup,
                filter,
            } => self.build_or(node, children, *dedup, filter.as_ref(), reqs)?,
            SolutionKind::TextOr { children, filter } => {
                // Text branches can surface the same document through
                // several term ranges; always dedup on record id.
                self.build_or(node, children, true, filter.as_ref(), reqs)?
            }
            SolutionKind::TextMatch {
                child,
                index_name,
                query_terms,
            } => self.build_text_match(node, child, index_name, query_terms, reqs)?,
            SolutionKind::ReturnKey { child } => self.build_return_key(node, child, reqs)?,
            SolutionKind::Eof => self.build_eof(node, reqs)?,
            SolutionKind::AndHash { children } => self.build_and_hash(node, children, reqs)?,
            SolutionKind::AndSorted { children } => self.build_and_sorted(node, children, reqs)?,
            SolutionKind::ProjectionSimple { child, fields } => {
                self.build_projection_simple(node, child, fields, reqs)?
            }
            SolutionKind::ProjectionCovered { child, fields } => {
                self.build_projection_covered(node, child, fields, reqs)?
            }
            SolutionKind::ProjectionDefault { child, spec } => {
                self.build_projection_default(node, child, spec, reqs)?
            }
            SolutionKind::ShardingFilter { child, shard_key } => {
                self.build_sharding_filter(node, child, shard_key, reqs)?
            }
        };

        slots.verify_satisfies(reqs, 75_020)?;
        Ok((stage, slots))
    }

    /// Allocate a fresh slot
    pub(crate) fn next_slot(&mut self) -> SlotId {
        self.slot_gen.generate()
    }

    /// COLLSCAN: delegate to the scan body generator, then project the
    /// empty object when `returnKey` was asked of a collection scan.
    fn build_collection_scan(
        &mut self,
        node: &SolutionNode,
        scan: &CollectionScanSol,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        crate::check_contract!(
            !reqs.has(SlotName::OplogTs) || scan.track_latest_oplog_ts,
            75_032,
            "oplogTs requested from a scan that does not track oplog timestamps"
        );

        let (mut stage, mut slots) = scans::generate_collection_scan(self, node.id, scan, reqs)?;

        if let Some(match_expr) = &scan.filter {
            let result_slot = slots.require(SlotName::Result, 75_024)?;
            stage = filter::apply_filter(self, stage, node.id, match_expr, result_slot);
        }

        if reqs.has(SlotName::ReturnKey) {
            // A collection scan has no index key; returnKey is the empty
            // object.
            let return_key_slot = self.next_slot();
            stage = stage.project(
                node.id,
                vec![(
                    return_key_slot,
                    Expr::constant(Val::Object(Document::new())),
                )],
            );
            slots.set(SlotName::ReturnKey, return_key_slot);
        }

        Ok((stage, narrow_bindings(slots, reqs)))
    }

    /// VIRTUAL_SCAN: inline documents wrapped in a multi-output scan;
    /// when the node simulates an index scan, project requested key
    /// components out of each document with `getField`.
    fn build_virtual_scan(
        &mut self,
        node: &SolutionNode,
        scan: &VirtualScanSol,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        crate::check_contract!(
            !reqs.has(SlotName::OplogTs),
            75_033,
            "oplogTs requested from a virtual scan"
        );
        crate::check_contract!(
            !reqs.has(SlotName::RecordId) || scan.has_record_id,
            75_034,
            "recordId requested from a virtual scan without record ids"
        );

        let (mut stage, mut slots) = scans::generate_virtual_scan(self, node.id, scan);

        if let (Some(key_pattern), Some(bitset)) = (&scan.index_key_pattern, reqs.index_key_bitset())
        {
            crate::check_contract!(
                bitset.len() == key_pattern.len(),
                75_096,
                "index-key bitset width {} does not match simulated key pattern of {} components",
                bitset.len(),
                key_pattern.len()
            );
            let result_slot = slots.require(SlotName::Result, 75_024)?;
            let mut assignments = Vec::new();
            let mut key_slots = Vec::new();
            for pos in bitset.ones() {
                let key_slot = self.next_slot();
                let mut expr = Expr::slot(result_slot);
                for component in key_pattern.parts()[pos].path.split('.') {
                    expr = crate::expr::make_get_field(expr, component);
                }
                assignments.push((key_slot, expr));
                key_slots.push(key_slot);
            }
            stage = stage.project(node.id, assignments);
            slots.set_index_key_slots(key_slots);
        }

        Ok((stage, narrow_bindings(slots, reqs)))
    }

    /// IXSCAN: scan the bits the parent asked for plus the bits needed
    /// internally, then rebuild `returnKey`/`result` from the key slots
    /// and narrow the visible slot vector back to the parent's bitset.
    fn build_index_scan(
        &mut self,
        node: &SolutionNode,
        ixscan: &IndexScanSol,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        crate::check_contract!(
            !reqs.has(SlotName::OplogTs),
            75_031,
            "oplogTs requested from an index scan"
        );

        let pattern_len = ixscan.key_pattern.len();
        let parent_bits = match reqs.index_key_bitset() {
            Some(bitset) => {
                crate::check_contract!(
                    bitset.len() == pattern_len,
                    75_096,
                    "index-key bitset width {} does not match key pattern of {} components",
                    bitset.len(),
                    pattern_len
                );
                *bitset
            }
            None => IndexKeyBitset::new(pattern_len),
        };

        // Rebuilding the document or the key object needs every
        // component.
        let needs_all = reqs.has(SlotName::Result) || reqs.has(SlotName::ReturnKey);
        let scan_bits = if needs_all {
            IndexKeyBitset::all(pattern_len)
        } else {
            parent_bits
        };

        let (mut stage, mut slots, key_slots) =
            scans::generate_index_scan(self, node.id, ixscan, &scan_bits, reqs)?;

        if reqs.has(SlotName::ReturnKey) {
            let pairs = ixscan
                .key_pattern
                .parts()
                .iter()
                .zip(&key_slots)
                .map(|(part, slot)| (part.path.clone(), Expr::slot(*slot)))
                .collect();
            let return_key_slot = self.next_slot();
            stage = stage.project(node.id, vec![(return_key_slot, make_new_obj(pairs))]);
            slots.set(SlotName::ReturnKey, return_key_slot);
        }

        if reqs.has(SlotName::Result) {
            let rehydrated =
                index_key::rehydrate_index_key(&ixscan.key_pattern, &scan_bits, &key_slots)?;
            let result_slot = self.next_slot();
            stage = stage.project(node.id, vec![(result_slot, rehydrated)]);
            slots.set(SlotName::Result, result_slot);
        }

        if reqs.index_key_bitset().is_some() {
            let visible = index_key::index_key_slots_matching_parent_reqs(
                &scan_bits,
                &parent_bits,
                &key_slots,
            )?;
            slots.set_index_key_slots(visible);
        }

        Ok((stage, narrow_bindings(slots, reqs)))
    }

    /// FETCH: require a record id from the child, then loop-join with a
    /// seek-by-recordId collection scan limited to one row (§ loop-join
    /// for fetch).
    fn build_fetch(
        &mut self,
        node: &SolutionNode,
        child: &SolutionNode,
        match_filter: Option<&MatchExpr>,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        let child_reqs = reqs
            .clone()
            .clear(SlotName::Result)
            .set(SlotName::RecordId);
        let (child_stage, mut child_slots) = self.build(child, &child_reqs)?;

        let record_id_slot = child_slots.require(SlotName::RecordId, 75_040)?;

        // Everything the parent wanted that the child already produced
        // is forwarded across the join.
        let mut forwarded: Vec<SlotId> = child_reqs
            .names()
            .filter(|name| *name != SlotName::Result)
            .filter_map(|name| child_slots.get(name))
            .collect();
        if let Some(key_slots) = child_slots.index_key_slots() {
            forwarded.extend(key_slots.iter().copied());
        }

        let inner_result_slot = self.next_slot();
        let inner_record_id_slot = self.next_slot();
        let seek = PhysStage::new(
            node.id,
            PhysOp::CollScan {
                namespace: self.query.namespace.clone(),
                result_slot: Some(inner_result_slot),
                record_id_slot: Some(inner_record_id_slot),
                oplog_ts_slot: None,
                seek_record_id_slot: Some(record_id_slot),
                resume_record_id_slot: None,
                direction: crate::solution::ScanDirection::Forward,
                tailable: false,
                yield_policy: self.yield_policy,
                lock_acquisition: None,
            },
        )
        .limit_skip(node.id, Some(1), None);

        let mut stage = PhysStage::new(
            node.id,
            PhysOp::LoopJoin {
                outer: Box::new(child_stage),
                inner: Box::new(seek),
                outer_proj: forwarded,
                correlated: vec![record_id_slot],
                predicate: None,
            },
        );

        if let Some(match_expr) = match_filter {
            stage = filter::apply_filter(self, stage, node.id, match_expr, inner_result_slot);
        }

        let mut slots = PlanNodeSlots::new();
        slots.set(SlotName::Result, inner_result_slot);
        slots.set(SlotName::RecordId, record_id_slot);
        for name in [SlotName::ReturnKey, SlotName::OplogTs] {
            if let Some(slot) = child_slots.get(name) {
                slots.set(name, slot);
            }
        }
        if let Some(key_slots) = child_slots.take_index_key_slots() {
            slots.set_index_key_slots(key_slots);
        }

        Ok((stage, narrow_bindings(slots, reqs)))
    }

    /// LIMIT: fuse with a skip child into a single limit-skip operator;
    /// suppressed entirely inside the resume branch of a tailable union.
    fn build_limit(
        &mut self,
        node: &SolutionNode,
        child: &SolutionNode,
        limit: u64,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        if reqs.is_tailable_resume_branch {
            return self.build(child, reqs);
        }

        if let SolutionKind::Skip {
            child: grandchild,
            skip,
        } = &child.kind
        {
            let (stage, slots) = self.build(grandchild, reqs)?;
            return Ok((
                stage.limit_skip(node.id, Some(limit), Some(*skip)),
                slots,
            ));
        }

        let (stage, slots) = self.build(child, reqs)?;
        Ok((stage.limit_skip(node.id, Some(limit), None), slots))
    }

    /// SKIP: symmetric fusion-aware construction. A limit child is
    /// absorbed by narrowing the limit to the rows remaining after the
    /// skip.
    fn build_skip(
        &mut self,
        node: &SolutionNode,
        child: &SolutionNode,
        skip: u64,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        if reqs.is_tailable_resume_branch {
            return self.build(child, reqs);
        }

        if let SolutionKind::Limit {
            child: grandchild,
            limit,
        } = &child.kind
        {
            let (stage, slots) = self.build(grandchild, reqs)?;
            let remaining = limit.saturating_sub(skip);
            return Ok((
                stage.limit_skip(node.id, Some(remaining), Some(skip)),
                slots,
            ));
        }

        let (stage, slots) = self.build(child, reqs)?;
        Ok((stage.limit_skip(node.id, None, Some(skip)), slots))
    }

    /// OR / TEXT_OR: union the branches over a fresh output slot vector,
    /// optionally dedup on record id, optionally apply a residual
    /// filter.
    fn build_or(
        &mut self,
        node: &SolutionNode,
        children: &[SolutionNode],
        dedup: bool,
        match_filter: Option<&MatchExpr>,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        crate::check_contract!(!children.is_empty(), 75_098, "or node with no branches");

        let child_reqs = reqs
            .clone()
            .set_if(SlotName::RecordId, dedup)
            .set_if(SlotName::Result, match_filter.is_some());

        let mut branches = Vec::with_capacity(children.len());
        let mut input_slots = Vec::with_capacity(children.len());
        for child in children {
            let (stage, slots) = self.build(child, &child_reqs)?;
            input_slots.push(slots.all_slots(&child_reqs));
            branches.push(stage);
        }

        let ordered_names: Vec<SlotName> = child_reqs.names().collect();
        let output_slots = self.slot_gen.generate_many(input_slots[0].len());

        let mut stage = PhysStage::new(
            node.id,
            PhysOp::Union {
                children: branches,
                input_slots,
                output_slots: output_slots.clone(),
            },
        );

        let mut slots = PlanNodeSlots::new();
        for (name, slot) in ordered_names.iter().zip(&output_slots) {
            slots.set(*name, *slot);
        }
        if child_reqs.index_key_bitset().is_some() {
            slots.set_index_key_slots(output_slots[ordered_names.len()..].to_vec());
        }

        if dedup {
            let record_id_slot = slots.require(SlotName::RecordId, 75_041)?;
            stage = PhysStage::new(
                node.id,
                PhysOp::Unique {
                    input: Box::new(stage),
                    key_slots: vec![record_id_slot],
                },
            );
        }

        if let Some(match_expr) = match_filter {
            let result_slot = slots.require(SlotName::Result, 75_024)?;
            stage = filter::apply_filter(self, stage, node.id, match_expr, result_slot);
        }

        Ok((stage, narrow_bindings(slots, reqs)))
    }

    /// TEXT_MATCH: materialize an FTS matcher from the catalog at build
    /// time and embed it as a constant in an `ftsMatch` filter, guarded
    /// against non-object subjects.
    fn build_text_match(
        &mut self,
        node: &SolutionNode,
        child: &SolutionNode,
        index_name: &str,
        query_terms: &[String],
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        crate::check_contract!(
            !query_terms.is_empty(),
            75_071,
            "text match with an empty term list"
        );

        let child_reqs = reqs.clone().set(SlotName::Result);
        let (stage, slots) = self.build(child, &child_reqs)?;

        // A text match must run over fetched documents.
        let result_slot = slots.require(SlotName::Result, 75_070)?;

        let entry = self
            .catalog
            .index_entry(self.op_ctx, &self.query.namespace, index_name)?;
        let fts = entry
            .fts
            .clone()
            .ok_or_else(|| BuildError::NotATextIndex {
                namespace: self.query.namespace.clone(),
                index: index_name.to_string(),
            })?;
        let matcher = Arc::new(crate::catalog::TextMatcher::compile(
            index_name,
            fts,
            query_terms.to_vec(),
        ));

        let predicate = crate::expr::make_if(
            crate::expr::make_is_object(Expr::slot(result_slot)),
            crate::expr::make_function(
                crate::expr::BuiltinFn::FtsMatch,
                vec![
                    Expr::Opaque(crate::expr::OpaqueConstant::TextMatcher(matcher)),
                    Expr::slot(result_slot),
                ],
            ),
            Expr::Fail {
                code: crate::error::codes::TEXT_SUBJECT_NOT_OBJECT,
                message: "text match subject must be an object".to_string(),
            },
        );

        Ok((
            stage.filter(node.id, predicate),
            narrow_bindings(slots, reqs),
        ))
    }

    /// RETURN_KEY: demand `returnKey` from the child, then expose it as
    /// the parent-visible `result`.
    fn build_return_key(
        &mut self,
        _node: &SolutionNode,
        child: &SolutionNode,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        let child_reqs = reqs
            .clone()
            .clear(SlotName::Result)
            .set(SlotName::ReturnKey);
        let (stage, mut child_slots) = self.build(child, &child_reqs)?;

        let return_key_slot = child_slots.require(SlotName::ReturnKey, 75_095)?;

        let mut slots = PlanNodeSlots::new();
        slots.set(SlotName::Result, return_key_slot);
        for name in [SlotName::RecordId, SlotName::OplogTs] {
            if let Some(slot) = child_slots.get(name) {
                slots.set(name, slot);
            }
        }
        if let Some(key_slots) = child_slots.take_index_key_slots() {
            slots.set_index_key_slots(key_slots);
        }

        Ok((stage, narrow_bindings(slots, reqs)))
    }

    /// EOF: a zero-row plan that still binds every requested slot to
    /// `Nothing`, so downstream accessor lookups never fail.
    fn build_eof(
        &mut self,
        node: &SolutionNode,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        let mut slots = PlanNodeSlots::new();
        let mut assignments = Vec::new();
        for name in reqs.names() {
            let slot = self.next_slot();
            assignments.push((slot, Expr::nothing()));
            slots.set(name, slot);
        }
        if let Some(bitset) = reqs.index_key_bitset() {
            let mut key_slots = Vec::new();
            for _ in bitset.ones() {
                let slot = self.next_slot();
                assignments.push((slot, Expr::nothing()));
                key_slots.push(slot);
            }
            slots.set_index_key_slots(key_slots);
        }

        let stage = PhysStage::new(node.id, PhysOp::CoScan)
            .limit_skip(node.id, Some(0), None)
            .project(node.id, assignments);

        Ok((stage, slots))
    }

    /// AND_HASH: every child must produce `result` and `recordId`; fold
    /// left with hash joins keyed on record id, carrying `result` as the
    /// payload and inheriting the collator from the environment.
    fn build_and_hash(
        &mut self,
        node: &SolutionNode,
        children: &[SolutionNode],
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        crate::check_contract!(
            children.len() >= 2,
            75_050,
            "and-hash needs at least two children, got {}",
            children.len()
        );

        let child_reqs = reqs
            .clone()
            .set(SlotName::Result)
            .set(SlotName::RecordId);
        let collator_slot = self.env.slot(ENV_COLLATOR);

        let (first, rest) = children
            .split_first()
            .ok_or_else(|| crate::contract_error!(75_050, "and-hash with no children"))?;
        let (mut stage, acc_slots) = self.build(first, &child_reqs)?;
        let mut record_id_slot = acc_slots.require(SlotName::RecordId, 75_051)?;
        let mut result_slot = acc_slots.require(SlotName::Result, 75_051)?;

        for child in rest {
            let (inner_stage, inner_slots) = self.build(child, &child_reqs)?;
            let inner_record_id = inner_slots.require(SlotName::RecordId, 75_051)?;
            let inner_result = inner_slots.require(SlotName::Result, 75_051)?;

            stage = PhysStage::new(
                node.id,
                PhysOp::HashJoin {
                    outer: Box::new(stage),
                    inner: Box::new(inner_stage),
                    outer_cond: vec![record_id_slot],
                    outer_proj: vec![result_slot],
                    inner_cond: vec![inner_record_id],
                    inner_proj: vec![inner_result],
                    collator_slot,
                },
            );

            // Later joins reuse the inner side's id/result slots, so no
            // renaming project is needed between folds.
            record_id_slot = inner_record_id;
            result_slot = inner_result;
        }

        let mut slots = PlanNodeSlots::new();
        slots.set(SlotName::Result, result_slot);
        slots.set(SlotName::RecordId, record_id_slot);
        Ok((stage, narrow_bindings(slots, reqs)))
    }

    /// AND_SORTED: same contract as and-hash, folded with merge joins
    /// over record id ascending.
    fn build_and_sorted(
        &mut self,
        node: &SolutionNode,
        children: &[SolutionNode],
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        crate::check_contract!(
            children.len() >= 2,
            75_050,
            "and-sorted needs at least two children, got {}",
            children.len()
        );

        let child_reqs = reqs
            .clone()
            .set(SlotName::Result)
            .set(SlotName::RecordId);

        let (first, rest) = children
            .split_first()
            .ok_or_else(|| crate::contract_error!(75_050, "and-sorted with no children"))?;
        let (mut stage, acc_slots) = self.build(first, &child_reqs)?;
        let mut record_id_slot = acc_slots.require(SlotName::RecordId, 75_051)?;
        let mut result_slot = acc_slots.require(SlotName::Result, 75_051)?;

        for child in rest {
            let (inner_stage, inner_slots) = self.build(child, &child_reqs)?;
            let inner_record_id = inner_slots.require(SlotName::RecordId, 75_051)?;
            let inner_result = inner_slots.require(SlotName::Result, 75_051)?;

            stage = PhysStage::new(
                node.id,
                PhysOp::MergeJoin {
                    outer: Box::new(stage),
                    inner: Box::new(inner_stage),
                    outer_cond: vec![record_id_slot],
                    outer_proj: vec![result_slot],
                    inner_cond: vec![inner_record_id],
                    inner_proj: vec![inner_result],
                    dirs: vec![SortDir::Asc],
                },
            );

            record_id_slot = inner_record_id;
            result_slot = inner_result;
        }

        let mut slots = PlanNodeSlots::new();
        slots.set(SlotName::Result, result_slot);
        slots.set(SlotName::RecordId, record_id_slot);
        Ok((stage, narrow_bindings(slots, reqs)))
    }

    /// SORT_MERGE: each child contributes sort-key slots extracted from
    /// its own index key pattern, reordered to the merge pattern's
    /// order; compose a sorted merge and optionally dedup on record id.
    fn build_sort_merge(
        &mut self,
        node: &SolutionNode,
        children: &[SolutionNode],
        pattern: &SortPattern,
        dedup: bool,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        crate::check_contract!(!children.is_empty(), 75_098, "sort-merge with no children");
        crate::check_contract!(
            reqs.index_key_bitset().is_none(),
            75_062,
            "sort-merge does not forward index-key requests"
        );

        let visible_reqs = reqs.clone().set_if(SlotName::RecordId, dedup);
        let ordered_names: Vec<SlotName> = visible_reqs.names().collect();

        let mut branches = Vec::with_capacity(children.len());
        let mut input_slots = Vec::with_capacity(children.len());
        let mut key_slot_vectors = Vec::with_capacity(children.len());

        for child in children {
            let ixscan = child.index_scan_beneath().ok_or_else(|| {
                crate::contract_error!(
                    75_060,
                    "sort-merge child '{}' has no index scan beneath it",
                    child.kind_name()
                )
            })?;

            // Each child's key pattern may order the sort fields
            // differently; build the position map before recursing.
            let mut positions = Vec::with_capacity(pattern.len());
            let mut bits = IndexKeyBitset::new(ixscan.key_pattern.len());
            for part in pattern.parts() {
                let pos = ixscan.key_pattern.position_of(&part.path).ok_or_else(|| {
                    crate::contract_error!(
                        75_061,
                        "sort path '{}' not found in child key pattern",
                        part.path
                    )
                })?;
                positions.push(pos);
                bits = bits.set(pos);
            }

            let child_reqs = visible_reqs.clone().with_index_key_bitset(bits);
            let (stage, slots) = self.build(child, &child_reqs)?;

            let returned = slots.index_key_slots().unwrap_or(&[]);
            let sorted_positions: Vec<usize> = bits.ones().collect();
            let mut keys_in_pattern_order = Vec::with_capacity(pattern.len());
            for pos in &positions {
                let index = sorted_positions
                    .iter()
                    .position(|candidate| candidate == pos)
                    .ok_or_else(|| {
                        crate::contract_error!(75_061, "sort-key position {pos} not returned")
                    })?;
                keys_in_pattern_order.push(returned[index]);
            }

            key_slot_vectors.push(keys_in_pattern_order);
            input_slots.push(
                ordered_names
                    .iter()
                    .filter_map(|name| slots.get(*name))
                    .collect(),
            );
            branches.push(stage);
        }

        let dirs: Vec<SortDir> = pattern
            .parts()
            .iter()
            .map(|part| if part.ascending { SortDir::Asc } else { SortDir::Desc })
            .collect();
        let output_slots = self.slot_gen.generate_many(ordered_names.len());

        let mut stage = PhysStage::new(
            node.id,
            PhysOp::SortedMerge {
                children: branches,
                key_slots: key_slot_vectors,
                dirs,
                input_slots,
                output_slots: output_slots.clone(),
            },
        );

        let mut slots = PlanNodeSlots::new();
        for (name, slot) in ordered_names.iter().zip(&output_slots) {
            slots.set(*name, *slot);
        }

        if dedup {
            let record_id_slot = slots.require(SlotName::RecordId, 75_041)?;
            stage = PhysStage::new(
                node.id,
                PhysOp::Unique {
                    input: Box::new(stage),
                    key_slots: vec![record_id_slot],
                },
            );
        }

        Ok((stage, narrow_bindings(slots, reqs)))
    }

    /// PROJECTION_SIMPLE: keep only the named top-level fields of the
    /// child's result.
    fn build_projection_simple(
        &mut self,
        node: &SolutionNode,
        child: &SolutionNode,
        fields: &[String],
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        let child_reqs = reqs.clone().set(SlotName::Result);
        let (stage, mut slots) = self.build(child, &child_reqs)?;
        let result_slot = slots.require(SlotName::Result, 75_024)?;

        let output_slot = self.next_slot();
        let stage = PhysStage::new(
            node.id,
            PhysOp::MakeObj {
                input: Box::new(stage),
                output_slot,
                root_slot: Some(result_slot),
                field_behavior: FieldBehavior::Keep,
                fields: fields.to_vec(),
                projected: Vec::new(),
            },
        );

        slots.set(SlotName::Result, output_slot);
        Ok((stage, narrow_bindings(slots, reqs)))
    }

    /// PROJECTION_COVERED: never materialize the document; request the
    /// needed key components from the index scan below and build the
    /// object straight from the scalar slots.
    fn build_projection_covered(
        &mut self,
        node: &SolutionNode,
        child: &SolutionNode,
        fields: &[String],
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        let ixscan = child.index_scan_beneath().ok_or_else(|| {
            crate::contract_error!(
                75_081,
                "covered projection over '{}' which has no index scan beneath it",
                child.kind_name()
            )
        })?;

        let mut bits = IndexKeyBitset::new(ixscan.key_pattern.len());
        for field in fields {
            let pos = ixscan.key_pattern.position_of(field).ok_or_else(|| {
                crate::contract_error!(
                    75_080,
                    "covered projection field '{field}' not in index key pattern"
                )
            })?;
            bits = bits.set(pos);
        }

        let child_reqs = reqs
            .clone()
            .clear(SlotName::Result)
            .with_index_key_bitset(bits);
        let (stage, mut slots) = self.build(child, &child_reqs)?;

        let key_slots: Vec<SlotId> = slots
            .take_index_key_slots()
            .unwrap_or_default();
        let rehydrated =
            index_key::rehydrate_index_key(&ixscan.key_pattern, &bits, &key_slots)?;
        let output_slot = self.next_slot();
        let stage = stage.project(node.id, vec![(output_slot, rehydrated)]);

        slots.set(SlotName::Result, output_slot);
        Ok((stage, narrow_bindings(slots, reqs)))
    }

    /// PROJECTION_DEFAULT: delegate to the projection expression
    /// sub-builder with `result` required.
    fn build_projection_default(
        &mut self,
        node: &SolutionNode,
        child: &SolutionNode,
        spec: &crate::solution::ProjectionSpec,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        let child_reqs = reqs.clone().set(SlotName::Result);
        let (stage, mut slots) = self.build(child, &child_reqs)?;
        let result_slot = slots.require(SlotName::Result, 75_024)?;

        let (stage, output_slot) =
            projection::apply_projection(self, stage, node.id, spec, result_slot);

        slots.set(SlotName::Result, output_slot);
        Ok((stage, narrow_bindings(slots, reqs)))
    }
}

/// Prune bindings down to exactly what the parent requested (translator
/// rule 4).
pub(crate) fn narrow_bindings(mut slots: PlanNodeSlots, reqs: &PlanNodeReqs) -> PlanNodeSlots {
    let mut narrowed = PlanNodeSlots::new();
    for name in reqs.names() {
        if let Some(slot) = slots.get(name) {
            narrowed.set(name, slot);
        }
    }
    if reqs.index_key_bitset().is_some() {
        if let Some(key_slots) = slots.take_index_key_slots() {
            narrowed.set_index_key_slots(key_slots);
        }
    }
    narrowed
}
