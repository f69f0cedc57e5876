//! # Slotplan — Slot-Based Stage Builder
//!
//! Lowers a document database's logical query-solution tree (the
//! planner's output) into a physical execution tree of slot-based
//! operators.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Canonical Query + Catalog
//!     ↓
//! [Query Planner]        → QuerySolution (logical tree)   ← upstream, not here
//!     ↓
//! [Stage Builder]        → PhysStage tree + PlanStageData ← this crate
//!     ↓
//! [Execution Runtime]    → results                        ← downstream, not here
//! ```
//!
//! The builder is a single-pass post-order recursion. A *requirements*
//! contract flows down the tree (which named slots and index-key
//! components a parent wants) and a *slot bindings* contract flows back
//! up (which slots the child actually materialized). Along the way the
//! builder fabricates auxiliary subplans: index-key rehydration, sort-key
//! traversal with MQL array semantics, the tailable-cursor anchor/resume
//! union, and the covered shard-filter optimization.
//!
//! ## Usage
//!
//! ```rust
//! use slotplan::builder::StageBuilder;
//! use slotplan::catalog::CollectionCatalog;
//! use slotplan::config::BuilderConfig;
//! use slotplan::context::{CanonicalQuery, OperationContext};
//! use slotplan::solution::{
//!     CollectionScanSol, QuerySolution, SolutionKind, SolutionNode,
//! };
//!
//! let op_ctx = OperationContext::new();
//! let query = CanonicalQuery::simple("test.coll");
//! let catalog = CollectionCatalog::new();
//!
//! let solution = QuerySolution::new(SolutionNode::new(
//!     1,
//!     SolutionKind::CollectionScan(CollectionScanSol::default()),
//! ));
//!
//! let builder = StageBuilder::new(&op_ctx, &query, &catalog, BuilderConfig::default())
//!     .expect("builder");
//! let (root, data) = builder.build_root(&solution).expect("lowering");
//!
//! println!("{}", root.explain());
//! println!("{}", data.debug_string());
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `value` | document value model (`Val`, `Document`) |
//! | `slots` | slot/frame/spool id newtypes and generators |
//! | `reqs` | requirements (down) and slot bindings (up) |
//! | `env` | named runtime slots, `PlanStageData` |
//! | `expr` | compiled expression trees |
//! | `solution` | the logical input tree |
//! | `physical` | the physical operator library (opaque constructors) |
//! | `catalog` | index metadata lookups |
//! | `context` | operation context, canonical query, shard filterer |
//! | `builder` | the lowering pass itself |
//! | `config` | sort resource limits (figment) |
//! | `error` | contract violations and user-visible failures |

pub mod builder;
pub mod catalog;
pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod expr;
pub mod physical;
pub mod reqs;
pub mod slots;
pub mod solution;
pub mod value;

// Re-export the types a caller touches on the happy path
pub use crate::builder::StageBuilder;
pub use crate::config::BuilderConfig;
pub use crate::env::PlanStageData;
pub use crate::error::BuildError;
pub use crate::physical::PhysStage;
pub use crate::reqs::{PlanNodeReqs, PlanNodeSlots, SlotName};
pub use crate::solution::QuerySolution;
