#![forbid(unsafe_code)]
//! Metamorphic shader-compiler testing and test-case reduction.
//!
//! Generated (reference, variant) program pairs flow from a bounded queue
//! into workers that run them through a remote oracle and file faults for
//! triage. Faulting variants can be shrunk by the reduction driver, a greedy
//! oracle-guided fixpoint search over a mutable program tree.

pub mod config;
pub mod events;
pub mod finder;
pub mod job;
pub mod opportunity;
pub mod oracle;
pub mod program_tree;
pub mod queue;
pub mod reducer;
pub mod remote;
pub mod triage;
pub mod validate;
pub mod worker;

pub use finder::{FinderConfig, OpportunityFinder};
pub use job::{JobResult, JobStatus, ProgramPair, ShaderJob};
pub use opportunity::{ReductionError, ReductionOpportunity};
pub use oracle::{FaultReproductionOracle, InterestingnessOracle, ShaderRunner, Verdict};
pub use program_tree::{NodeId, ProgramAst, ProgramTree, StructuralError};
pub use reducer::{ReductionConfig, ReductionOutcome, Reducer, Termination};
