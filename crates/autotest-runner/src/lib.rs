pub mod collaborators;
pub mod config;
pub mod controller;
pub mod postprocess;
pub mod process;
pub mod sandbox;

pub use collaborators::{
    Analyzer, BudgetReviewer, CollaboratorError, CollaboratorSet, CommandAnalyzer,
    CommandGenerator, CommandReviewer, CommandSpec, GenerationRequest, NoopAnalyzer,
    ReviewRequest, Reviewer, TestGenerator, Verdict,
};
pub use config::{AutotestConfig, LoopConfig, SandboxConfig, SandboxMode, DEFAULT_CONFIG_FILE};
pub use controller::{load_submission, Controller, IterationState, Phase, RunOutcome, SourceFiles};
pub use sandbox::{Executor, Launcher, SandboxRunner, TIMEOUT_MESSAGE};
