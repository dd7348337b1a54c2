//! Human-in-the-loop request/response plumbing.

pub mod registry;
pub mod types;

pub use registry::{HitlRegistry, HitlRequestSpec};
pub use types::{
    AnswerSource, ClarificationOption, DecisionOption, EnvVarField, EnvVarInputType, HitlAnswer,
    HitlKind, HitlOptions, PendingHitlRequest,
};
