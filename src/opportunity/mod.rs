//! Opportunity pipeline: score new launch candidates, match them against
//! enabled auto strategies, enqueue buy jobs.

pub mod matcher;
pub mod scorer;

pub use matcher::OpportunityMatcher;
pub use scorer::{score_candidate, ScoreBreakdown, TokenMetrics};
