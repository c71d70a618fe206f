//! Prompt-guard mediation: asynchronous classification of user text over
//! the event log's pub-sub channels, with per-user behavioral escalation.

pub mod behavior;
pub mod mediator;

pub use behavior::BehaviorTracker;
pub use mediator::{
    reply_channel, GuardMediator, GuardOutcome, GuardRequest, Verdict, GUARD_REPLY_PATTERN,
    GUARD_REQUEST_CHANNEL,
};
