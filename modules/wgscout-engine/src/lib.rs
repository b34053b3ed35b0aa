//! Listing acquisition and outreach engine.
//!
//! Per active search: authenticate, crawl result pages, dedup and filter,
//! compose an outreach message per new listing, dispatch under pacing
//! constraints, record run statistics. One search's failure never affects
//! sibling runs.

pub mod cancel;
pub mod compose;
pub mod crawler;
pub mod dispatch;
pub mod filter;
pub mod parse;
pub mod scheduler;
pub mod session;
pub mod site;
pub mod stats;

pub use cancel::CancelFlag;
pub use scheduler::SearchScheduler;
