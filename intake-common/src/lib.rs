pub mod cache;
pub mod content;
pub mod funnel;
pub mod metrics;
pub mod states;
pub mod store;
pub mod submission;
pub mod time;
