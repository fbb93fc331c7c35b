pub mod app;
pub mod content;
pub mod funnel;
pub mod submission;
pub mod website;
