pub mod api;
pub mod auth;
pub mod config;
pub mod handlers;
pub mod router;
pub mod server;

#[cfg(test)]
mod test_utils;
