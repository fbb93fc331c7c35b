use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::{TimeZone, Utc};

use intake_common::store::MemoryStore;
use intake_common::time::FixedTime;

use crate::router::{router, AppState};

pub const ADMIN_TOKEN: &str = "intake-admin-token";
pub const WEBSITE_DATA_TTL_SECS: i64 = 300;

/// Application state over an in-memory store, with a clock that only moves when advanced.
pub fn setup_state(admin_token: Option<&str>) -> (FixedTime, AppState) {
    let clock = FixedTime::new(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap());
    let timesource = Arc::new(clock.clone());
    let state = AppState::new(
        Arc::new(MemoryStore::new(timesource.clone())),
        timesource,
        Duration::from_secs(WEBSITE_DATA_TTL_SECS.unsigned_abs()),
        admin_token.map(str::to_owned),
    );

    (clock, state)
}

pub fn setup_app(admin_token: Option<&str>) -> (FixedTime, Router) {
    let (clock, state) = setup_state(admin_token);
    (clock, router(state, 1_000_000, 10))
}
