pub mod auth;
pub mod last_seen;
pub mod throttle;
