//! Background worker: drains the Redis job queue and runs periodic maintenance.

pub mod email;
pub mod scheduler;
pub mod worker;
