pub mod admin;
pub mod analytics;
pub mod comments;
pub mod counters;
pub mod invitations;
pub mod mailer;
pub mod maintenance;
pub mod notifications;
pub mod otp;
pub mod password;
pub mod presence;
pub mod projects;
pub mod query;
pub mod status_requests;
pub mod stripe;
pub mod subscriptions;
pub mod tasks;
pub mod users;
