pub mod hub;
pub mod middleware;
pub mod response;
pub mod routes;
pub mod state;
