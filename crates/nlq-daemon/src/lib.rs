pub mod accounts;
mod middleware;
pub mod server;
pub mod telemetry;
