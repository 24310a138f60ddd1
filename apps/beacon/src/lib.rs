pub mod config;
pub mod media;
pub mod negotiation;
pub mod session;
pub mod telemetry;

#[cfg(test)]
mod tests;
