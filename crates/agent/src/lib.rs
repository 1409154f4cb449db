pub mod agent;
pub mod broadcast;
pub mod capture;
pub mod cli;
pub mod input;
pub mod media;
pub mod offer;
pub mod peer;
pub mod session;
pub mod trickle;

#[cfg(test)]
mod testing;
