pub mod bridge;
pub mod config;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod shutdown;
pub mod worker;

#[cfg(test)]
mod test_support;
