pub mod agent;
pub mod config;
pub mod errors;
pub mod llm;
pub mod sandbox;
pub mod server;
pub mod store;
pub mod tools;
pub mod workflow;

#[cfg(test)]
mod test_support;
