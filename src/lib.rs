pub mod aggregate;
pub mod cli;
pub mod collectors;
pub mod config;
pub mod error;
pub mod source;
pub mod status;

#[cfg(test)]
pub mod test_support;
