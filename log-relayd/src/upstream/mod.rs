pub mod client;
pub mod streams;

#[cfg(test)]
pub(crate) mod mock;
