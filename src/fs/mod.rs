pub mod core;
pub(crate) mod alloc;
pub(crate) mod geometry;
pub(crate) mod handles;
pub(crate) mod read;
pub(crate) mod release;
pub(crate) mod seek;
pub(crate) mod table;
pub(crate) mod write;

#[cfg(test)]
mod tests;
