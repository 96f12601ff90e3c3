pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
