pub mod explain;
pub mod guards;
pub mod ingest;
pub mod lens;
pub mod merge;
pub mod tour;

#[cfg(test)]
pub(crate) mod testing;
