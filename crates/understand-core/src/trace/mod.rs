pub mod native;
pub mod python;
pub mod recorder;
