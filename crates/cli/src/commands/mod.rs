pub mod policy;
pub mod simulate;
pub mod status;
