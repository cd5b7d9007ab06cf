pub mod approval;
pub mod rule;
