pub mod remote;
pub mod simulated;
