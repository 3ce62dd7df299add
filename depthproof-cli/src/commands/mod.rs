pub mod attest;
pub mod queue;
pub mod seal;
pub mod status;
pub mod upload;
