pub mod batch;
pub mod inventory;
pub mod resolve;
pub mod status;
