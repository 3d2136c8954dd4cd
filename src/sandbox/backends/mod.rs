pub mod local_host;
pub mod memory;
