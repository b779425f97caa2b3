pub mod addr;
pub mod error;
pub mod frame;
pub mod headers;
