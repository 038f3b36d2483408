pub mod frame;
pub mod mux;

pub use mux::Bridge;
