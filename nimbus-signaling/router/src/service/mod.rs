pub mod wire;

pub use wire::RouterContext;
