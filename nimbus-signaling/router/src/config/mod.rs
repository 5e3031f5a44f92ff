mod settings;

pub use settings::RouterConfig;
