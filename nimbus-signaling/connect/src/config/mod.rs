mod settings;

pub use settings::ConnectConfig;
