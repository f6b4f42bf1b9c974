use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub demo: DemoSettings,
    pub remote: RemoteSettings,
}

#[derive(Debug, Deserialize)]
pub struct DemoSettings {
    pub submissions: usize,
    pub max_workers: usize,
}

#[derive(Debug, Deserialize)]
pub struct RemoteSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .build()?;
        s.try_deserialize()
    }
}
