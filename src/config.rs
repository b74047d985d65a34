use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub allowed_origin: String,
    pub max_upload_bytes: usize,
    pub nof_instances: usize,
    pub pdp_grid_points: usize,
    pub rhale_bins: usize,
    pub plot_width: u32,
    pub plot_height: u32,
    pub seed: u64,
    pub model_temp_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000),
            allowed_origin: "http://localhost:4200".to_string(),
            max_upload_bytes: 100 * 1024 * 1024,
            nof_instances: 300,
            pdp_grid_points: 50,
            rhale_bins: 20,
            plot_width: 800,
            plot_height: 600,
            seed: 21,
            model_temp_dir: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = env::var("SERVER_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.listen_addr);
        let allowed_origin =
            env::var("CORS_ALLOWED_ORIGIN").unwrap_or(defaults.allowed_origin);

        let max_upload_bytes = parse_var("MAX_UPLOAD_BYTES").unwrap_or(defaults.max_upload_bytes);
        let nof_instances = parse_var("NOF_INSTANCES").unwrap_or(defaults.nof_instances);
        let pdp_grid_points = parse_var("PDP_GRID_POINTS").unwrap_or(defaults.pdp_grid_points);
        let rhale_bins = parse_var("RHALE_BINS").unwrap_or(defaults.rhale_bins);
        let plot_width = parse_var("PLOT_WIDTH").unwrap_or(defaults.plot_width);
        let plot_height = parse_var("PLOT_HEIGHT").unwrap_or(defaults.plot_height);
        let seed = parse_var("ANALYSIS_SEED").unwrap_or(defaults.seed);
        let model_temp_dir = env::var("MODEL_TEMP_DIR").ok().map(PathBuf::from);

        if let Some(dir) = model_temp_dir.as_ref() {
            std::fs::create_dir_all(dir)?;
        }

        Ok(Self {
            listen_addr,
            allowed_origin,
            max_upload_bytes,
            nof_instances: nof_instances.max(1),
            pdp_grid_points: pdp_grid_points.max(2),
            rhale_bins: rhale_bins.max(1),
            plot_width: plot_width.max(64),
            plot_height: plot_height.max(64),
            seed,
            model_temp_dir,
        })
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
