//! Configuration: JSON file, then flags, then defaults, merged into one
//! validated value consumed by the constructors.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use {
    anyhow::{bail, Result},
    clap::Parser,
    serde::Deserialize,
};

#[derive(Parser, Debug, Default)]
#[command(name = "inknode", version, about = "E-ink canvas node for the gateway")]
pub struct Args {
    /// Path to the JSON config file.
    #[arg(long, default_value = "config.json")]
    pub config: PathBuf,

    /// Gateway hostname.
    #[arg(long)]
    pub gateway: Option<String>,

    /// Gateway port.
    #[arg(long)]
    pub gateway_port: Option<u16>,

    /// Use TLS for the gateway websocket.
    #[arg(long)]
    pub gateway_tls: bool,

    /// Gateway websocket path.
    #[arg(long)]
    pub gateway_path: Option<String>,

    /// Node name.
    #[arg(long)]
    pub name: Option<String>,

    /// State directory for identity, token, and overlay state.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Touch input device path.
    #[arg(long)]
    pub touch_device: Option<PathBuf>,

    /// Framebuffer device path.
    #[arg(long)]
    pub framebuffer: Option<PathBuf>,

    /// Log level.
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
    pub gateway: Option<String>,
    pub gateway_port: Option<u16>,
    #[serde(rename = "gatewayTLS")]
    pub gateway_tls: Option<bool>,
    pub gateway_path: Option<String>,
    pub name: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub touch_device: Option<PathBuf>,
    pub framebuffer: Option<PathBuf>,
    pub log_level: Option<String>,
    pub http_user_agent: Option<String>,
    pub idle_timeout_min: Option<i64>,
    pub suspend_enabled: Option<bool>,
    pub token: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: String,
    pub gateway_port: u16,
    pub gateway_tls: bool,
    pub gateway_path: String,
    pub name: String,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub touch_device: Option<PathBuf>,
    pub framebuffer: PathBuf,
    pub log_level: String,
    pub user_agent: String,
    pub idle_timeout: Duration,
    pub suspend_enabled: bool,
    pub token: Option<String>,
    pub password: Option<String>,
}

impl Config {
    pub fn load(args: &Args) -> Result<Self> {
        let file = read_file_config(&args.config)?;
        Self::merge(args, file)
    }

    fn merge(args: &Args, file: FileConfig) -> Result<Self> {
        let config_dir = args
            .config
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let gateway = args
            .gateway
            .clone()
            .or(file.gateway)
            .unwrap_or_default();
        if gateway.is_empty() {
            bail!("config requires gateway");
        }
        let name = args.name.clone().or(file.name).unwrap_or_default();
        if name.is_empty() {
            bail!("config requires name");
        }

        let gateway_tls = args.gateway_tls || file.gateway_tls.unwrap_or(false);
        let gateway_port = args
            .gateway_port
            .or(file.gateway_port)
            .unwrap_or(if gateway_tls { 443 } else { 80 });
        let gateway_path = args
            .gateway_path
            .clone()
            .or(file.gateway_path)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/ws".to_string());

        let idle_timeout_min = file.idle_timeout_min.unwrap_or(5);
        let idle_timeout = if idle_timeout_min > 0 {
            Duration::from_secs(idle_timeout_min as u64 * 60)
        } else {
            Duration::ZERO
        };

        Ok(Self {
            gateway,
            gateway_port,
            gateway_tls,
            gateway_path,
            name,
            state_dir: args
                .state_dir
                .clone()
                .or(file.state_dir)
                .unwrap_or_else(|| config_dir.join("state")),
            config_dir,
            touch_device: args.touch_device.clone().or(file.touch_device),
            framebuffer: args
                .framebuffer
                .clone()
                .or(file.framebuffer)
                .unwrap_or_else(|| PathBuf::from("/dev/fb0")),
            log_level: args
                .log_level
                .clone()
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
            user_agent: file
                .http_user_agent
                .unwrap_or_else(|| format!("inknode/{}", env!("CARGO_PKG_VERSION"))),
            idle_timeout,
            suspend_enabled: file.suspend_enabled.unwrap_or(true),
            token: file.token.filter(|t| !t.is_empty()),
            password: file.password.filter(|p| !p.is_empty()),
        })
    }

    pub fn gateway_url(&self) -> String {
        let scheme = if self.gateway_tls { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}{}",
            self.gateway, self.gateway_port, self.gateway_path
        )
    }

    pub fn identity_path(&self) -> PathBuf {
        self.state_dir.join("device-identity.json")
    }

    pub fn device_token_path(&self) -> PathBuf {
        self.state_dir.join("device-token.json")
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(FileConfig::default()),
        Err(err) => return Err(err.into()),
    };
    Ok(serde_json::from_slice(&data)?)
}
