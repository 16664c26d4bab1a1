//! Node registration advertised during the connect handshake.

use inknode_protocol::ClientInfo;

/// Commands serviced by the canvas capability, exactly as advertised.
pub const CANVAS_COMMANDS: [&str; 8] = [
    "canvas.present",
    "canvas.hide",
    "canvas.navigate",
    "canvas.eval",
    "canvas.snapshot",
    "canvas.a2ui.push",
    "canvas.a2ui.pushJSONL",
    "canvas.a2ui.reset",
];

#[derive(Debug, Clone, Default)]
pub struct NodeRegistration {
    pub client: ClientInfo,
    pub role: String,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub permissions: Option<serde_json::Map<String, serde_json::Value>>,
    pub path_env: Option<String>,
    pub scopes: Vec<String>,
    pub locale: Option<String>,
    pub user_agent: Option<String>,
}

pub fn default_registration() -> NodeRegistration {
    NodeRegistration {
        client: ClientInfo {
            id: "inknode".into(),
            display_name: Some("Kobo".into()),
            version: env!("CARGO_PKG_VERSION").into(),
            platform: "linux".into(),
            device_family: Some("kobo".into()),
            model_identifier: None,
            mode: "node".into(),
            instance_id: None,
        },
        role: "node".into(),
        caps: vec!["canvas".into()],
        commands: CANVAS_COMMANDS.iter().map(|c| c.to_string()).collect(),
        permissions: None,
        path_env: None,
        scopes: Vec::new(),
        locale: None,
        user_agent: None,
    }
}
