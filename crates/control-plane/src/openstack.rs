//! OpenStack compute client.
//!
//! Implements [`ComputeApi`] against Identity v3 (password auth, service
//! catalog) and Compute v2.1. The token is fetched lazily and refreshed once
//! when a request comes back `401`.

use std::collections::HashMap;

use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use vmprobe_core::metrics as m;
use vmprobe_core::types::{
    Flavor, FloatingIp, ImageInfo, Instance, Keypair, PowerAction, PowerState, RuleDirection,
    SecurityGroup, SecurityGroupRule,
};

use crate::api::{ComputeApi, ServerCreateRequest};
use crate::config::ControlPlaneSettings;
use crate::error::ControlPlaneError;

const FAULT_MESSAGE_LIMIT: usize = 300;

#[derive(Clone)]
struct AuthSession {
    token: String,
    compute_url: String,
}

/// Compute v2.1 client authenticated through Identity v3.
pub struct OpenStackClient {
    http: Client,
    settings: ControlPlaneSettings,
    session: RwLock<Option<AuthSession>>,
}

impl OpenStackClient {
    /// Builds a client. No request is sent until the first call.
    pub fn new(settings: ControlPlaneSettings) -> Result<Self, ControlPlaneError> {
        settings.validate()?;
        let http = Client::builder().timeout(settings.request_timeout).build()?;
        Ok(Self {
            http,
            settings,
            session: RwLock::new(None),
        })
    }

    /// Fetches a fresh token and compute endpoint.
    pub async fn authenticate(&self) -> Result<(), ControlPlaneError> {
        let session = self.request_token().await?;
        *self.session.write().await = Some(session);
        Ok(())
    }

    async fn request_token(&self) -> Result<AuthSession, ControlPlaneError> {
        let url = format!("{}/auth/tokens", self.settings.auth_url);
        let response = self
            .http
            .post(&url)
            .json(&token_request_body(&self.settings))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Auth(format!(
                "HTTP {}: {}",
                status.as_u16(),
                fault_message(&text)
            )));
        }

        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| ControlPlaneError::Auth("missing X-Subject-Token header".to_owned()))?;
        let body: TokenResponse = response.json().await?;
        let compute_url = select_endpoint(&body.token.catalog, "compute", &self.settings.region)
            .ok_or_else(|| {
                ControlPlaneError::Auth("no public compute endpoint in service catalog".to_owned())
            })?;

        info!(compute_url = %compute_url, user = %self.settings.username, "authenticated");
        Ok(AuthSession { token, compute_url })
    }

    async fn session(&self) -> Result<AuthSession, ControlPlaneError> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(session.clone());
        }
        let session = self.request_token().await?;
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    /// Sends one compute request and returns the response body.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        resource: &str,
        id: &str,
    ) -> Result<String, ControlPlaneError> {
        let mut reauthenticated = false;
        loop {
            let session = self.session().await?;
            let url = format!("{}{}", session.compute_url, path);
            debug!(method = %method, url = %url, "compute request");

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("X-Auth-Token", &session.token)
                .header("Accept", "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    metrics::counter!(m::CONTROL_PLANE_REQUESTS_TOTAL, m::LABEL_RESULT => "failure")
                        .increment(1);
                    return Err(e.into());
                }
            };
            let status = response.status();
            let text = response.text().await?;

            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                warn!("token rejected, re-authenticating");
                *self.session.write().await = None;
                reauthenticated = true;
                continue;
            }

            let label = if status.is_success() { "success" } else { "failure" };
            metrics::counter!(m::CONTROL_PLANE_REQUESTS_TOTAL, m::LABEL_RESULT => label)
                .increment(1);
            check_status(status, &text, resource, id)?;
            return Ok(text);
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        resource: &str,
        id: &str,
    ) -> Result<T, ControlPlaneError> {
        let text = self.send(method, path, body, resource, id).await?;
        serde_json::from_str(&text)
            .map_err(|e| ControlPlaneError::Decode(format!("{resource} response: {e}")))
    }

    async fn server_action_raw(
        &self,
        server_id: &str,
        body: &Value,
    ) -> Result<String, ControlPlaneError> {
        self.send(
            Method::POST,
            &format!("/servers/{server_id}/action"),
            Some(body),
            "server",
            server_id,
        )
        .await
    }
}

impl ComputeApi for OpenStackClient {
    async fn create_keypair(&self, name: &str) -> Result<Keypair, ControlPlaneError> {
        let body = json!({ "keypair": { "name": name } });
        let envelope: KeypairEnvelope = self
            .send_json(Method::POST, "/os-keypairs", Some(&body), "keypair", name)
            .await?;
        Ok(envelope.keypair.into())
    }

    async fn delete_keypair(&self, name: &str) -> Result<(), ControlPlaneError> {
        self.send(
            Method::DELETE,
            &format!("/os-keypairs/{name}"),
            None,
            "keypair",
            name,
        )
        .await
        .map(drop)
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
    ) -> Result<SecurityGroup, ControlPlaneError> {
        let body = json!({ "security_group": { "name": name, "description": description } });
        let envelope: SecurityGroupEnvelope = self
            .send_json(
                Method::POST,
                "/os-security-groups",
                Some(&body),
                "security group",
                name,
            )
            .await?;
        Ok(SecurityGroup {
            id: value_to_id(&envelope.security_group.id),
            name: envelope.security_group.name,
            rules: Vec::new(),
        })
    }

    async fn add_security_group_rule(
        &self,
        group_id: &str,
        rule: &SecurityGroupRule,
    ) -> Result<(), ControlPlaneError> {
        if rule.direction == RuleDirection::Egress {
            return Err(ControlPlaneError::Unsupported(
                "os-security-group-rules only accepts ingress rules".to_owned(),
            ));
        }
        let body = json!({
            "security_group_rule": {
                "parent_group_id": group_id,
                "ip_protocol": rule.protocol,
                "from_port": rule.from_port,
                "to_port": rule.to_port,
                "cidr": rule.cidr,
            }
        });
        self.send(
            Method::POST,
            "/os-security-group-rules",
            Some(&body),
            "security group",
            group_id,
        )
        .await
        .map(drop)
    }

    async fn delete_security_group(&self, id: &str) -> Result<(), ControlPlaneError> {
        self.send(
            Method::DELETE,
            &format!("/os-security-groups/{id}"),
            None,
            "security group",
            id,
        )
        .await
        .map(drop)
    }

    async fn create_server(
        &self,
        request: &ServerCreateRequest,
    ) -> Result<Instance, ControlPlaneError> {
        let groups: Vec<Value> = request
            .security_groups
            .iter()
            .map(|name| json!({ "name": name }))
            .collect();
        let body = json!({
            "server": {
                "name": request.name,
                "imageRef": request.image_ref,
                "flavorRef": request.flavor_ref,
                "key_name": request.key_name,
                "security_groups": groups,
            }
        });
        let envelope: ServerEnvelope = self
            .send_json(Method::POST, "/servers", Some(&body), "server", &request.name)
            .await?;
        let mut instance = envelope.server.into_instance();
        if instance.name.is_empty() {
            instance.name = request.name.clone();
        }
        Ok(instance)
    }

    async fn get_server(&self, id: &str) -> Result<Instance, ControlPlaneError> {
        let envelope: ServerEnvelope = self
            .send_json(Method::GET, &format!("/servers/{id}"), None, "server", id)
            .await?;
        Ok(envelope.server.into_instance())
    }

    async fn delete_server(&self, id: &str) -> Result<(), ControlPlaneError> {
        self.send(Method::DELETE, &format!("/servers/{id}"), None, "server", id)
            .await
            .map(drop)
    }

    async fn server_action(&self, id: &str, action: PowerAction) -> Result<(), ControlPlaneError> {
        self.server_action_raw(id, &action_body(action))
            .await
            .map(drop)
    }

    async fn allocate_floating_ip(&self, pool: &str) -> Result<FloatingIp, ControlPlaneError> {
        let body = json!({ "pool": pool });
        let envelope: FloatingIpEnvelope = self
            .send_json(
                Method::POST,
                "/os-floating-ips",
                Some(&body),
                "floating ip pool",
                pool,
            )
            .await?;
        let wire = envelope.floating_ip;
        Ok(FloatingIp {
            id: value_to_id(&wire.id),
            address: wire.ip,
            pool: wire.pool.unwrap_or_else(|| pool.to_owned()),
            instance_id: wire.instance_id,
        })
    }

    async fn associate_floating_ip(
        &self,
        server_id: &str,
        address: &str,
    ) -> Result<(), ControlPlaneError> {
        let body = json!({ "addFloatingIp": { "address": address } });
        self.server_action_raw(server_id, &body).await.map(drop)
    }

    async fn release_floating_ip(&self, id: &str) -> Result<(), ControlPlaneError> {
        self.send(
            Method::DELETE,
            &format!("/os-floating-ips/{id}"),
            None,
            "floating ip",
            id,
        )
        .await
        .map(drop)
    }

    async fn get_flavor(&self, id: &str) -> Result<Flavor, ControlPlaneError> {
        let envelope: FlavorEnvelope = self
            .send_json(Method::GET, &format!("/flavors/{id}"), None, "flavor", id)
            .await?;
        Ok(Flavor {
            id: value_to_id(&envelope.flavor.id),
            ram_mb: envelope.flavor.ram,
            disk_gb: envelope.flavor.disk,
        })
    }

    async fn get_image(&self, id: &str) -> Result<ImageInfo, ControlPlaneError> {
        let envelope: ImageEnvelope = self
            .send_json(Method::GET, &format!("/images/{id}"), None, "image", id)
            .await?;
        Ok(ImageInfo {
            id: envelope.image.id,
            min_ram_mb: envelope.image.min_ram,
            min_disk_gb: envelope.image.min_disk,
        })
    }

    async fn console_output(&self, server_id: &str, lines: u32) -> Result<String, ControlPlaneError> {
        let body = json!({ "os-getConsoleOutput": { "length": lines } });
        let text = self.server_action_raw(server_id, &body).await?;
        let console: ConsoleOutput = serde_json::from_str(&text)
            .map_err(|e| ControlPlaneError::Decode(format!("console output: {e}")))?;
        Ok(console.output)
    }
}

// --- request/response helpers ---

fn token_request_body(settings: &ControlPlaneSettings) -> Value {
    json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": settings.username,
                        "domain": { "name": settings.user_domain },
                        "password": settings.password,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": settings.project_name,
                    "domain": { "name": settings.project_domain },
                }
            }
        }
    })
}

fn select_endpoint(catalog: &[CatalogEntry], service_type: &str, region: &str) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == service_type)
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| {
            ep.interface == "public"
                && (region.is_empty() || ep.region.as_deref() == Some(region))
        })
        .map(|ep| ep.url.trim_end_matches('/').to_owned())
}

fn action_body(action: PowerAction) -> Value {
    let key = match action {
        PowerAction::Stop => "os-stop",
        PowerAction::Start => "os-start",
        PowerAction::Pause => "pause",
        PowerAction::Unpause => "unpause",
        PowerAction::Suspend => "suspend",
        PowerAction::Resume => "resume",
        PowerAction::Save => "shelve",
        PowerAction::Unsave => "unshelve",
    };
    let mut body = serde_json::Map::new();
    body.insert(key.to_owned(), Value::Null);
    Value::Object(body)
}

fn check_status(
    status: StatusCode,
    text: &str,
    resource: &str,
    id: &str,
) -> Result<(), ControlPlaneError> {
    if status.is_success() {
        return Ok(());
    }
    Err(match status {
        StatusCode::UNAUTHORIZED => ControlPlaneError::Auth(fault_message(text)),
        StatusCode::NOT_FOUND => ControlPlaneError::NotFound {
            resource: resource.to_owned(),
            id: id.to_owned(),
        },
        StatusCode::CONFLICT => ControlPlaneError::Conflict(fault_message(text)),
        other => ControlPlaneError::Api {
            status: other.as_u16(),
            message: fault_message(text),
        },
    })
}

/// Extracts the human-readable message from a fault body.
///
/// Compute faults look like `{"badRequest": {"message": ..., "code": 400}}`,
/// identity faults like `{"error": {"message": ...}}`.
fn fault_message(text: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        if let Some(Value::String(message)) = map.get("message") {
            return message.clone();
        }
        for value in map.values() {
            if let Some(Value::String(message)) = value.get("message") {
                return message.clone();
            }
        }
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "empty response body".to_owned();
    }
    trimmed.chars().take(FAULT_MESSAGE_LIMIT).collect()
}

fn value_to_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// --- wire types ---

#[derive(Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Deserialize)]
struct Endpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    url: String,
}

#[derive(Deserialize)]
struct KeypairEnvelope {
    keypair: WireKeypair,
}

#[derive(Deserialize)]
struct WireKeypair {
    name: String,
    #[serde(default)]
    public_key: String,
    #[serde(default)]
    private_key: Option<String>,
    #[serde(default)]
    fingerprint: String,
}

impl From<WireKeypair> for Keypair {
    fn from(wire: WireKeypair) -> Self {
        Self {
            name: wire.name,
            public_key: wire.public_key,
            private_key: wire.private_key,
            fingerprint: wire.fingerprint,
        }
    }
}

#[derive(Deserialize)]
struct SecurityGroupEnvelope {
    security_group: WireSecurityGroup,
}

#[derive(Deserialize)]
struct WireSecurityGroup {
    id: Value,
    name: String,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: WireServer,
}

#[derive(Deserialize)]
struct WireServer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(rename = "OS-EXT-SRV-ATTR:host", default)]
    host: Option<String>,
    #[serde(rename = "OS-EXT-SRV-ATTR:instance_name", default)]
    instance_name: Option<String>,
    #[serde(default)]
    key_name: Option<String>,
    #[serde(default)]
    security_groups: Vec<NamedRef>,
    #[serde(default)]
    addresses: HashMap<String, Vec<WireAddress>>,
}

#[derive(Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Deserialize)]
struct WireAddress {
    addr: String,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    kind: Option<String>,
}

impl WireServer {
    fn into_instance(self) -> Instance {
        let floating_ip = self
            .addresses
            .values()
            .flatten()
            .find(|a| a.kind.as_deref() == Some("floating"))
            .map(|a| a.addr.clone());
        let state = if self.status.is_empty() {
            PowerState::Building
        } else {
            PowerState::from_status(&self.status)
        };
        Instance {
            id: self.id,
            name: self.name,
            host: self.host.unwrap_or_default(),
            hypervisor_name: self.instance_name.unwrap_or_default(),
            state,
            raw_status: self.status,
            key_name: self.key_name,
            security_groups: self.security_groups.into_iter().map(|g| g.name).collect(),
            floating_ip,
        }
    }
}

#[derive(Deserialize)]
struct FloatingIpEnvelope {
    floating_ip: WireFloatingIp,
}

#[derive(Deserialize)]
struct WireFloatingIp {
    id: Value,
    ip: String,
    #[serde(default)]
    pool: Option<String>,
    #[serde(default)]
    instance_id: Option<String>,
}

#[derive(Deserialize)]
struct FlavorEnvelope {
    flavor: WireFlavor,
}

#[derive(Deserialize)]
struct WireFlavor {
    id: Value,
    #[serde(default)]
    ram: u64,
    #[serde(default)]
    disk: u64,
}

#[derive(Deserialize)]
struct ImageEnvelope {
    image: WireImage,
}

#[derive(Deserialize)]
struct WireImage {
    id: String,
    #[serde(rename = "minRam", default)]
    min_ram: u64,
    #[serde(rename = "minDisk", default)]
    min_disk: u64,
}

#[derive(Deserialize)]
struct ConsoleOutput {
    output: String,
}
