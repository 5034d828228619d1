use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::site::{Device, DeviceKind, SiteConfig};
use crate::types::{ActuationResult, Decision, DeviceState};

/// Device backend seam. Production uses webhooks; tests use fakes.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn apply(&self, device: &Device, state: &DeviceState, decision_id: &str) -> Result<()>;
}

/// Walk the site's devices in configured order and push only the commands
/// that differ from the last known applied state. One failing device does
/// not stop the rest; its previous state (or the request, when nothing was
/// known before) is recorded as still in effect.
pub async fn actuate_diff(
    site: &SiteConfig,
    actuator: &dyn Actuator,
    decision: &Decision,
    decision_id: &str,
    last_applied: Option<&BTreeMap<String, DeviceState>>,
    dry_run: bool,
) -> ActuationResult {
    let mut applied: BTreeMap<String, DeviceState> = BTreeMap::new();
    let mut errors: Vec<String> = Vec::new();

    for device in &site.devices {
        let requested = match decision.actions.get(&device.id) {
            Some(state) => *state,
            None => {
                // Validation upstream should make this unreachable.
                errors.push(format!("{}: no action in decision", device.id));
                continue;
            }
        };

        let previous = last_applied.and_then(|m| m.get(&device.id)).copied();
        if let Some(prev) = previous {
            if prev.same_state(&requested) {
                debug!(device = %device.id, "state unchanged, skipping actuation");
                applied.insert(device.id.clone(), requested);
                continue;
            }
        }

        if dry_run {
            info!(device = %device.id, state = %requested.describe(), "dry-run: would actuate");
            applied.insert(device.id.clone(), requested);
            continue;
        }

        match actuator.apply(device, &requested, decision_id).await {
            Ok(()) => {
                info!(device = %device.id, state = %requested.describe(), "actuated");
                applied.insert(device.id.clone(), requested);
            }
            Err(e) => {
                warn!(device = %device.id, error = %e, "actuation failed");
                errors.push(format!("{}: {}", device.id, e));
                applied.insert(device.id.clone(), previous.unwrap_or(requested));
            }
        }
    }

    let actuation_ok = errors.is_empty();
    ActuationResult {
        applied,
        errors,
        actuation_ok,
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    kind: &'static str,
    device: &'a str,
    state: &'a DeviceState,
    decision_id: &'a str,
}

/// Pushes device commands to per-kind webhook endpoints.
pub struct WebhookActuator {
    client: reqwest::Client,
    transom_url: Option<String>,
    transom_token: Option<String>,
    plug_url: Option<String>,
    plug_token: Option<String>,
}

impl WebhookActuator {
    pub fn new(
        transom_url: Option<String>,
        transom_token: Option<String>,
        plug_url: Option<String>,
        plug_token: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            transom_url,
            transom_token,
            plug_url,
            plug_token,
        }
    }

    fn endpoint_for(&self, kind: DeviceKind) -> (Option<&String>, Option<&String>, &'static str) {
        match kind {
            DeviceKind::Transom => (
                self.transom_url.as_ref(),
                self.transom_token.as_ref(),
                "vornado_transom_ae",
            ),
            DeviceKind::Plug => (
                self.plug_url.as_ref(),
                self.plug_token.as_ref(),
                "meross_smart_plug",
            ),
        }
    }
}

#[async_trait]
impl Actuator for WebhookActuator {
    async fn apply(&self, device: &Device, state: &DeviceState, decision_id: &str) -> Result<()> {
        let (url, token, wire_kind) = self.endpoint_for(device.kind);
        let url = url.with_context(|| format!("no webhook configured for {:?}", device.kind))?;

        let payload = WebhookPayload {
            kind: wire_kind,
            device: &device.id,
            state,
            decision_id,
        };

        let mut req = self.client.post(url).json(&payload);
        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow::anyhow!("webhook request timed out")
            } else {
                anyhow::anyhow!("webhook request failed: {e}")
            }
        })?;

        if !response.status().is_success() {
            bail!("webhook returned {}", response.status());
        }
        Ok(())
    }
}
