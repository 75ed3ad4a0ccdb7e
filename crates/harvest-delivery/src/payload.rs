//! Collector wire payload.
//!
//! The collector accepts a positional JSON array:
//!
//! ```text
//! [ [token_a, token_b],          data token pair
//!   [os, os_version, arch, ...], device descriptor
//!   0,                           session duration placeholder
//!   [], [], [], [], [],          non-event telemetry kinds (unused)
//!   {},                          custom metrics (unused)
//!   [ {event}, {event}, ... ] ]  the batch
//! ```

use crate::{DataToken, DeliveryError, DeliveryResult};
use flate2::write::GzEncoder;
use flate2::Compression;
use harvest_config_and_utils::{AppIdentity, DeviceIdentity, Event, AGENT_NAME, AGENT_VERSION};
use serde_json::{json, Value};
use std::io::Write;

/// Batches with more events than this are gzip-compressed.
pub const GZIP_THRESHOLD: usize = 10;

/// Application and device identity sent with every request.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub app: AppIdentity,
    pub device: DeviceIdentity,
}

impl DeviceDescriptor {
    pub fn new(app: AppIdentity, device: DeviceIdentity) -> Self {
        Self { app, device }
    }

    /// `[appName, appVersion, packageName]`
    pub fn app_array(&self) -> Value {
        json!([self.app.name, self.app.version, self.app.package])
    }

    /// `[os, osVersion, arch, agentName, agentVersion, deviceId, "", "", manufacturer, {..}]`
    pub fn device_array(&self) -> Value {
        let device = &self.device;
        json!([
            device.os_name,
            device.os_version,
            device.architecture,
            AGENT_NAME,
            AGENT_VERSION,
            device.device_id,
            "",
            "",
            device.manufacturer,
            {
                "size": device.form_factor,
                "platform": device.platform,
                "platformVersion": device.platform_version,
            }
        ])
    }

    /// Body of a token connect request.
    pub fn connect_payload(&self) -> Value {
        json!([self.app_array(), self.device_array()])
    }
}

/// Build the harvest payload for one batch.
pub fn build_payload(token: &DataToken, descriptor: &DeviceDescriptor, events: &[Event]) -> Value {
    json!([
        token.pair(),
        descriptor.device_array(),
        0,
        [],
        [],
        [],
        [],
        [],
        {},
        events,
    ])
}

/// Request body bytes plus whether they are gzip-encoded.
#[derive(Debug)]
pub struct EncodedBody {
    pub bytes: Vec<u8>,
    pub gzipped: bool,
}

/// Serialize a payload, compressing when the batch is larger than `gzip_threshold` events.
pub fn encode_body(payload: &Value, event_count: usize, gzip_threshold: usize) -> DeliveryResult<EncodedBody> {
    let json = serde_json::to_vec(payload)?;
    if event_count <= gzip_threshold {
        return Ok(EncodedBody {
            bytes: json,
            gzipped: false,
        });
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| DeliveryError::Payload(format!("gzip write failed: {}", e)))?;
    let bytes = encoder
        .finish()
        .map_err(|e| DeliveryError::Payload(format!("gzip finish failed: {}", e)))?;

    Ok(EncodedBody {
        bytes,
        gzipped: true,
    })
}
