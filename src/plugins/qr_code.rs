//! QR code generation.
//!
//! Synchronous: encoding and rendering are cheap enough to answer inline.
//! Payload builders cover plain text, urls, email, phone, wifi network
//! credentials and vCard contacts; colors are validated six-digit hex.

use std::io::Cursor;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use image::{ImageOutputFormat, Rgba, RgbaImage};
use qrcode::{Color, QrCode};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::ToolError;
use crate::plugins::{bool_or, opt_str, require_str};
use crate::registry::{
    FunctionSpec, Invocation, InvokeContext, ParamSpec, ParamType, Plugin, PluginDescriptor,
};

/// Pixels per module.
const MODULE_SIZE: u32 = 8;
/// Quiet zone, in modules, on each side.
const QUIET_ZONE: u32 = 4;

pub struct QrCodePlugin;

fn parse_hex_color(param: &str, value: &str) -> Result<Rgba<u8>, ToolError> {
    let hex = value.strip_prefix('#').ok_or_else(|| {
        ToolError::invalid_argument(param, "expected a hex color like #1a2b3c")
    })?;
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ToolError::invalid_argument(
            param,
            "expected a hex color like #1a2b3c",
        ));
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).unwrap_or(0);
    Ok(Rgba([channel(0), channel(2), channel(4), 255]))
}

/// Escape the characters the wifi payload format reserves.
fn wifi_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ';' | ',' | ':' | '"') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn build_payload(qr_type: &str, content: &str) -> String {
    match qr_type {
        "url" => {
            if content.starts_with("http://") || content.starts_with("https://") {
                content.to_string()
            } else {
                format!("https://{content}")
            }
        }
        "email" => format!("mailto:{content}"),
        "phone" => format!("tel:{content}"),
        _ => content.to_string(),
    }
}

fn build_wifi_payload(ssid: &str, password: &str, encryption: &str, hidden: bool) -> String {
    format!(
        "WIFI:T:{};S:{};P:{};H:{};;",
        encryption,
        wifi_escape(ssid),
        wifi_escape(password),
        hidden
    )
}

fn build_vcard_payload(args: &Map<String, Value>) -> Result<String, ToolError> {
    let name = require_str(args, "name")?;
    let mut lines = vec![
        "BEGIN:VCARD".to_string(),
        "VERSION:3.0".to_string(),
        format!("FN:{name}"),
    ];
    if let Some(phone) = opt_str(args, "phone") {
        lines.push(format!("TEL:{phone}"));
    }
    if let Some(email) = opt_str(args, "email") {
        lines.push(format!("EMAIL:{email}"));
    }
    if let Some(org) = opt_str(args, "organization") {
        lines.push(format!("ORG:{org}"));
    }
    if let Some(title) = opt_str(args, "title") {
        lines.push(format!("TITLE:{title}"));
    }
    if let Some(website) = opt_str(args, "website") {
        lines.push(format!("URL:{website}"));
    }
    lines.push("END:VCARD".to_string());
    Ok(lines.join("\n"))
}

fn render(payload: &str, fill: Rgba<u8>, back: Rgba<u8>) -> Result<(Vec<u8>, u32), ToolError> {
    let code = QrCode::new(payload.as_bytes())
        .map_err(|e| ToolError::invalid_argument("content", format!("cannot encode: {e}")))?;
    let modules = code.width() as u32;
    let colors = code.to_colors();

    let size = (modules + 2 * QUIET_ZONE) * MODULE_SIZE;
    let mut img = RgbaImage::from_pixel(size, size, back);
    for (i, color) in colors.iter().enumerate() {
        if *color != Color::Dark {
            continue;
        }
        let mx = (i as u32 % modules + QUIET_ZONE) * MODULE_SIZE;
        let my = (i as u32 / modules + QUIET_ZONE) * MODULE_SIZE;
        for dy in 0..MODULE_SIZE {
            for dx in 0..MODULE_SIZE {
                img.put_pixel(mx + dx, my + dy, fill);
            }
        }
    }

    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)
        .map_err(|e| ToolError::Internal(format!("png encode failed: {e}")))?;
    Ok((png, size))
}

fn result_json(qr_type: &str, payload: &str, png: Vec<u8>, size: u32) -> Value {
    let qr_id = Uuid::new_v4();
    json!({
        "qr_id": qr_id,
        "filename": format!("qr_{}.png", qr_id.simple()),
        "qr_type": qr_type,
        "payload": payload,
        "size_px": size,
        "image_base64": BASE64.encode(&png),
        "generated_at": Utc::now().to_rfc3339(),
    })
}

#[async_trait]
impl Plugin for QrCodePlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: "qr_code",
            description: "Generates QR code images for text, links, wifi and contacts",
            functions: vec![
                FunctionSpec {
                    name: "generate_qr_code",
                    description: "Generate a QR code from text, a url, an email address or a phone number",
                    params: vec![
                        ParamSpec::required("content", ParamType::String, "What the code should encode"),
                        ParamSpec::optional("qr_type", ParamType::String, "How to interpret the content")
                            .with_default(json!("text"))
                            .with_one_of(vec!["text", "url", "email", "phone"]),
                        ParamSpec::optional("fill_color", ParamType::String, "Module color, hex")
                            .with_default(json!("#000000")),
                        ParamSpec::optional("back_color", ParamType::String, "Background color, hex")
                            .with_default(json!("#FFFFFF")),
                    ],
                },
                FunctionSpec {
                    name: "generate_wifi_qr",
                    description: "Generate a QR code that joins a wifi network when scanned",
                    params: vec![
                        ParamSpec::required("ssid", ParamType::String, "Network name"),
                        ParamSpec::optional("password", ParamType::String, "Network password")
                            .with_default(json!("")),
                        ParamSpec::optional("encryption", ParamType::String, "Security type")
                            .with_default(json!("WPA"))
                            .with_one_of(vec!["WPA", "WEP", "nopass"]),
                        ParamSpec::optional("hidden", ParamType::Boolean, "Whether the SSID is hidden")
                            .with_default(json!(false)),
                    ],
                },
                FunctionSpec {
                    name: "generate_vcard_qr",
                    description: "Generate a QR code carrying a contact card",
                    params: vec![
                        ParamSpec::required("name", ParamType::String, "Full name"),
                        ParamSpec::optional("phone", ParamType::String, "Phone number"),
                        ParamSpec::optional("email", ParamType::String, "Email address"),
                        ParamSpec::optional("organization", ParamType::String, "Company or organization"),
                        ParamSpec::optional("title", ParamType::String, "Job title"),
                        ParamSpec::optional("website", ParamType::String, "Website url"),
                    ],
                },
            ],
        }
    }

    async fn invoke(
        &self,
        _ctx: &InvokeContext,
        function: &str,
        args: Map<String, Value>,
    ) -> Result<Invocation, ToolError> {
        let fill = parse_hex_color("fill_color", opt_str(&args, "fill_color").unwrap_or("#000000"))?;
        let back = parse_hex_color("back_color", opt_str(&args, "back_color").unwrap_or("#FFFFFF"))?;

        let (qr_type, payload) = match function {
            "generate_qr_code" => {
                let content = require_str(&args, "content")?;
                if content.is_empty() {
                    return Err(ToolError::invalid_argument("content", "must not be empty"));
                }
                let qr_type = opt_str(&args, "qr_type").unwrap_or("text").to_string();
                let payload = build_payload(&qr_type, content);
                (qr_type, payload)
            }
            "generate_wifi_qr" => {
                let ssid = require_str(&args, "ssid")?;
                if ssid.is_empty() {
                    return Err(ToolError::invalid_argument("ssid", "must not be empty"));
                }
                let password = opt_str(&args, "password").unwrap_or("");
                let encryption = opt_str(&args, "encryption").unwrap_or("WPA");
                let hidden = bool_or(&args, "hidden", false)?;
                (
                    "wifi".to_string(),
                    build_wifi_payload(ssid, password, encryption, hidden),
                )
            }
            "generate_vcard_qr" => ("vcard".to_string(), build_vcard_payload(&args)?),
            other => return Err(ToolError::UnknownFunction(other.to_string())),
        };

        let (png, size) = render(&payload, fill, back)?;
        Ok(Invocation::Immediate(result_json(&qr_type, &payload, png, size)))
    }
}
