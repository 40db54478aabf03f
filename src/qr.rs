// QR payload encoding. The raw pairing string from the chat client is
// rendered as a PNG and shipped to HTTP callers base64-encoded.
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{GrayImage, Luma};
use qrcode::{Color, EcLevel, QrCode};
use serde::Serialize;
use std::io::Cursor;

const MODULE_SCALE: u32 = 4;
const QUIET_MODULES: u32 = 2;

#[derive(Debug, Clone, Serialize)]
pub struct QrImage {
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub base64: String,
}

pub fn encode_qr_png(raw: &str) -> Result<QrImage> {
    let code = QrCode::with_error_correction_level(raw.as_bytes(), EcLevel::M)
        .context("qr encode failed")?;
    let modules = code.width() as u32;
    let dim = (modules + 2 * QUIET_MODULES) * MODULE_SCALE;
    let mut img = GrayImage::from_pixel(dim, dim, Luma([0xFF]));

    for y in 0..code.width() {
        for x in 0..code.width() {
            if code[(x, y)] != Color::Dark {
                continue;
            }
            let px = (x as u32 + QUIET_MODULES) * MODULE_SCALE;
            let py = (y as u32 + QUIET_MODULES) * MODULE_SCALE;
            for dy in 0..MODULE_SCALE {
                for dx in 0..MODULE_SCALE {
                    img.put_pixel(px + dx, py + dy, Luma([0x00]));
                }
            }
        }
    }

    let mut buffer = Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut buffer, image::ImageFormat::Png)
        .context("qr png write failed")?;

    Ok(QrImage {
        content_type: "image/png".to_string(),
        base64: STANDARD.encode(buffer.into_inner()),
    })
}
