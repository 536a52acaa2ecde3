//! QR rendering for pairing codes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use qrcode::{
    render::{svg, unicode},
    EcLevel, QrCode,
};

use crate::{errors::Error, Result};

const QR_MIN_SIZE: u32 = 256;

fn encode(code: &str) -> Result<QrCode> {
    QrCode::with_error_correction_level(code.as_bytes(), EcLevel::M)
        .map_err(|e| Error::Pairing(format!("qr encode failed: {e}")))
}

/// Encode a pairing code as an SVG image wrapped in a `data:` URL, ready for the
/// tenant's QR field.
pub fn qr_data_url(code: &str) -> Result<String> {
    let image = encode(code)?
        .render::<svg::Color>()
        .min_dimensions(QR_MIN_SIZE, QR_MIN_SIZE)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();
    Ok(format!(
        "data:image/svg+xml;base64,{}",
        STANDARD.encode(image.as_bytes())
    ))
}

/// Half-block rendering for console logs.
pub fn terminal_qr(code: &str) -> Result<String> {
    Ok(encode(code)?
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}
