use anyhow::{Result, bail};
use base64::Engine;
use base64::alphabet::URL_SAFE;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use once_cell::sync::Lazy;
use uuid::Uuid;

const RUN_ID_LEN_BYTES: usize = 16;

// Unpadded URL-safe so ids can appear in file names and log prefixes as-is.
static RUN_ID_ENGINE: Lazy<GeneralPurpose> = Lazy::new(|| {
    GeneralPurpose::new(
        &URL_SAFE,
        GeneralPurposeConfig::new()
            .with_encode_padding(false)
            .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent),
    )
});

/// Fresh run id for this daemon process.
pub fn generate() -> String {
    encode_uuid(Uuid::new_v4())
}

pub fn encode_uuid(uuid: Uuid) -> String {
    RUN_ID_ENGINE.encode(uuid.as_bytes())
}

/// Accepts an id handed in by a supervisor and returns it in canonical form.
pub fn parse_run_id(input: &str) -> Result<String> {
    let trimmed = input.trim();
    let decoded = match RUN_ID_ENGINE.decode(trimmed) {
        Ok(bytes) => bytes,
        Err(e) => bail!("invalid base64 run id '{trimmed}': {e}"),
    };
    if decoded.len() != RUN_ID_LEN_BYTES {
        bail!(
            "invalid run id length: expected {} bytes, got {}",
            RUN_ID_LEN_BYTES,
            decoded.len()
        );
    }
    Ok(RUN_ID_ENGINE.encode(decoded))
}
