use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;

use crate::core::assembler::Assembler;
use crate::core::error::UnitError;
use crate::core::model::InlinePayload;

/// Decodes `data:` payloads. Never touches the network.
pub struct InlineDriver;

impl InlineDriver {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, payload: &InlinePayload) -> Result<Vec<u8>, UnitError> {
        if payload.base64 {
            let cleaned: String = payload
                .data
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect();
            let cleaned = urlencoding::decode(&cleaned).map(|c| c.into_owned()).unwrap_or(cleaned);
            [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
                .iter()
                .find_map(|engine| engine.decode(cleaned.as_bytes()).ok())
                .ok_or_else(|| UnitError::Decode(format!("invalid base64 in {} payload", payload.media_type)))
        } else {
            Ok(urlencoding::decode_binary(payload.data.as_bytes()).into_owned())
        }
    }

    /// Decodes straight into the output and returns the byte count.
    pub async fn decode_to(&self, payload: &InlinePayload, out: &mut Assembler) -> Result<u64, UnitError> {
        let bytes = self.decode(payload)?;
        out.write(&bytes).await?;
        Ok(bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(raw: &str) -> InlinePayload {
        InlinePayload::parse(raw).unwrap()
    }

    #[test]
    fn decodes_base64_with_and_without_padding() {
        let d = InlineDriver::new();
        assert_eq!(d.decode(&payload("data:text/plain;base64,aGVsbG8=")).unwrap(), b"hello");
        assert_eq!(d.decode(&payload("data:text/plain;base64,aGVsbG8")).unwrap(), b"hello");
        assert_eq!(d.decode(&payload("data:image/png;base64,AAAA")).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn decodes_percent_encoded_text() {
        let d = InlineDriver::new();
        assert_eq!(d.decode(&payload("data:,hello%20world")).unwrap(), b"hello world");
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let d = InlineDriver::new();
        let r = d.decode(&payload("data:image/png;base64,@@@not base64@@@"));
        assert!(matches!(r, Err(UnitError::Decode(_))));
    }

    #[tokio::test]
    async fn decode_to_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("x.txt");
        let mut out = Assembler::create(&target).await.unwrap();
        let n = InlineDriver::new().decode_to(&payload("data:text/plain;base64,aGk="), &mut out).await.unwrap();
        assert_eq!(n, 2);
        out.commit().await.unwrap();
        assert_eq!(std::fs::read(target).unwrap(), b"hi");
    }
}
