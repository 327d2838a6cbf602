//! Wire shapes for the reader backend protocol.
//!
//! Four POST-only JSON RPCs: `getNonce`, `register`, `certifyKeys`,
//! `getIssuerList`. Binary fields travel as URL-safe base64 without padding.

use p256::elliptic_curve::JwkEcKey;
use serde::{Deserialize, Serialize};

use crate::trust::IssuerList;

pub const METHOD_GET_NONCE: &str = "getNonce";
pub const METHOD_REGISTER: &str = "register";
pub const METHOD_CERTIFY_KEYS: &str = "certifyKeys";
pub const METHOD_GET_ISSUER_LIST: &str = "getIssuerList";

/// Unpadded URL-safe base64 helpers shared across the wire shapes.
pub mod b64 {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Encodes bytes as unpadded URL-safe base64.
    #[must_use]
    pub fn encode(bytes: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Decodes unpadded URL-safe base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64.
    pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
        URL_SAFE_NO_PAD.decode(text)
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        decode(&text).map_err(serde::de::Error::custom)
    }
}

/// [`b64`] over `Option<Vec<u8>>`.
pub mod b64_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&super::b64::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?;
        text.map(|text| super::b64::decode(&text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// A certificate chain as DER bytes, leaf first, reader root last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateChain(#[serde(with = "b64_seq")] pub Vec<Vec<u8>>);

impl CertificateChain {
    /// The leaf certificate, if the chain is non-empty.
    #[must_use]
    pub fn leaf(&self) -> Option<&[u8]> {
        self.0.first().map(Vec::as_slice)
    }
}

mod b64_seq {
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        chain: &[Vec<u8>],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(chain.len()))?;
        for der in chain {
            seq.serialize_element(&super::b64::encode(der))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let texts = Vec::<String>::deserialize(deserializer)?;
        texts
            .iter()
            .map(|text| super::b64::decode(text).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GetNonceRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetNonceResponse {
    /// 16 random bytes minted by the server, valid for five minutes.
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    /// Opaque platform attestation blob bound to `nonce` as its challenge.
    #[serde(with = "b64")]
    pub device_attestation: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub registration_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertifyKeysRequest {
    pub registration_id: String,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    /// Opaque assertion blob binding the stored attestation to `nonce`.
    #[serde(with = "b64")]
    pub device_assertion: Vec<u8>,
    /// Public keys to certify, as JWKs.
    pub keys: Vec<JwkEcKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertifyKeysResponse {
    /// One chain per submitted key, in request order.
    pub reader_certifications: Vec<CertificateChain>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetIssuerListRequest {
    /// The version the client already holds; absent requests the full list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GetIssuerListResponse {
    /// The server's list differs from the client's version.
    Update(IssuerList),
    /// The client already holds the current version.
    #[serde(rename_all = "camelCase")]
    UpToDate { up_to_date: bool },
}

impl GetIssuerListResponse {
    #[must_use]
    pub fn up_to_date() -> Self {
        Self::UpToDate { up_to_date: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{IssuerMetadata, IssuerTrustEntry};

    #[test]
    fn test_b64_is_urlsafe_and_unpadded() {
        // 0xfb 0xff forces '-'/'_' alphabet characters and a padded length.
        let encoded = b64::encode(&[0xfb, 0xff, 0x01]);
        assert_eq!(encoded, "-_8B");
        assert!(!encoded.contains('='));
        assert_eq!(b64::decode(&encoded).expect("decode"), vec![0xfb, 0xff, 0x01]);
    }

    #[test]
    fn test_register_request_field_names() {
        let request = RegisterRequest {
            nonce: vec![0u8; 16],
            device_attestation: vec![1, 2, 3],
        };
        let value = serde_json::to_value(&request).expect("serialize");
        assert!(value.get("nonce").is_some());
        assert!(value.get("deviceAttestation").is_some());
        assert!(value.get("device_attestation").is_none());
    }

    #[test]
    fn test_certify_keys_response_roundtrip() {
        let response = CertifyKeysResponse {
            reader_certifications: vec![CertificateChain(vec![vec![0x30, 0x01], vec![0x30, 0x02]])],
        };
        let value = serde_json::to_value(&response).expect("serialize");
        let chains = value["readerCertifications"].as_array().expect("array");
        assert_eq!(chains[0].as_array().expect("chain").len(), 2);
        let parsed: CertifyKeysResponse = serde_json::from_value(value).expect("deserialize");
        assert_eq!(parsed.reader_certifications, response.reader_certifications);
    }

    #[test]
    fn test_issuer_list_response_variants() {
        let up_to_date = serde_json::to_value(GetIssuerListResponse::up_to_date()).expect("ser");
        assert_eq!(up_to_date["upToDate"], true);
        let parsed: GetIssuerListResponse =
            serde_json::from_value(up_to_date).expect("deserialize");
        assert!(matches!(parsed, GetIssuerListResponse::UpToDate { up_to_date: true }));

        let update = GetIssuerListResponse::Update(IssuerList {
            version: 42,
            entries: vec![IssuerTrustEntry::Iaca {
                cert: vec![0x30],
                metadata: IssuerMetadata {
                    display_name: "Utopia DMV".to_string(),
                    display_icon: None,
                    privacy_policy_url: Some("https://utopia.example/privacy".to_string()),
                    test_only: false,
                },
            }],
        });
        let value = serde_json::to_value(&update).expect("serialize");
        assert_eq!(value["version"], 42);
        assert_eq!(value["entries"][0]["type"], "iaca");
        let parsed: GetIssuerListResponse = serde_json::from_value(value).expect("deserialize");
        assert!(matches!(parsed, GetIssuerListResponse::Update(list) if list.version == 42));
    }

    #[test]
    fn test_current_version_omitted_when_absent() {
        let value =
            serde_json::to_value(GetIssuerListRequest { current_version: None }).expect("ser");
        assert!(value.get("currentVersion").is_none());
        let value = serde_json::to_value(GetIssuerListRequest {
            current_version: Some(7),
        })
        .expect("serialize");
        assert_eq!(value["currentVersion"], 7);
    }
}
