use serde::{Deserialize, Serialize};

/// The parts of a DID document this service reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    pub id: String,
    #[serde(default)]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub service: Vec<DidService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub service_endpoint: String,
}

impl DidDocument {
    /// Handle claimed by the document (`at://<handle>` alias), unverified.
    pub fn handle(&self) -> Option<&str> {
        self.also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
            .filter(|handle| !handle.is_empty())
    }

    /// Repository (PDS) endpoint of the account.
    pub fn pds_endpoint(&self) -> Option<&str> {
        self.service
            .iter()
            .find(|s| {
                s.id.ends_with("#atproto_pds") && s.service_type == "AtprotoPersonalDataServer"
            })
            .map(|s| s.service_endpoint.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plc_document() {
        let json = r##"{
            "@context": ["https://www.w3.org/ns/did/v1"],
            "id": "did:plc:ewvi7nxzyoun6zhxrhs64oiz",
            "alsoKnownAs": ["at://atproto.com"],
            "verificationMethod": [],
            "service": [{
                "id": "#atproto_pds",
                "type": "AtprotoPersonalDataServer",
                "serviceEndpoint": "https://enoki.us-east.host.bsky.network/"
            }]
        }"##;
        let doc: DidDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.handle(), Some("atproto.com"));
        assert_eq!(doc.pds_endpoint(), Some("https://enoki.us-east.host.bsky.network"));
    }

    #[test]
    fn test_document_without_handle_or_pds() {
        let doc: DidDocument = serde_json::from_str(r#"{"id": "did:web:example.com"}"#).unwrap();
        assert_eq!(doc.handle(), None);
        assert_eq!(doc.pds_endpoint(), None);
    }
}
