use std::fmt;

/// `at://<did>/<collection>/<rkey>` record address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn new(did: impl Into<String>, collection: impl Into<String>, rkey: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }

    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("at://")?;
        let mut parts = rest.splitn(3, '/');
        let did = parts.next().filter(|s| !s.is_empty())?;
        let collection = parts.next().filter(|s| !s.is_empty())?;
        let rkey = parts.next().filter(|s| !s.is_empty() && !s.contains('/'))?;
        Some(Self::new(did, collection, rkey))
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse_agree() {
        let uri = AtUri::new("did:plc:abc", "xyz.statusphere.status", "3l4xyz");
        assert_eq!(uri.to_string(), "at://did:plc:abc/xyz.statusphere.status/3l4xyz");
        assert_eq!(AtUri::parse(&uri.to_string()), Some(uri));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(AtUri::parse("https://example.com/a/b"), None);
        assert_eq!(AtUri::parse("at://did:plc:abc/xyz.statusphere.status"), None);
        assert_eq!(AtUri::parse("at://did:plc:abc//rkey"), None);
        assert_eq!(AtUri::parse("at://did:plc:abc/coll/a/b"), None);
    }
}
