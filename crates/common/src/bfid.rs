//! Back-reference the packer stamps on a file record once its container is
//! verified (spec.md §3, §4.F):
//! `hsm_type://hsm_name/?store=<store>&group=<group>&bfid=<pnfsid>:<containerPnfsid>`

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bfid {
    pub hsm_type: String,
    pub hsm_name: String,
    pub store: String,
    pub group: String,
    pub pnfsid: String,
    pub container_pnfsid: String,
}

impl fmt::Display for Bfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/?store={}&group={}&bfid={}:{}",
            self.hsm_type,
            self.hsm_name,
            urlencoding::encode(&self.store),
            urlencoding::encode(&self.group),
            self.pnfsid,
            self.container_pnfsid
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BfidParseError {
    #[error("not a valid archive URL: {0}")]
    Malformed(String),
}

impl std::str::FromStr for Bfid {
    type Err = BfidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| BfidParseError::Malformed(s.to_string()))?;
        let (hsm_name, query) = rest
            .split_once("/?")
            .ok_or_else(|| BfidParseError::Malformed(s.to_string()))?;
        let mut store = None;
        let mut group = None;
        let mut bfid = None;
        for pair in query.split('&') {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| BfidParseError::Malformed(s.to_string()))?;
            match k {
                "store" => store = Some(urlencoding::decode(v).unwrap_or_default().into_owned()),
                "group" => group = Some(urlencoding::decode(v).unwrap_or_default().into_owned()),
                "bfid" => bfid = Some(v.to_string()),
                _ => {},
            }
        }
        let bfid = bfid.ok_or_else(|| BfidParseError::Malformed(s.to_string()))?;
        let (pnfsid, container_pnfsid) = bfid
            .split_once(':')
            .ok_or_else(|| BfidParseError::Malformed(s.to_string()))?;
        Ok(Bfid {
            hsm_type: scheme.to_string(),
            hsm_name: hsm_name.to_string(),
            store: store.ok_or_else(|| BfidParseError::Malformed(s.to_string()))?,
            group: group.ok_or_else(|| BfidParseError::Malformed(s.to_string()))?,
            pnfsid: pnfsid.to_string(),
            container_pnfsid: container_pnfsid.to_string(),
        })
    }
}

/// Extracts the container's pnfsid from a WebDAV `ETag` response header,
/// shaped `"<pnfsid>_<anything>"` (spec.md §4.F).
pub fn container_pnfsid_from_etag(etag: &str) -> Option<String> {
    let trimmed = etag.trim().trim_matches('"');
    trimmed.split('_').next().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_and_parses_round_trip() {
        let bfid = Bfid {
            hsm_type: "osm".into(),
            hsm_name: "example".into(),
            store: "store1".into(),
            group: "group1".into(),
            pnfsid: "ABC123".into(),
            container_pnfsid: "DEF456".into(),
        };
        let url = bfid.to_string();
        let parsed: Bfid = url.parse().unwrap();
        assert_eq!(parsed, bfid);
    }

    #[test]
    fn extracts_container_pnfsid_from_etag() {
        assert_eq!(
            container_pnfsid_from_etag("\"ABCDEF_0000000000000001\""),
            Some("ABCDEF".to_string())
        );
    }
}
