//! Peer identity carried in the WebSocket upgrade request and response

use crate::error::ConnectionError;
use crate::peer_info::{PeerInfo, PeerType};
use std::net::IpAddr;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue, Uri};
use url::Url;

pub const PEER_ID_HEADER: &str = "streamr-peer-id";
pub const PEER_TYPE_HEADER: &str = "streamr-peer-type";
pub const CONTROL_LAYER_VERSIONS_HEADER: &str = "control-layer-versions";
pub const MESSAGE_LAYER_VERSIONS_HEADER: &str = "message-layer-versions";

/// Query parameter carrying the dialling peer's advertised address
pub const ADDRESS_PARAM: &str = "address";

pub const WS_PATH: &str = "/ws";

fn join_versions(versions: &[u32]) -> String {
    versions
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_versions(header: &str, value: &str) -> Result<Vec<u32>, ConnectionError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse().map_err(|_| {
                ConnectionError::Transport(format!("invalid {} header: {}", header, value))
            })
        })
        .collect()
}

/// Add our identity headers to an upgrade request or response
pub fn write_headers(headers: &mut HeaderMap, peer_info: &PeerInfo) -> Result<(), ConnectionError> {
    let entries = [
        (PEER_ID_HEADER, peer_info.peer_id.clone()),
        (PEER_TYPE_HEADER, peer_info.peer_type.as_str().to_string()),
        (
            CONTROL_LAYER_VERSIONS_HEADER,
            join_versions(&peer_info.control_layer_versions),
        ),
        (
            MESSAGE_LAYER_VERSIONS_HEADER,
            join_versions(&peer_info.message_layer_versions),
        ),
    ];

    for (name, value) in entries {
        let value = HeaderValue::from_str(&value).map_err(|_| {
            ConnectionError::Transport(format!("value of {} is not a valid header", name))
        })?;
        headers.insert(name, value);
    }
    Ok(())
}

fn required<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ConnectionError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConnectionError::MissingParameter(name.to_string()))
}

/// Read the remote identity from upgrade headers.
///
/// Every header is required; the first one missing is reported as a
/// `MissingParameter` error.
pub fn read_headers(headers: &HeaderMap) -> Result<PeerInfo, ConnectionError> {
    let peer_id = required(headers, PEER_ID_HEADER)?;
    let peer_type = required(headers, PEER_TYPE_HEADER)?;
    let control_layer_versions = required(headers, CONTROL_LAYER_VERSIONS_HEADER)?;
    let message_layer_versions = required(headers, MESSAGE_LAYER_VERSIONS_HEADER)?;

    Ok(PeerInfo::new(
        peer_id,
        PeerType::from(peer_type),
        parse_versions(CONTROL_LAYER_VERSIONS_HEADER, control_layer_versions)?,
        parse_versions(MESSAGE_LAYER_VERSIONS_HEADER, message_layer_versions)?,
    ))
}

/// URL for dialling `peer_address`, announcing `self_address`:
/// `ws(s)://host:port/ws?address=<self_address>`
pub fn build_url(peer_address: &str, self_address: &str) -> Result<Url, ConnectionError> {
    let mut url = Url::parse(peer_address).map_err(|e| {
        ConnectionError::Transport(format!("invalid peer address {}: {}", peer_address, e))
    })?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(ConnectionError::Transport(format!(
            "peer address must use ws:// or wss://, got {}",
            peer_address
        )));
    }
    url.set_path(WS_PATH);
    url.query_pairs_mut()
        .clear()
        .append_pair(ADDRESS_PARAM, self_address);
    Ok(url)
}

/// Advertised address of the dialling peer, from the upgrade request URI
pub fn address_from_uri(uri: &Uri) -> Result<String, ConnectionError> {
    let query = uri.query().unwrap_or_default();
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == ADDRESS_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConnectionError::MissingParameter(ADDRESS_PARAM.to_string()))
}

/// Scheme, host and port of `address`, without path or query.
///
/// Both sides compare these strings for the duplicate socket tie-break.
pub fn canonical_address(address: &str) -> Result<String, ConnectionError> {
    let url = Url::parse(address)
        .map_err(|e| ConnectionError::Transport(format!("invalid address {}: {}", address, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| ConnectionError::Transport(format!("address {} has no host", address)))?;
    match url.port_or_known_default() {
        Some(port) => Ok(format!("{}://{}:{}", url.scheme(), host, port)),
        None => Ok(format!("{}://{}", url.scheme(), host)),
    }
}

/// Address to advertise for a listener on `host:port` when none is
/// configured. IPv6 hosts are bracketed.
pub fn listen_address(host: &str, port: u16) -> Result<String, ConnectionError> {
    let host = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{}]", ip),
        _ => host.to_string(),
    };
    canonical_address(&format!("ws://{}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_round_trip() {
        let peer_info = PeerInfo::new("node-1", PeerType::Node, vec![1, 2], vec![31, 32]);
        let mut headers = HeaderMap::new();
        write_headers(&mut headers, &peer_info).unwrap();

        assert_eq!(headers.get(CONTROL_LAYER_VERSIONS_HEADER).unwrap(), "1,2");
        assert_eq!(headers.get(PEER_TYPE_HEADER).unwrap(), "node");
        assert_eq!(read_headers(&headers).unwrap(), peer_info);
    }

    #[test]
    fn test_missing_header_is_reported() {
        let mut headers = HeaderMap::new();
        write_headers(&mut headers, &PeerInfo::new_node("node-1")).unwrap();
        headers.remove(MESSAGE_LAYER_VERSIONS_HEADER);

        assert_eq!(
            read_headers(&headers),
            Err(ConnectionError::MissingParameter(
                MESSAGE_LAYER_VERSIONS_HEADER.to_string()
            ))
        );
    }

    #[test]
    fn test_build_url_and_extract_address() {
        let url = build_url("ws://127.0.0.1:30301", "ws://127.0.0.1:30300").unwrap();
        assert_eq!(url.path(), "/ws");

        let uri: Uri = url.as_str().parse().unwrap();
        assert_eq!(address_from_uri(&uri).unwrap(), "ws://127.0.0.1:30300");
    }

    #[test]
    fn test_missing_address_param() {
        let uri: Uri = "/ws".parse().unwrap();
        assert_eq!(
            address_from_uri(&uri),
            Err(ConnectionError::MissingParameter("address".to_string()))
        );
    }

    #[test]
    fn test_canonical_address() {
        assert_eq!(
            canonical_address("ws://localhost:30300/ws?address=x").unwrap(),
            "ws://localhost:30300"
        );
        assert_eq!(canonical_address("wss://example.com").unwrap(), "wss://example.com:443");
        assert!(build_url("http://localhost:1", "ws://localhost:2").is_err());
    }

    #[test]
    fn test_listen_address_is_canonical() {
        assert_eq!(listen_address("127.0.0.1", 30300).unwrap(), "ws://127.0.0.1:30300");
        assert_eq!(listen_address("::1", 30300).unwrap(), "ws://[::1]:30300");
        assert_eq!(listen_address("LocalHost", 80).unwrap(), "ws://localhost:80");

        let address = listen_address("0:0:0:0:0:0:0:1", 1).unwrap();
        assert_eq!(canonical_address(&address).unwrap(), address);
    }
}
