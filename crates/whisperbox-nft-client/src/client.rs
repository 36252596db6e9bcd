use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NftClientError;

/// `balanceOf(address)` function selector.
const BALANCE_OF_SELECTOR: &str = "70a08231";

const ADDRESS_HEX_LEN: usize = 40;

/// Upper bound on one ownership query, connect included.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// JSON-RPC primitives
// ============================================================================

#[derive(Serialize)]
struct JsonRpcRequest<P: Serialize> {
    jsonrpc: &'static str,
    id:      u64,
    method:  &'static str,
    params:  P,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error:  Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code:    i64,
    message: String,
}

#[derive(Serialize)]
struct CallObject<'a> {
    to:   &'a str,
    data: String,
}

// ============================================================================
// NftClient
// ============================================================================

/// Minimal JSON-RPC client for querying ERC-721 balances.
///
/// Used by whisperbox-node as the ownership oracle for `nft` whitelists.
pub struct NftClient {
    url:  String,
    http: reqwest::Client,
}

impl NftClient {
    pub fn new(url: &str) -> Result<Self, NftClientError> {
        Self::with_timeout(url, RPC_TIMEOUT)
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self, NftClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NftClientError::Rpc(format!("http client build failed: {e}")))?;
        Ok(Self { url: url.to_owned(), http })
    }

    /// Check whether `owner` holds at least one token of `contract`.
    ///
    /// Returns:
    ///   `Ok(true)`  holds one or more tokens
    ///   `Ok(false)` balance is zero
    ///   `Err(_)`    RPC or decoding failure (caller decides how to treat *unknown*)
    pub async fn owns_asset(&self, owner: &str, contract: &str) -> Result<bool, NftClientError> {
        let contract = normalize_address(contract)?;
        let data = balance_of_calldata(owner)?;

        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id:      1,
            method:  "eth_call",
            params:  (CallObject { to: &contract, data }, "latest"),
        };

        let resp: JsonRpcResponse<String> = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| NftClientError::Rpc(e.to_string()))?
            .json()
            .await
            .map_err(|e| NftClientError::Rpc(format!("response parse error: {e}")))?;

        let result = match (resp.result, resp.error) {
            (_, Some(e)) => return Err(NftClientError::Call { code: e.code, message: e.message }),
            (Some(r), None) => r,
            (None, None) => {
                return Err(NftClientError::MalformedResult("no result and no error".into()))
            }
        };

        decode_balance_is_positive(&result)
    }
}

/// `0x`-prefixed lowercase form of a 20-byte hex address.
fn normalize_address(addr: &str) -> Result<String, NftClientError> {
    let body = addr
        .trim()
        .strip_prefix("0x")
        .or_else(|| addr.trim().strip_prefix("0X"))
        .ok_or_else(|| NftClientError::InvalidAddress(addr.to_string()))?;
    if body.len() != ADDRESS_HEX_LEN || hex::decode(body).is_err() {
        return Err(NftClientError::InvalidAddress(addr.to_string()));
    }
    Ok(format!("0x{}", body.to_ascii_lowercase()))
}

fn balance_of_calldata(owner: &str) -> Result<String, NftClientError> {
    let owner = normalize_address(owner)?;
    Ok(format!("0x{BALANCE_OF_SELECTOR}{:0>64}", &owner[2..]))
}

/// The result is a 32-byte big-endian uint; any non-zero digit means a positive balance.
fn decode_balance_is_positive(result: &str) -> Result<bool, NftClientError> {
    let body = result.strip_prefix("0x").unwrap_or(result);
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(NftClientError::MalformedResult(result.to_string()));
    }
    Ok(body.bytes().any(|b| b != b'0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "0x00000000000000000000000000000000000000AA";

    #[test]
    fn calldata_pads_owner() {
        let data = balance_of_calldata(OWNER).unwrap();
        assert_eq!(data.len(), 2 + 8 + 64);
        assert!(data.starts_with("0x70a08231000000000000000000000000"));
        assert!(data.ends_with("aa"));
    }

    #[test]
    fn eth_call_request_shape() {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id:      1,
            method:  "eth_call",
            params:  (CallObject { to: "0xbb", data: "0x70a08231".into() }, "latest"),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["method"], "eth_call");
        assert_eq!(value["params"][0]["to"], "0xbb");
        assert_eq!(value["params"][1], "latest");
    }

    #[test]
    fn rpc_error_wins_over_result() {
        let resp: JsonRpcResponse<String> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"execution reverted"}}"#,
        )
        .unwrap();
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, -32000);
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(normalize_address("0x1234").is_err());
        assert!(normalize_address("00000000000000000000000000000000000000aa").is_err());
        assert!(normalize_address("0xzz000000000000000000000000000000000000aa").is_err());
    }

    #[test]
    fn balance_decoding() {
        assert!(!decode_balance_is_positive(&format!("0x{}", "0".repeat(64))).unwrap());
        assert!(decode_balance_is_positive(&format!("0x{}1", "0".repeat(63))).unwrap());
        assert!(decode_balance_is_positive("0x").is_err());
        assert!(decode_balance_is_positive("0xnothex").is_err());
    }

    #[tokio::test]
    async fn unreachable_rpc_is_an_error() {
        let client = NftClient::new("http://127.0.0.1:1").unwrap();
        let res = client
            .owns_asset(OWNER, "0x00000000000000000000000000000000000000bb")
            .await;
        assert!(matches!(res, Err(NftClientError::Rpc(_))));
    }

    #[tokio::test]
    async fn silent_rpc_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold connections without ever answering.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client =
            NftClient::with_timeout(&format!("http://{addr}"), Duration::from_millis(200)).unwrap();
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            client.owns_asset(OWNER, "0x00000000000000000000000000000000000000bb"),
        )
        .await
        .expect("rpc call was not bounded by the client timeout");
        assert!(matches!(res, Err(NftClientError::Rpc(_))));
    }
}
